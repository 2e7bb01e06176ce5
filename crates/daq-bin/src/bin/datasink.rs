//! Demo consumer device: counts frames received on one input end-point and
//! reports the tally on `/stop`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use daq_core::shutdown;
use daq_device::Device;

#[derive(Parser)]
#[command(name = "daq-datasink")]
#[command(about = "Demo DAQ consumer counting received frames", long_about = None)]
struct Cli {
    /// Run-control address
    #[arg(long, default_value = "127.0.0.1:44000")]
    rc: String,

    /// Device name announced to run-control
    #[arg(long, default_value = "data-sink")]
    name: String,

    /// Input end-point name
    #[arg(long, default_value = "/adc")]
    input: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let count = Arc::new(AtomicU64::new(0));

    let mut dev = Device::new(&cli.rc, &cli.name);

    dev.cmd_handle("/init", {
        let count = count.clone();
        move |ctx, _req| {
            let count = count.clone();
            async move {
                debug!(device = %ctx.device(), "received /init command...");
                count.store(0, Ordering::Relaxed);
                Ok(())
            }
        }
    });
    dev.cmd_handle("/reset", {
        let count = count.clone();
        move |ctx, _req| {
            let count = count.clone();
            async move {
                debug!(device = %ctx.device(), "received /reset command...");
                count.store(0, Ordering::Relaxed);
                Ok(())
            }
        }
    });
    dev.cmd_handle("/stop", {
        let count = count.clone();
        move |ctx, _req| {
            let count = count.clone();
            async move {
                info!(
                    device = %ctx.device(),
                    frames = count.load(Ordering::Relaxed),
                    "run stopped"
                );
                Ok(())
            }
        }
    });

    dev.input_handle(&cli.input, {
        let count = count.clone();
        move |_ctx, frame| {
            let count = count.clone();
            async move {
                let n = count.fetch_add(1, Ordering::Relaxed) + 1;
                if n % 100 == 0 {
                    debug!(frames = n, bytes = frame.body.len(), "receiving");
                }
                Ok(())
            }
        }
    });

    let (trigger, sd) = shutdown::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        trigger.trigger();
    });

    dev.run(sd).await
}

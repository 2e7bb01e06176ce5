//! Demo producer device: emits a stream of little-endian i64 samples on
//! one output end-point while running.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use daq_core::shutdown;
use daq_device::Device;
use daq_wire::Frame;

#[derive(Parser)]
#[command(name = "daq-datasrc")]
#[command(about = "Demo DAQ producer emitting i64 samples", long_about = None)]
struct Cli {
    /// Run-control address
    #[arg(long, default_value = "127.0.0.1:44000")]
    rc: String,

    /// Device name announced to run-control
    #[arg(long, default_value = "data-src")]
    name: String,

    /// Output end-point name
    #[arg(long, default_value = "/adc")]
    output: String,

    /// Sample period in milliseconds
    #[arg(long, default_value_t = 100)]
    rate_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(1024);
    let data_rx = Arc::new(Mutex::new(data_rx));
    let period = Duration::from_millis(cli.rate_ms);

    let mut dev = Device::new(&cli.rc, &cli.name);

    dev.cmd_handle("/config", |ctx, _req| async move {
        debug!(device = %ctx.device(), "received /config command...");
        Ok(())
    });
    dev.cmd_handle("/init", |ctx, _req| async move {
        debug!(device = %ctx.device(), "received /init command...");
        Ok(())
    });
    dev.cmd_handle("/term", |ctx, _req| async move {
        debug!(device = %ctx.device(), "received /term command...");
        Ok(())
    });

    dev.output_handle(&cli.output, {
        let data_rx = data_rx.clone();
        move |ctx| {
            let data_rx = data_rx.clone();
            async move {
                let mut frame = Frame::default();
                let mut rx = data_rx.lock().await;
                tokio::select! {
                    _ = ctx.cancelled() => {}
                    sample = rx.recv() => {
                        if let Some(sample) = sample {
                            frame.body = sample;
                        }
                    }
                }
                Ok(frame)
            }
        }
    });

    dev.run_handle(move |ctx| {
        let data_tx = data_tx.clone();
        async move {
            let mut n: i64 = 0;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        debug!(device = %ctx.device(), samples = n, "run finished");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(period) => {
                        // Drop samples when the output is saturated.
                        let _ = data_tx.try_send(n.to_le_bytes().to_vec());
                        n += 1;
                    }
                }
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

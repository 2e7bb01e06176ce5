//! Interactive run-control operator console.
//!
//! Binds the run-control listener, then drives lifecycle transitions from
//! stdin: `config init reset start stop term status quit`.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use daq_core::shutdown;
use daq_runctl::RunControl;

#[derive(Parser)]
#[command(name = "daq-runctl")]
#[command(about = "Run-control coordinator for a DAQ device fleet", long_about = None)]
struct Cli {
    /// Control-plane listen address (host:0 picks a free port)
    #[arg(long, default_value = "127.0.0.1:44000")]
    addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let rc = Arc::new(RunControl::bind(&cli.addr).await?);
    info!(addr = %rc.local_addr(), "run-control up");

    let (trigger, sd) = shutdown::channel();
    let accept = tokio::spawn({
        let rc = rc.clone();
        async move { rc.run(sd).await }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "config" => report(rc.do_config().await),
                    "init" => report(rc.do_init().await),
                    "reset" => report(rc.do_reset().await),
                    "start" => report(rc.do_start().await),
                    "stop" => report(rc.do_stop().await),
                    "term" => report(rc.do_term().await),
                    "status" => {
                        for (name, status) in rc.devices() {
                            println!("{name}: {status}");
                        }
                    }
                    "quit" | "exit" => break,
                    other => {
                        eprintln!("unknown command {other:?} (config|init|reset|start|stop|term|status|quit)");
                    }
                }
            }
        }
    }

    trigger.trigger();
    let _ = accept.await;
    Ok(())
}

fn report(result: Result<()>) {
    match result {
        Ok(()) => println!("ok"),
        Err(e) => eprintln!("failed: {e:#}"),
    }
}

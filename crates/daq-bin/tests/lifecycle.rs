//! End-to-end lifecycle tests on loopback: a run-control instance plus a
//! producer/consumer pair exercising join, config wiring, start/stop runs
//! and termination over real TCP sockets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

use daq_core::fsm::Status;
use daq_core::shutdown::{self, Shutdown};
use daq_device::Device;
use daq_runctl::RunControl;
use daq_wire::Frame;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Producer emitting 1 KiB of random bytes every few milliseconds while
/// running, via a run handler feeding the output handler through a channel.
fn make_producer(rc_addr: &str) -> Device {
    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(1024);
    let data_rx = Arc::new(Mutex::new(data_rx));

    let mut dev = Device::new(rc_addr, "data-src");
    dev.cmd_handle("/config", |_ctx, _req| async { Ok(()) });
    dev.cmd_handle("/init", |_ctx, _req| async { Ok(()) });
    dev.cmd_handle("/reset", |_ctx, _req| async { Ok(()) });
    dev.cmd_handle("/start", |_ctx, _req| async { Ok(()) });
    dev.cmd_handle("/stop", |_ctx, _req| async { Ok(()) });
    dev.cmd_handle("/term", |_ctx, _req| async { Ok(()) });

    dev.output_handle("/adc", {
        let data_rx = data_rx.clone();
        move |ctx| {
            let data_rx = data_rx.clone();
            async move {
                let mut frame = Frame::default();
                let mut rx = data_rx.lock().await;
                tokio::select! {
                    _ = ctx.cancelled() => {}
                    data = rx.recv() => {
                        if let Some(data) = data {
                            frame.body = data;
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
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return Ok(()),
                    _ = sleep(Duration::from_millis(5)) => {
                        let mut raw = vec![0u8; 1024];
                        rand::thread_rng().fill_bytes(&mut raw);
                        let _ = data_tx.try_send(raw);
                    }
                }
            }
        }
    });

    dev
}

/// Consumer counting received frames; optionally fails `/init`.
fn make_consumer(rc_addr: &str, fail_init: bool) -> (Device, Arc<AtomicU64>) {
    let count = Arc::new(AtomicU64::new(0));
    let mut dev = Device::new(rc_addr, "data-sink");

    if fail_init {
        dev.cmd_handle("/init", |_ctx, _req| async { anyhow::bail!("boom") });
    } else {
        dev.cmd_handle("/init", {
            let count = count.clone();
            move |_ctx, _req| {
                let count = count.clone();
                async move {
                    count.store(0, Ordering::Relaxed);
                    Ok(())
                }
            }
        });
    }
    dev.cmd_handle("/reset", {
        let count = count.clone();
        move |_ctx, _req| {
            let count = count.clone();
            async move {
                count.store(0, Ordering::Relaxed);
                Ok(())
            }
        }
    });
    dev.cmd_handle("/stop", |_ctx, _req| async { Ok(()) });

    dev.input_handle("/adc", {
        let count = count.clone();
        move |_ctx, _frame| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    });

    (dev, count)
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn spawn_rc(rc: Arc<RunControl>) -> (shutdown::Trigger, tokio::task::JoinHandle<()>) {
    let (trigger, sd) = shutdown::channel();
    let task = tokio::spawn(async move {
        rc.run(sd).await.expect("run-control failed");
    });
    (trigger, task)
}

fn spawn_device(dev: Device, sd: Shutdown) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    tokio::spawn(dev.run(sd))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_and_full_lifecycle() {
    init_tracing();

    let rc = Arc::new(RunControl::bind("127.0.0.1:0").await.unwrap());
    let rc_addr = rc.local_addr().to_string();
    let (rc_trigger, rc_task) = spawn_rc(rc.clone());

    // Triggers held for the whole test: dropping one counts as shutdown.
    let (_src_trigger, src_sd) = shutdown::channel();
    let (_sink_trigger, sink_sd) = shutdown::channel();
    let producer = spawn_device(make_producer(&rc_addr), src_sd);
    let (sink, count) = make_consumer(&rc_addr, false);
    let consumer = spawn_device(sink, sink_sd);

    {
        let rc = rc.clone();
        wait_until(move || rc.num_devices() == 2, "both devices to join").await;
    }

    for (what, pause) in [
        ("config", 20),
        ("init", 20),
        ("reset", 10),
        ("config", 20),
        ("init", 20),
        ("start", 400),
        ("stop", 10),
        ("start", 400),
        ("stop", 10),
        ("term", 0),
    ] {
        let result = match what {
            "config" => rc.do_config().await,
            "init" => rc.do_init().await,
            "reset" => rc.do_reset().await,
            "start" => rc.do_start().await,
            "stop" => rc.do_stop().await,
            "term" => rc.do_term().await,
            other => unreachable!("{other}"),
        };
        result.unwrap_or_else(|e| panic!("could not run {what}: {e:#}"));
        sleep(Duration::from_millis(pause)).await;
    }

    // Both devices exit cleanly on /term.
    timeout(Duration::from_secs(5), producer)
        .await
        .expect("producer did not exit after /term")
        .expect("producer task panicked")
        .expect("producer run failed");
    timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consumer did not exit after /term")
        .expect("consumer task panicked")
        .expect("consumer run failed");

    assert!(
        count.load(Ordering::Relaxed) > 0,
        "consumer received no frames"
    );
    assert_eq!(rc.device_status("data-src"), Some(Status::Exiting));
    assert_eq!(rc.device_status("data-sink"), Some(Status::Exiting));

    rc_trigger.trigger();
    let _ = rc_task.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_join_is_rejected() {
    init_tracing();

    let rc = Arc::new(RunControl::bind("127.0.0.1:0").await.unwrap());
    let rc_addr = rc.local_addr().to_string();
    let (rc_trigger, rc_task) = spawn_rc(rc.clone());

    let (first_trigger, first_sd) = shutdown::channel();
    let first = spawn_device(Device::new(&rc_addr, "dup"), first_sd);
    {
        let rc = rc.clone();
        wait_until(move || rc.num_devices() == 1, "first device to join").await;
    }

    let (_second_trigger, second_sd) = shutdown::channel();
    let second = spawn_device(Device::new(&rc_addr, "dup"), second_sd);
    let err = timeout(Duration::from_secs(5), second)
        .await
        .expect("second device did not observe the rejection")
        .expect("second device task panicked")
        .expect_err("duplicate name must be refused");
    assert!(
        err.to_string().contains("refused"),
        "unexpected error: {err:#}"
    );
    assert_eq!(rc.num_devices(), 1);

    first_trigger.trigger();
    let _ = timeout(Duration::from_secs(5), first).await;
    rc_trigger.trigger();
    let _ = rc_task.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_after_lifecycle_start_is_rejected() {
    init_tracing();

    let rc = Arc::new(RunControl::bind("127.0.0.1:0").await.unwrap());
    let rc_addr = rc.local_addr().to_string();
    let (rc_trigger, rc_task) = spawn_rc(rc.clone());

    let (alpha_trigger, alpha_sd) = shutdown::channel();
    let alpha = spawn_device(Device::new(&rc_addr, "alpha"), alpha_sd);
    {
        let rc = rc.clone();
        wait_until(move || rc.num_devices() == 1, "alpha to join").await;
    }

    rc.do_config().await.unwrap();

    let (_beta_trigger, beta_sd) = shutdown::channel();
    let beta = spawn_device(Device::new(&rc_addr, "beta"), beta_sd);
    let err = timeout(Duration::from_secs(5), beta)
        .await
        .expect("beta did not observe the rejection")
        .expect("beta task panicked")
        .expect_err("late join must be refused");
    assert!(
        err.to_string().contains("refused"),
        "unexpected error: {err:#}"
    );
    assert_eq!(rc.num_devices(), 1);

    alpha_trigger.trigger();
    let _ = timeout(Duration::from_secs(5), alpha).await;
    rc_trigger.trigger();
    let _ = rc_task.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handler_error_fails_the_transition() {
    init_tracing();

    let rc = Arc::new(RunControl::bind("127.0.0.1:0").await.unwrap());
    let rc_addr = rc.local_addr().to_string();
    let (rc_trigger, rc_task) = spawn_rc(rc.clone());

    let (_src_trigger, src_sd) = shutdown::channel();
    let producer = spawn_device(make_producer(&rc_addr), src_sd);
    let (sink, _count) = make_consumer(&rc_addr, true);
    let (_sink_trigger, sink_sd) = shutdown::channel();
    let consumer = spawn_device(sink, sink_sd);

    {
        let rc = rc.clone();
        wait_until(move || rc.num_devices() == 2, "both devices to join").await;
    }

    rc.do_config().await.unwrap();
    let err = rc.do_init().await.expect_err("consumer /init must fail");
    assert!(
        err.to_string().contains("data-sink"),
        "aggregate must name the failing device: {err:#}"
    );
    assert_eq!(rc.device_status("data-sink"), Some(Status::Error));
    assert_eq!(rc.device_status("data-src"), Some(Status::Init));

    // The fleet is not torn down; /term still reaches both devices.
    rc.do_term().await.unwrap();
    timeout(Duration::from_secs(5), producer)
        .await
        .expect("producer did not exit")
        .expect("producer task panicked")
        .expect("producer run failed");
    timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consumer did not exit")
        .expect("consumer task panicked")
        .expect("consumer run failed");

    rc_trigger.trigger();
    let _ = rc_task.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_cancels_a_device_waiting_for_run_control() {
    init_tracing();

    // No run-control listening: the device sits in its dial-retry loop
    // until the shutdown signal fires, then returns promptly and cleanly.
    let (trigger, sd) = shutdown::channel();
    let dev = spawn_device(Device::new("127.0.0.1:1", "lonely"), sd);

    sleep(Duration::from_millis(50)).await;
    trigger.trigger();

    timeout(Duration::from_secs(2), dev)
        .await
        .expect("device did not observe shutdown in time")
        .expect("device task panicked")
        .expect("shutdown is not an error");
}

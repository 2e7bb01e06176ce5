//! Run-control: the coordinator of a device fleet.
//!
//! Run-control accepts device connections, reads each one's `/join`
//! announcement, and keeps an ordered-by-join-time view of the fleet. An
//! operator (or a scripted sequence) then drives lifecycle transitions:
//! each driver fans the command out to every device in parallel, awaits the
//! `/status` replies under a bounded timeout and aggregates the outcome.
//!
//! `do_config` additionally wires the data plane: for every declared input
//! it looks up the producer output with the same end-point name and embeds
//! the producer's address into that device's `/config` echo.
//!
//! Run-control keeps no state beyond the currently joined devices and the
//! last known status of each; a failed transition marks the failing devices
//! `Error` but does not tear down the rest of the fleet.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use daq_core::endpoint::EndPoint;
use daq_core::error::DaqError;
use daq_core::fsm::Status;
use daq_core::shutdown::Shutdown;
use daq_wire::{
    recv_cmd, recv_frame, send_frame, Cmd, CmdType, Command, ConfigCmd, Frame, JoinCmd, LogCmd,
    LogLevel, StatusCmd, CMD_CONFIG, CMD_INIT, CMD_JOIN, CMD_LOG, CMD_RESET, CMD_START,
    CMD_STATUS, CMD_STOP, CMD_TERM,
};

/// How long a connecting device has to present its `/join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on waiting for a device's `/status` reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Control frames queued towards each device's writer task.
const CTRL_QUEUE: usize = 8;

/// Book-keeping for one joined device.
#[derive(Clone)]
struct DeviceEntry {
    name: String,
    status: Status,
    in_ports: Vec<EndPoint>,
    out_ports: Vec<EndPoint>,
    cmd_tx: mpsc::Sender<Frame>,
    reply_rx: Arc<AsyncMutex<mpsc::Receiver<StatusCmd>>>,
}

/// The run-control coordinator.
pub struct RunControl {
    listener: TcpListener,
    addr: SocketAddr,
    devices: Arc<RwLock<Vec<DeviceEntry>>>,
    started: Arc<AtomicBool>,
    reply_timeout: Duration,
}

impl RunControl {
    /// Binds the control-plane listener; `host:0` picks a free port.
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding run-control listener on {addr}"))?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            devices: Arc::new(RwLock::new(Vec::new())),
            started: Arc::new(AtomicBool::new(false)),
            reply_timeout: REPLY_TIMEOUT,
        })
    }

    /// Overrides the per-device reply timeout of the lifecycle drivers.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of currently joined devices.
    pub fn num_devices(&self) -> usize {
        self.devices.read().len()
    }

    /// Last known status of a device, if joined.
    pub fn device_status(&self, name: &str) -> Option<Status> {
        self.devices
            .read()
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.status)
    }

    /// Snapshot of the fleet in join order.
    pub fn devices(&self) -> Vec<(String, Status)> {
        self.devices
            .read()
            .iter()
            .map(|d| (d.name.clone(), d.status))
            .collect()
    }

    /// Accepts device connections until shutdown. Each accepted socket gets
    /// a handshake task that reads the `/join`, applies admission control
    /// and, on success, spawns the connection's reader and writer tasks.
    pub async fn run(&self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        info!(addr = %self.addr, "run-control listening");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("run-control shutting down");
                    return Ok(());
                }
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_join(
                            stream,
                            peer,
                            self.devices.clone(),
                            self.started.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }
    }

    /// `/config`: wires producer addresses into each device's declared
    /// inputs and drives the transition.
    pub async fn do_config(&self) -> anyhow::Result<()> {
        let snapshot: Vec<DeviceEntry> = self.devices.read().clone();
        let mut frames = Vec::with_capacity(snapshot.len());
        for dev in &snapshot {
            let cfg = ConfigCmd {
                name: dev.name.clone(),
                in_ports: wire_inputs(dev, &snapshot),
                out_ports: dev.out_ports.clone(),
            };
            frames.push((dev.clone(), cfg.to_frame()?));
        }
        self.transition(CMD_CONFIG, frames).await
    }

    pub async fn do_init(&self) -> anyhow::Result<()> {
        self.simple_transition(CMD_INIT).await
    }

    pub async fn do_reset(&self) -> anyhow::Result<()> {
        self.simple_transition(CMD_RESET).await
    }

    pub async fn do_start(&self) -> anyhow::Result<()> {
        self.simple_transition(CMD_START).await
    }

    pub async fn do_stop(&self) -> anyhow::Result<()> {
        self.simple_transition(CMD_STOP).await
    }

    pub async fn do_term(&self) -> anyhow::Result<()> {
        self.simple_transition(CMD_TERM).await
    }

    async fn simple_transition(&self, ctype: CmdType) -> anyhow::Result<()> {
        let snapshot: Vec<DeviceEntry> = self.devices.read().clone();
        let frames = snapshot
            .into_iter()
            .map(|dev| {
                let frame = Frame::command(ctype);
                (dev, frame)
            })
            .collect();
        self.transition(ctype, frames).await
    }

    /// Fans one command out to every device, awaits the `/status` replies
    /// in parallel and aggregates. Succeeds iff every device reports a
    /// non-error state in time; failing devices are marked `Error`.
    async fn transition(
        &self,
        ctype: CmdType,
        frames: Vec<(DeviceEntry, Frame)>,
    ) -> anyhow::Result<()> {
        // From the first transition on, late joiners are refused.
        self.started.store(true, Ordering::SeqCst);
        let path = ctype.path();
        if frames.is_empty() {
            bail!("{path}: no devices joined");
        }
        debug!(%path, devices = frames.len(), "transition requested");

        let reply_timeout = self.reply_timeout;
        let results = join_all(frames.into_iter().map(|(dev, frame)| async move {
            let result = drive_device(&dev, frame, reply_timeout).await;
            (dev.name, result)
        }))
        .await;

        let mut failed = Vec::new();
        for (name, result) in results {
            match result {
                Ok(status) => {
                    debug!(device = %name, %status, "transition acknowledged");
                }
                Err(e) => {
                    warn!(device = %name, %path, "transition failed: {e:#}");
                    self.mark_error(&name);
                    failed.push(format!("{name}: {e}"));
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{path} failed for [{}]", failed.join("; ")))
        }
    }

    fn mark_error(&self, name: &str) {
        let mut devices = self.devices.write();
        if let Some(dev) = devices.iter_mut().find(|d| d.name == name) {
            dev.status = Status::Error;
        }
    }
}

/// Sends one command to one device and awaits its `/status` reply.
async fn drive_device(
    dev: &DeviceEntry,
    frame: Frame,
    reply_timeout: Duration,
) -> anyhow::Result<Status> {
    // Hold the reply slot for the whole exchange and drop stale replies
    // left over from a timed-out transition.
    let mut reply_rx = dev.reply_rx.lock().await;
    while reply_rx.try_recv().is_ok() {}

    dev.cmd_tx
        .send(frame)
        .await
        .map_err(|_| anyhow!("control connection closed"))?;

    match timeout(reply_timeout, reply_rx.recv()).await {
        Ok(Some(reply)) if reply.status != Status::Error => Ok(reply.status),
        Ok(Some(reply)) => Err(anyhow!("device reported {}", reply.status)),
        Ok(None) => Err(anyhow!("control connection closed")),
        Err(_) => Err(DaqError::Timeout(format!("status reply after {reply_timeout:?}")).into()),
    }
}

/// Producer addresses for each of `dev`'s declared inputs, looked up by
/// end-point name across the other devices' outputs.
fn wire_inputs(dev: &DeviceEntry, all: &[DeviceEntry]) -> Vec<EndPoint> {
    dev.in_ports
        .iter()
        .map(|p| {
            let producer = all
                .iter()
                .filter(|other| other.name != dev.name)
                .flat_map(|other| other.out_ports.iter())
                .find(|out| out.name == p.name);
            match producer {
                Some(out) => EndPoint {
                    name: p.name.clone(),
                    addr: out.addr.clone(),
                    kind: p.kind.clone(),
                },
                None => {
                    warn!(device = %dev.name, port = %p.name, "no producer for input");
                    p.clone()
                }
            }
        })
        .collect()
}

/// Handshake for one accepted connection: `/join` under a timeout,
/// admission control, then reader/writer task spawn.
async fn handle_join(
    mut stream: TcpStream,
    peer: SocketAddr,
    devices: Arc<RwLock<Vec<DeviceEntry>>>,
    started: Arc<AtomicBool>,
    shutdown: Shutdown,
) {
    let cmd = match timeout(JOIN_TIMEOUT, recv_cmd(&mut stream)).await {
        Ok(Ok(cmd)) => cmd,
        Ok(Err(e)) => {
            warn!(%peer, "handshake failed: {e}");
            return;
        }
        Err(_) => {
            warn!(%peer, "no /join within {JOIN_TIMEOUT:?}");
            return;
        }
    };
    if cmd.ctype != CMD_JOIN {
        reject(&mut stream, peer, "expected /join").await;
        return;
    }
    let join = match JoinCmd::unmarshal(&cmd.body) {
        Ok(join) => join,
        Err(e) => {
            reject(&mut stream, peer, &format!("malformed /join: {e}")).await;
            return;
        }
    };

    // Admission control under the write lock; channel ends are created
    // inside so a winning join is registered atomically.
    let admitted = {
        let mut devs = devices.write();
        if started.load(Ordering::SeqCst) {
            Err(DaqError::LateJoin)
        } else if devs.iter().any(|d| d.name == join.name) {
            Err(DaqError::DuplicateDevice(join.name.clone()))
        } else {
            let (cmd_tx, cmd_rx) = mpsc::channel(CTRL_QUEUE);
            let (reply_tx, reply_rx) = mpsc::channel(CTRL_QUEUE);
            devs.push(DeviceEntry {
                name: join.name.clone(),
                status: Status::UnConf,
                in_ports: join.in_ports.clone(),
                out_ports: join.out_ports.clone(),
                cmd_tx,
                reply_rx: Arc::new(AsyncMutex::new(reply_rx)),
            });
            Ok((cmd_rx, reply_tx))
        }
    };

    match admitted {
        Err(e) => reject(&mut stream, peer, &e.to_string()).await,
        Ok((cmd_rx, reply_tx)) => {
            info!(device = %join.name, %peer, inputs = join.in_ports.len(), outputs = join.out_ports.len(), "device joined");
            let (rd, wr) = stream.into_split();
            tokio::spawn(write_loop(join.name.clone(), wr, cmd_rx));
            tokio::spawn(read_loop(join.name, rd, devices, reply_tx, shutdown));
        }
    }
}

async fn reject(stream: &mut TcpStream, peer: SocketAddr, reason: &str) {
    warn!(%peer, "join rejected: {reason}");
    let _ = send_frame(stream, &Frame::error(reason)).await;
}

async fn write_loop(name: String, mut wr: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    use tokio::io::AsyncWriteExt;
    while let Some(frame) = rx.recv().await {
        if let Err(e) = send_frame(&mut wr, &frame).await {
            debug!(device = %name, "control write failed: {e}");
            return;
        }
    }
    let _ = wr.shutdown().await;
}

/// Owns the read half of one device's control connection: status replies
/// update the fleet view and wake the pending driver, `/log` records are
/// re-emitted locally.
async fn read_loop(
    name: String,
    mut rd: OwnedReadHalf,
    devices: Arc<RwLock<Vec<DeviceEntry>>>,
    reply_tx: mpsc::Sender<StatusCmd>,
    mut shutdown: Shutdown,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => return,
            res = recv_frame(&mut rd) => match res {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(device = %name, "control connection closed: {e}");
                    break;
                }
            },
        };
        let cmd = match Cmd::from_frame(&frame) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(device = %name, "bad frame from device: {e}");
                break;
            }
        };
        match cmd.ctype {
            CMD_STATUS => match StatusCmd::unmarshal(&cmd.body) {
                Ok(status) => {
                    {
                        let mut devs = devices.write();
                        if let Some(dev) = devs.iter_mut().find(|d| d.name == name) {
                            dev.status = status.status;
                        }
                    }
                    // A reply nobody is waiting for is stale; drop it.
                    let _ = reply_tx.try_send(status);
                }
                Err(e) => warn!(device = %name, "malformed /status: {e}"),
            },
            CMD_LOG => match LogCmd::unmarshal(&cmd.body) {
                Ok(log) => emit_device_log(&log),
                Err(e) => warn!(device = %name, "malformed /log: {e}"),
            },
            other => {
                warn!(device = %name, cmd = %other, "unexpected command from device");
            }
        }
    }

    // Disconnected. Losing a running device is an error; a device that was
    // already exiting simply left.
    let mut devs = devices.write();
    if let Some(dev) = devs.iter_mut().find(|d| d.name == name) {
        if dev.status == Status::Running {
            warn!(device = %name, "device lost while running");
            dev.status = Status::Error;
        } else {
            debug!(device = %name, status = %dev.status, "device disconnected");
        }
    }
}

fn emit_device_log(log: &LogCmd) {
    match log.level {
        LogLevel::Debug => debug!(device = %log.name, "{}", log.msg),
        LogLevel::Info => info!(device = %log.name, "{}", log.msg),
        LogLevel::Warn => warn!(device = %log.name, "{}", log.msg),
        LogLevel::Error => tracing::error!(device = %log.name, "{}", log.msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, in_ports: Vec<EndPoint>, out_ports: Vec<EndPoint>) -> DeviceEntry {
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let (_reply_tx, reply_rx) = mpsc::channel(1);
        DeviceEntry {
            name: name.into(),
            status: Status::UnConf,
            in_ports,
            out_ports,
            cmd_tx,
            reply_rx: Arc::new(AsyncMutex::new(reply_rx)),
        }
    }

    fn out(name: &str, addr: &str) -> EndPoint {
        EndPoint {
            name: name.into(),
            addr: addr.into(),
            kind: String::new(),
        }
    }

    #[test]
    fn test_wire_inputs_finds_matching_producer() {
        let producer = entry("data-src", vec![], vec![out("/adc", "127.0.0.1:4001")]);
        let consumer = entry("data-sink", vec![EndPoint::named("/adc")], vec![]);
        let all = vec![producer, consumer.clone()];

        let wired = wire_inputs(&consumer, &all);
        assert_eq!(wired.len(), 1);
        assert_eq!(wired[0].name, "/adc");
        assert_eq!(wired[0].addr, "127.0.0.1:4001");
    }

    #[test]
    fn test_wire_inputs_ignores_own_outputs() {
        // A device with a same-named input and output must not be wired to
        // itself.
        let filter = entry(
            "filter",
            vec![EndPoint::named("/adc")],
            vec![out("/adc", "127.0.0.1:5000")],
        );
        let producer = entry("data-src", vec![], vec![out("/adc", "127.0.0.1:4001")]);
        let all = vec![filter.clone(), producer];

        let wired = wire_inputs(&filter, &all);
        assert_eq!(wired[0].addr, "127.0.0.1:4001");
    }

    #[test]
    fn test_wire_inputs_leaves_unmatched_input_bare() {
        let consumer = entry("data-sink", vec![EndPoint::named("/tdc")], vec![]);
        let producer = entry("data-src", vec![], vec![out("/adc", "127.0.0.1:4001")]);
        let all = vec![producer, consumer.clone()];

        let wired = wire_inputs(&consumer, &all);
        assert_eq!(wired.len(), 1);
        assert_eq!(wired[0].name, "/tdc");
        assert!(wired[0].addr.is_empty());
    }
}

//! The device runtime: control connection, command dispatch, run scheduler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use daq_core::endpoint::EndPoint;
use daq_core::error::DaqError;
use daq_core::fsm::{Status, Step};
use daq_core::shutdown::{self, Shutdown, Trigger};
use daq_wire::{
    recv_frame, send_frame, Cmd, Command, ConfigCmd, Frame, FrameType, JoinCmd, LogCmd, LogLevel,
    StatusCmd, CMD_CONFIG, CMD_INIT, CMD_RESET, CMD_START, CMD_STATUS, CMD_STOP, CMD_TERM,
};

use crate::context::Context;
use crate::handler::{self, CmdHandler, InputHandler, OutputHandler, RunHandler};
use crate::port::OutputPort;

/// Delay between control-plane dial attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Control frames queued towards the writer task.
const CTRL_QUEUE: usize = 8;

/// Data-plane failure reports queued towards the dispatch loop.
const ERR_QUEUE: usize = 16;

/// How long a cancelled run task may take before it is aborted.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// A device process: handler registries plus the run loop driving them.
///
/// Registries are populated before [`Device::run`] and frozen afterwards;
/// registering two handlers for the same key is a programmer error and
/// panics.
pub struct Device {
    name: String,
    rc_addr: String,
    cmd_handlers: HashMap<String, CmdHandler>,
    input_handlers: HashMap<String, InputHandler>,
    output_handlers: HashMap<String, OutputHandler>,
    run_handler: Option<RunHandler>,
}

impl Device {
    /// A device bound to the run-control at `rc_addr`, announcing itself
    /// as `name`.
    pub fn new(rc_addr: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rc_addr: rc_addr.into(),
            cmd_handlers: HashMap::new(),
            input_handlers: HashMap::new(),
            output_handlers: HashMap::new(),
            run_handler: None,
        }
    }

    /// Registers a command handler for a canonical path (`/config`, …).
    pub fn cmd_handle<F, Fut>(&mut self, path: impl Into<String>, f: F)
    where
        F: Fn(Context, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let path = path.into();
        if self
            .cmd_handlers
            .insert(path.clone(), handler::cmd_handler(f))
            .is_some()
        {
            panic!("duplicate command handler for {path}");
        }
    }

    /// Registers an input handler: called once per data frame received on
    /// the named end-point.
    pub fn input_handle<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Context, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self
            .input_handlers
            .insert(name.clone(), handler::input_handler(f))
            .is_some()
        {
            panic!("duplicate input handler for {name}");
        }
    }

    /// Registers an output handler: called in a loop during `Running` to
    /// produce the next frame for the named end-point. A frame with an
    /// empty body is not published; handlers should block until they have
    /// data or their context is cancelled.
    pub fn output_handle<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Frame>> + Send + 'static,
    {
        let name = name.into();
        if self
            .output_handlers
            .insert(name.clone(), handler::output_handler(f))
            .is_some()
        {
            panic!("duplicate output handler for {name}");
        }
    }

    /// Registers the free-running task spawned alongside the outputs for
    /// the duration of each run.
    pub fn run_handle<F, Fut>(&mut self, f: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.run_handler.is_some() {
            panic!("run handler already registered");
        }
        self.run_handler = Some(handler::run_handler(f));
    }

    /// Dials run-control, joins, then serves commands until `/term` or the
    /// shutdown signal. Does not return before the device has joined or
    /// shutdown fired; clean shutdown is not an error.
    pub async fn run(self, shutdown: Shutdown) -> anyhow::Result<()> {
        let Device {
            name,
            rc_addr,
            cmd_handlers,
            input_handlers,
            output_handlers,
            run_handler,
        } = self;
        let mut shutdown = shutdown;

        // Control-plane dial, retrying until run-control shows up.
        let ctrl = loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                res = TcpStream::connect(&rc_addr) => match res {
                    Ok(stream) => break stream,
                    Err(e) => {
                        debug!(device = %name, addr = %rc_addr, "run-control not reachable yet: {e}");
                        sleep(RECONNECT_DELAY).await;
                    }
                },
            }
        };
        info!(device = %name, addr = %rc_addr, "connected to run-control");

        // One listener per declared output, bound to the IP run-control
        // reaches us on, so advertised addresses are dialable from peers.
        let local_ip = ctrl
            .local_addr()
            .context("control socket has no local address")?
            .ip();
        let mut outputs = HashMap::new();
        for out_name in output_handlers.keys() {
            let port = OutputPort::bind(out_name.clone(), local_ip)
                .await
                .with_context(|| format!("binding listener for output {out_name}"))?;
            info!(device = %name, port = %out_name, addr = %port.addr(), "output listening");
            outputs.insert(out_name.clone(), Arc::new(port));
        }

        let join = JoinCmd {
            name: name.clone(),
            in_ports: input_handlers.keys().map(|n| EndPoint::named(n.as_str())).collect(),
            out_ports: outputs
                .values()
                .map(|p| EndPoint {
                    name: p.name().to_string(),
                    addr: p.addr().to_string(),
                    kind: String::new(),
                })
                .collect(),
        };

        let (mut rd, wr) = ctrl.into_split();
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CTRL_QUEUE);
        let writer = tokio::spawn(write_loop(wr, ctrl_rx));
        ctrl_tx
            .send(join.to_frame()?)
            .await
            .map_err(|_| anyhow!("control writer closed"))?;

        let (err_tx, mut err_rx) = mpsc::channel(ERR_QUEUE);
        let mut rt = Runtime {
            name,
            cmd_handlers,
            input_handlers,
            output_handlers,
            run_handler,
            outputs,
            inputs: HashMap::new(),
            state: Status::UnConf,
            run: None,
            ctrl_tx,
            writer,
            shutdown: shutdown.clone(),
            err_tx,
        };

        // Serialized dispatch: one command handler at a time.
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(device = %rt.name, "shutdown signalled");
                    rt.teardown().await;
                    return Ok(());
                }
                Some(err) = err_rx.recv() => {
                    warn!(device = %rt.name, "data-plane failure: {err:#}");
                    rt.state = Status::Error;
                }
                res = recv_frame(&mut rd) => match res {
                    Ok(frame) => match frame.ftype {
                        FrameType::Cmd => match rt.on_command(frame).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Exit) => {
                                rt.teardown().await;
                                return Ok(());
                            }
                            Err(e) => {
                                rt.teardown().await;
                                return Err(e);
                            }
                        },
                        FrameType::Err => {
                            let msg = String::from_utf8_lossy(&frame.body).into_owned();
                            rt.teardown().await;
                            bail!("run-control refused the device: {msg}");
                        }
                        other => {
                            warn!(device = %rt.name, frame = %other, "unexpected frame on control connection");
                        }
                    },
                    Err(e) => {
                        rt.teardown().await;
                        return Err(anyhow::Error::new(e).context("control connection lost"));
                    }
                },
            }
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Tasks spawned for one run, cancelled together at `/stop`.
struct RunScope {
    trigger: Trigger,
    tasks: Vec<JoinHandle<()>>,
}

/// Loop-owned state of a running device.
struct Runtime {
    name: String,
    cmd_handlers: HashMap<String, CmdHandler>,
    input_handlers: HashMap<String, InputHandler>,
    output_handlers: HashMap<String, OutputHandler>,
    run_handler: Option<RunHandler>,
    outputs: HashMap<String, Arc<OutputPort>>,
    inputs: HashMap<String, JoinHandle<()>>,
    state: Status,
    run: Option<RunScope>,
    ctrl_tx: mpsc::Sender<Frame>,
    writer: JoinHandle<()>,
    shutdown: Shutdown,
    err_tx: mpsc::Sender<anyhow::Error>,
}

impl Runtime {
    async fn on_command(&mut self, frame: Frame) -> anyhow::Result<Flow> {
        let cmd = Cmd::from_frame(&frame).context("malformed command frame")?;
        let path = String::from_utf8_lossy(&frame.path).into_owned();
        debug!(device = %self.name, %path, "command received");

        let step = match cmd.ctype {
            CMD_CONFIG => Step::Config,
            CMD_INIT => Step::Init,
            CMD_RESET => Step::Reset,
            CMD_START => Step::Start,
            CMD_STOP => Step::Stop,
            CMD_TERM => Step::Term,
            CMD_STATUS => {
                self.reply_status().await?;
                return Ok(Flow::Continue);
            }
            _ => {
                warn!(device = %self.name, %path, "unsupported command");
                return Ok(Flow::Continue);
            }
        };

        let Some(next) = self.state.step(step) else {
            let err = DaqError::IllegalTransition {
                from: self.state,
                step,
            };
            warn!(device = %self.name, "{err}");
            self.state = Status::Error;
            self.reply_status().await?;
            return Ok(Flow::Continue);
        };

        // The transition applies only after the local handler succeeded.
        if let Some(handler) = self.cmd_handlers.get(&path).cloned() {
            let ctx = Context::new(self.name.clone(), self.shutdown.clone());
            if let Err(e) = handler(ctx, frame.clone()).await {
                warn!(device = %self.name, %path, "command handler failed: {e:#}");
                self.state = Status::Error;
                self.reply_status().await?;
                self.send_log(LogLevel::Error, format!("{path} handler failed: {e:#}"))
                    .await?;
                return Ok(Flow::Continue);
            }
        }

        let action = match step {
            Step::Config => self.apply_config(&cmd).await,
            Step::Start => {
                self.start_run();
                Ok(())
            }
            Step::Stop | Step::Term => {
                self.stop_run().await;
                Ok(())
            }
            Step::Init | Step::Reset => Ok(()),
        };
        if let Err(e) = action {
            warn!(device = %self.name, %path, "transition failed: {e:#}");
            self.state = Status::Error;
            self.reply_status().await?;
            return Ok(Flow::Continue);
        }

        self.state = next;
        self.reply_status().await?;
        self.send_log(LogLevel::Info, format!("now {}", self.state))
            .await?;

        if step == Step::Term {
            return Ok(Flow::Exit);
        }
        Ok(Flow::Continue)
    }

    /// Wires inputs to the producer addresses echoed by run-control.
    async fn apply_config(&mut self, cmd: &Cmd) -> anyhow::Result<()> {
        let cfg = ConfigCmd::unmarshal(&cmd.body).context("malformed /config payload")?;
        for ep in &cfg.in_ports {
            let Some(handler) = self.input_handlers.get(&ep.name).cloned() else {
                warn!(device = %self.name, port = %ep.name, "config names an undeclared input");
                continue;
            };
            if ep.addr.is_empty() {
                warn!(device = %self.name, port = %ep.name, "no producer wired for input");
                continue;
            }
            // Re-configuration replaces the previous dial.
            if let Some(task) = self.inputs.remove(&ep.name) {
                task.abort();
            }
            let stream = TcpStream::connect(&ep.addr)
                .await
                .with_context(|| format!("dialing producer {} for {}", ep.addr, ep.name))?;
            debug!(device = %self.name, port = %ep.name, addr = %ep.addr, "input wired");
            let task = tokio::spawn(input_read_loop(
                self.name.clone(),
                ep.name.clone(),
                stream,
                handler,
                self.shutdown.clone(),
                self.err_tx.clone(),
            ));
            self.inputs.insert(ep.name.clone(), task);
        }
        Ok(())
    }

    /// Spawns the per-output tasks and the run handler under a run-scoped
    /// cancellation signal.
    fn start_run(&mut self) {
        let (trigger, stop) = shutdown::channel();
        let mut tasks = Vec::new();
        for (name, handler) in &self.output_handlers {
            let port = self
                .outputs
                .get(name)
                .expect("listener bound for every registered output")
                .clone();
            let ctx = Context::new(self.name.clone(), stop.clone());
            tasks.push(tokio::spawn(output_run_loop(
                port,
                handler.clone(),
                ctx,
                self.err_tx.clone(),
            )));
        }
        if let Some(handler) = self.run_handler.clone() {
            let ctx = Context::new(self.name.clone(), stop.clone());
            let err_tx = self.err_tx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = handler(ctx.clone()).await {
                    if !ctx.is_cancelled() {
                        let _ = err_tx.send(e.context("run handler failed")).await;
                    }
                }
            }));
        }
        self.run = Some(RunScope { trigger, tasks });
    }

    /// Cancels the current run and joins its tasks.
    async fn stop_run(&mut self) {
        let Some(scope) = self.run.take() else { return };
        scope.trigger.trigger();
        for mut task in scope.tasks {
            if timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!(device = %self.name, "run task ignored cancellation; aborting");
                task.abort();
            }
        }
    }

    async fn reply_status(&self) -> anyhow::Result<()> {
        let cmd = StatusCmd {
            name: self.name.clone(),
            status: self.state,
        };
        self.send_ctrl(cmd.to_frame()?).await
    }

    async fn send_log(&self, level: LogLevel, msg: String) -> anyhow::Result<()> {
        let cmd = LogCmd {
            name: self.name.clone(),
            level,
            msg,
        };
        self.send_ctrl(cmd.to_frame()?).await
    }

    async fn send_ctrl(&self, frame: Frame) -> anyhow::Result<()> {
        self.ctrl_tx
            .send(frame)
            .await
            .map_err(|_| anyhow!("control writer closed"))
    }

    /// Releases every resource: run tasks, input dials, output listeners,
    /// then the control connection once all queued replies are flushed.
    async fn teardown(mut self) {
        self.stop_run().await;
        for (_, task) in self.inputs.drain() {
            task.abort();
        }
        self.outputs.clear();
        let Runtime { ctrl_tx, writer, .. } = self;
        drop(ctrl_tx);
        let _ = writer.await;
    }
}

async fn write_loop(mut wr: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    use tokio::io::AsyncWriteExt;
    while let Some(frame) = rx.recv().await {
        if let Err(e) = send_frame(&mut wr, &frame).await {
            debug!("control write failed: {e}");
            return;
        }
    }
    let _ = wr.shutdown().await;
}

/// Drives one output end-point for the duration of a run: ask the handler
/// for the next frame, broadcast non-empty bodies, send EOF on the way out.
async fn output_run_loop(
    port: Arc<OutputPort>,
    handler: OutputHandler,
    ctx: Context,
    err_tx: mpsc::Sender<anyhow::Error>,
) {
    loop {
        if ctx.is_cancelled() {
            break;
        }
        let frame = match handler(ctx.clone()).await {
            Ok(frame) => frame,
            Err(e) => {
                if !ctx.is_cancelled() {
                    let _ = err_tx
                        .send(e.context(format!("output handler {} failed", port.name())))
                        .await;
                }
                break;
            }
        };
        if ctx.is_cancelled() {
            break;
        }
        if frame.body.is_empty() {
            continue;
        }
        port.broadcast(Frame::data(frame.body)).await;
    }
    port.broadcast(Frame::eof()).await;
}

/// Reads one input end-point for the life of the device. `Eof` marks the
/// end of a run and the stream is kept for the next one; `/term` or a
/// socket error ends the task.
async fn input_read_loop(
    device: String,
    port: String,
    mut stream: TcpStream,
    handler: InputHandler,
    shutdown: Shutdown,
    err_tx: mpsc::Sender<anyhow::Error>,
) {
    let mut watch = shutdown.clone();
    loop {
        let frame = tokio::select! {
            _ = watch.recv() => return,
            res = recv_frame(&mut stream) => match res {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(%device, %port, "input stream closed: {e}");
                    return;
                }
            },
        };
        match frame.ftype {
            FrameType::Data => {
                let ctx = Context::new(device.clone(), shutdown.clone());
                if let Err(e) = handler(ctx, frame).await {
                    let _ = err_tx
                        .send(e.context(format!("input handler {port} failed")))
                        .await;
                    return;
                }
            }
            FrameType::Eof => {
                debug!(%device, %port, "end of run");
            }
            FrameType::Err => {
                let msg = String::from_utf8_lossy(&frame.body).into_owned();
                let _ = err_tx
                    .send(anyhow!("producer error on {port}: {msg}"))
                    .await;
                return;
            }
            other => {
                warn!(%device, %port, frame = %other, "unexpected frame on data socket");
            }
        }
    }
}

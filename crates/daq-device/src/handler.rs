//! Type-erased handler storage.
//!
//! Handlers are registered as plain async closures and stored as
//! `Arc<dyn Fn ... -> BoxFuture>` so the runtime can clone them out of the
//! registries and run them on spawned tasks.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use daq_wire::Frame;

use crate::context::Context;

/// Runs on each control-plane command for its registered path.
pub(crate) type CmdHandler =
    Arc<dyn Fn(Context, Frame) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Runs on each data frame arriving on its input end-point.
pub(crate) type InputHandler =
    Arc<dyn Fn(Context, Frame) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Produces the next frame to publish on its output end-point.
pub(crate) type OutputHandler =
    Arc<dyn Fn(Context) -> BoxFuture<'static, anyhow::Result<Frame>> + Send + Sync>;

/// Free-running task while the device is in `Running`.
pub(crate) type RunHandler =
    Arc<dyn Fn(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub(crate) fn cmd_handler<F, Fut>(f: F) -> CmdHandler
where
    F: Fn(Context, Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, frame| -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(f(ctx, frame))
    })
}

pub(crate) fn input_handler<F, Fut>(f: F) -> InputHandler
where
    F: Fn(Context, Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, frame| -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(f(ctx, frame))
    })
}

pub(crate) fn output_handler<F, Fut>(f: F) -> OutputHandler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Frame>> + Send + 'static,
{
    Arc::new(move |ctx| -> BoxFuture<'static, anyhow::Result<Frame>> { Box::pin(f(ctx)) })
}

pub(crate) fn run_handler<F, Fut>(f: F) -> RunHandler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f(ctx)) })
}

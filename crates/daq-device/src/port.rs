//! Data-plane output end-points.
//!
//! Every output owns a TCP listener whose OS-assigned address is advertised
//! at `/join` time. A dedicated accept task hands each downstream socket to
//! its own writer task behind a bounded channel; the port only ever touches
//! the channel senders, so no socket is shared between tasks and a slow
//! consumer exerts backpressure through its full channel.

use std::net::{IpAddr, SocketAddr};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use daq_wire::{send_frame, Frame};

/// Frames queued per downstream socket before the producer blocks.
const PEER_QUEUE: usize = 4;

pub(crate) struct OutputPort {
    name: String,
    addr: SocketAddr,
    conns: Arc<Mutex<Vec<mpsc::Sender<Frame>>>>,
    accept_task: JoinHandle<()>,
}

impl OutputPort {
    /// Binds a listener on `ip` with an OS-assigned port and starts
    /// accepting downstream connections.
    pub(crate) async fn bind(name: String, ip: IpAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind((ip, 0)).await?;
        let addr = listener.local_addr()?;
        let conns: Arc<Mutex<Vec<mpsc::Sender<Frame>>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(accept_loop(name.clone(), listener, conns.clone()));
        Ok(Self {
            name,
            addr,
            conns,
            accept_task,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of currently connected downstream sockets.
    #[allow(dead_code)]
    pub(crate) fn num_peers(&self) -> usize {
        self.conns.lock().len()
    }

    /// Sends `frame` to every connected downstream, in connection order.
    /// Disconnected peers are pruned afterwards.
    pub(crate) async fn broadcast(&self, frame: Frame) {
        let peers: Vec<mpsc::Sender<Frame>> = self.conns.lock().clone();
        let mut lost = false;
        for tx in &peers {
            if tx.send(frame.clone()).await.is_err() {
                lost = true;
            }
        }
        if lost {
            self.conns.lock().retain(|tx| !tx.is_closed());
        }
    }
}

impl Drop for OutputPort {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    name: String,
    listener: TcpListener,
    conns: Arc<Mutex<Vec<mpsc::Sender<Frame>>>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(port = %name, %peer, "downstream connected");
                let (tx, rx) = mpsc::channel(PEER_QUEUE);
                conns.lock().push(tx);
                tokio::spawn(peer_write_loop(name.clone(), peer, stream, rx));
            }
            Err(e) => {
                warn!(port = %name, "accept failed: {e}");
            }
        }
    }
}

async fn peer_write_loop(
    name: String,
    peer: SocketAddr,
    mut stream: TcpStream,
    mut rx: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = send_frame(&mut stream, &frame).await {
            debug!(port = %name, %peer, "downstream dropped: {e}");
            return;
        }
    }
    // Port gone: let the socket close.
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_wire::{recv_frame, FrameType};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::time::sleep;

    async fn wait_for_peers(port: &OutputPort, n: usize) {
        for _ in 0..500 {
            if port.num_peers() == n {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("downstreams never connected");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fanout_preserves_order_for_every_consumer() {
        let port = OutputPort::bind("/adc".into(), IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();

        let mut a = TcpStream::connect(port.addr()).await.unwrap();
        let mut b = TcpStream::connect(port.addr()).await.unwrap();
        wait_for_peers(&port, 2).await;

        let bodies: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i, i, i]).collect();
        for body in &bodies {
            port.broadcast(Frame::data(body.clone())).await;
        }
        port.broadcast(Frame::eof()).await;

        for stream in [&mut a, &mut b] {
            for body in &bodies {
                let frame = recv_frame(stream).await.unwrap();
                assert_eq!(frame.ftype, FrameType::Data);
                assert_eq!(&frame.body, body);
            }
            let frame = recv_frame(stream).await.unwrap();
            assert_eq!(frame.ftype, FrameType::Eof);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnected_peer_is_pruned() {
        let port = OutputPort::bind("/adc".into(), IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();

        let gone = TcpStream::connect(port.addr()).await.unwrap();
        wait_for_peers(&port, 1).await;
        drop(gone);

        // Keep broadcasting until the dead peer's writer task notices the
        // closed socket and its channel is pruned.
        for _ in 0..500 {
            port.broadcast(Frame::data(vec![1])).await;
            if port.num_peers() == 0 {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("dead downstream never pruned");
    }
}

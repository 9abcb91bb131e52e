//! TCP front door.
//!
//! A [`GdbServer`] accepts debugger connections one at a time and runs the
//! front-end loop to completion for each before accepting the next.
//! Sessions are deliberately serialized: two debuggers driving one Debug
//! Module would interleave DMI traffic with no coherent semantics.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use crate::debug_module::DebugModule;
use crate::dmi::DmiAccess;
use crate::stub::{GdbStub, StubConfig};

/// Sleep between accept polls while no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Read timeout on accepted streams; doubles as the session's select
/// interval between the command stream and the stop channel.
const READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Terminates a running [`GdbServer`] from another thread.
///
/// Signalling the handle makes the accept loop, and any session in
/// progress, exit before processing the next packet.
#[derive(Debug, Clone)]
pub struct StopHandle(Sender<()>);

impl StopHandle {
    /// Request termination.
    pub fn stop(&self) {
        let _ = self.0.send(());
    }
}

/// Serial accept loop binding debugger connections to a back end.
pub struct GdbServer {
    listener: TcpListener,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    config: StubConfig,
}

impl GdbServer {
    /// Bind the listening socket.
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let (stop_tx, stop_rx) = mpsc::channel();
        Ok(GdbServer {
            listener,
            stop_tx,
            stop_rx,
            config: StubConfig::default(),
        })
    }

    /// Address the server is listening on (useful when bound to port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Override the per-session configuration.
    pub fn set_config(&mut self, config: StubConfig) {
        self.config = config;
    }

    /// A handle that terminates [`serve`](Self::serve) from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop_tx.clone())
    }

    /// Accept and serve debugger sessions until stopped.
    pub fn serve<D: DmiAccess>(&self, backend: &mut DebugModule<D>) -> io::Result<()> {
        loop {
            match self.stop_rx.try_recv() {
                Ok(()) => {
                    tracing::info!("stop requested, shutting down");
                    return Ok(());
                }
                Err(TryRecvError::Disconnected) | Err(TryRecvError::Empty) => {}
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::info!("accepted connection from {peer}");
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(READ_TIMEOUT))?;
                    stream.set_nodelay(true)?;

                    let mut stub = GdbStub::new(stream, backend, Some(&self.stop_rx))
                        .with_config(self.config.clone());
                    match stub.run() {
                        Ok(()) => tracing::info!("session closed"),
                        Err(error) => tracing::warn!("session ended with error: {error}"),
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(error) => {
                    tracing::warn!("accept failed: {error}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }
}

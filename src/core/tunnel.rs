/// Local-to-remote port forwarding
///
/// A `Tunnel` listens on an ephemeral port on 127.0.0.1 and forwards each accepted
/// connection to a port inside the target pod. The forwarding loop runs on a
/// background task that reports readiness or failure through two oneshot channels.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::cluster::{ClusterApi, ExecTarget, PortStream};
use crate::core::error::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    Ready,
    Failed,
    Closed,
}

pub struct Tunnel {
    target: ExecTarget,
    local_port: u16,
    remote_port: u16,
    state: TunnelState,
    ready: Option<oneshot::Receiver<()>>,
    errors: Option<oneshot::Receiver<BackupError>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Tunnel {
    /// Bind the local port and start negotiating the forwarding session
    pub async fn open(cluster: Arc<dyn ClusterApi>, target: ExecTarget, remote_port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .map_err(|e| BackupError::transport("binding local tunnel port", e))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| BackupError::transport("binding local tunnel port", e))?
            .port();

        let (ready_tx, ready_rx) = oneshot::channel();
        let (error_tx, error_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(forward(
            cluster,
            target.clone(),
            remote_port,
            listener,
            cancel.clone(),
            ready_tx,
            error_tx,
        ));

        debug!(target = %target, local_port, remote_port, "Tunnel starting");

        Ok(Self {
            target,
            local_port,
            remote_port,
            state: TunnelState::Starting,
            ready: Some(ready_rx),
            errors: Some(error_rx),
            cancel,
            task: Some(task),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn target(&self) -> &ExecTarget {
        &self.target
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Block until the session is negotiated, it fails, or `timeout` elapses
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        match self.state {
            TunnelState::Ready => return Ok(()),
            TunnelState::Starting => {}
            TunnelState::Failed | TunnelState::Closed => {
                return Err(BackupError::transport(
                    format!("tunnel to {}:{}", self.target, self.remote_port),
                    "tunnel is no longer usable",
                ))
            }
        }

        let (Some(mut ready), Some(mut errors)) = (self.ready.take(), self.errors.take()) else {
            self.state = TunnelState::Failed;
            return Err(BackupError::transport(
                format!("tunnel to {}:{}", self.target, self.remote_port),
                "readiness already consumed",
            ));
        };

        let target = self.target.to_string();
        let remote_port = self.remote_port;
        let stopped = move || {
            BackupError::transport(
                format!("tunnel to {}:{}", target, remote_port),
                "forwarding task stopped before becoming ready",
            )
        };

        let outcome = tokio::time::timeout(timeout, async {
            let signalled = tokio::select! {
                biased;
                signal = &mut ready => signal.is_ok(),
                err = &mut errors => return Err(err.unwrap_or_else(|_| stopped())),
            };
            if signalled {
                Ok(())
            } else {
                Err(errors.try_recv().unwrap_or_else(|_| stopped()))
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                self.state = TunnelState::Ready;
                info!(
                    target = %self.target,
                    local_port = self.local_port,
                    remote_port = self.remote_port,
                    "Tunnel ready"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = TunnelState::Failed;
                Err(e)
            }
            Err(_) => {
                self.state = TunnelState::Failed;
                Err(BackupError::timeout(
                    format!("tunnel to {}:{} to become ready", self.target, self.remote_port),
                    timeout,
                ))
            }
        }
    }

    /// Stop forwarding and release the local port
    ///
    /// Safe to call more than once and after the background task failed.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        if self.state != TunnelState::Failed && self.state != TunnelState::Closed {
            self.state = TunnelState::Closed;
            debug!(target = %self.target, local_port = self.local_port, "Tunnel closed");
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn forward(
    cluster: Arc<dyn ClusterApi>,
    target: ExecTarget,
    remote_port: u16,
    listener: TcpListener,
    cancel: CancellationToken,
    ready_tx: oneshot::Sender<()>,
    error_tx: oneshot::Sender<BackupError>,
) {
    // Negotiate one session up front so readiness means the remote port answered
    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        session = cluster.port_forward(&target, remote_port) => session,
    };
    let mut primed = match first {
        Ok(stream) => Some(stream),
        Err(e) => {
            let _ = error_tx.send(e);
            return;
        }
    };
    let _ = ready_tx.send(());
    drop(error_tx);

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (socket, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Tunnel stopped accepting connections");
                break;
            }
        };

        let upstream = match primed.take() {
            Some(stream) => Ok(stream),
            None => cluster.port_forward(&target, remote_port).await,
        };

        match upstream {
            Ok(upstream) => {
                debug!(peer = %peer, remote_port, "Forwarding connection");
                tokio::spawn(pipe(socket, upstream, cancel.child_token()));
            }
            Err(e) => warn!(peer = %peer, error = %e, "Could not open port-forward for connection"),
        }
    }
}

async fn pipe(mut socket: TcpStream, mut upstream: PortStream, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut socket, &mut upstream) => {
            if let Err(e) = result {
                debug!(error = %e, "Tunnel connection ended with error");
            }
        }
    }
}

use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Result, SpoolError};
use crate::queue::SharedStore;

/// The only request the dispenser answers.
pub const GETJOB: &str = "getjob";

const RECV_BUFFER_SIZE: usize = 4096;
const LISTEN_BACKLOG: u32 = 100;

/// How a single connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A waiting item was claimed and its path sent
    Dispensed(PathBuf),
    /// `getjob` arrived but nothing was waiting; an empty body was sent
    Empty,
    /// The request was not `getjob`; closed without reply
    Ignored,
}

/// TCP service handing out one waiting item per connection.
pub struct DispenserServer {
    listener: TcpListener,
    store: SharedStore,
    request_timeout: Duration,
}

impl DispenserServer {
    /// Bind the listening socket. Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr, store: SharedStore, request_timeout: Duration) -> Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        Ok(Self {
            listener,
            store,
            request_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start serving in the background.
    pub fn spawn(self) -> DispenserHandle {
        // A bound listener always has a local address.
        let addr = self
            .listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let task = tokio::spawn(self.serve(token.clone(), tracker.clone()));
        tracing::info!(addr = %addr, "Work dispenser listening");

        DispenserHandle {
            addr,
            token,
            tracker,
            task,
        }
    }

    async fn serve(self, token: CancellationToken, tracker: TaskTracker) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let store = self.store.clone();
                        let token = token.clone();
                        let request_timeout = self.request_timeout;
                        tracker.spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => {
                                    tracing::debug!(peer = %peer, "Dropping connection on shutdown");
                                }
                                result = handle_connection(stream, store, request_timeout) => {
                                    match result {
                                        Ok(Outcome::Dispensed(path)) => {
                                            tracing::info!(peer = %peer, path = %path.display(), "Dispensed work item");
                                        }
                                        Ok(Outcome::Empty) => {
                                            tracing::debug!(peer = %peer, "No waiting work items to dispense");
                                        }
                                        Ok(Outcome::Ignored) => {
                                            tracing::debug!(peer = %peer, "Ignored unknown request");
                                        }
                                        Err(e) => {
                                            tracing::warn!(peer = %peer, error = %e, "Dispenser connection failed");
                                        }
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept dispenser connection");
                    }
                },
            }
        }
        tracker.close();
    }
}

/// Serve one request: a `getjob` claims the next waiting item.
pub async fn handle_connection(
    mut stream: TcpStream,
    store: SharedStore,
    request_timeout: Duration,
) -> Result<Outcome> {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let n = tokio::time::timeout(request_timeout, stream.read(&mut buf))
        .await
        .map_err(|_| {
            SpoolError::Dispenser(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no request received",
            ))
        })?
        .map_err(SpoolError::Dispenser)?;

    if String::from_utf8_lossy(&buf[..n]).trim() != GETJOB {
        return Ok(Outcome::Ignored);
    }

    let claimed = store.lock().await.next_waiting();
    let body = claimed
        .as_ref()
        .map(|p| p.as_os_str().as_bytes())
        .unwrap_or_default();
    stream.write_all(body).await.map_err(SpoolError::Dispenser)?;
    stream.shutdown().await.map_err(SpoolError::Dispenser)?;

    Ok(match claimed {
        Some(path) => Outcome::Dispensed(path),
        None => Outcome::Empty,
    })
}

/// Handle to a running dispenser.
pub struct DispenserHandle {
    addr: SocketAddr,
    token: CancellationToken,
    tracker: TaskTracker,
    task: JoinHandle<()>,
}

impl DispenserHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Close the listening socket and every open connection.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Dispenser task failed");
        }
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(addr = %self.addr, "Work dispenser stopped");
    }
}

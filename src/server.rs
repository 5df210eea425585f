//! The policy connection server.
//!
//! One listener, one worker task per accepted connection, concurrency
//! bounded by a semaphore.  Each worker reads exactly one request, asks the
//! policy engine for a verdict, writes the answer and closes.

use std::fmt;
use std::io;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::center::Center;
use crate::config::{Endpoint, ListenConfig};
use crate::daemon;
use crate::policy;
use crate::request::{Action, Request};

//----------- PolicyServer -----------------------------------------------------

/// The accept loop and its workers.
pub struct PolicyServer {
    /// Shared runtime state.
    center: Arc<Center>,

    /// The bound listener.
    listener: Listener,
}

impl PolicyServer {
    /// Pair a bound listener with the runtime state.
    pub fn new(center: Arc<Center>, listener: Listener) -> Self {
        Self { center, listener }
    }

    /// Serve until the shutdown signal fires, then drain.
    ///
    /// On return, in-flight workers have finished (or were abandoned after
    /// the grace period), both stores are flushed, and a unix socket has
    /// been unlinked.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.center.config.listen;
        let limit = Arc::new(Semaphore::new(config.max_connections));
        let mut workers = JoinSet::new();

        info!("Accepting policy requests on {}", self.listener);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,

                // Reap finished workers so the set stays small.
                Some(_) = workers.join_next(), if !workers.is_empty() => {}

                permit = limit.clone().acquire_owned() => {
                    let permit = permit.expect("the connection semaphore is never closed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        accepted = self.listener.accept() => match accepted {
                            Ok(stream) => {
                                let center = self.center.clone();
                                workers.spawn(async move {
                                    serve(center, stream).await;
                                    drop(permit);
                                });
                            }
                            Err(err) => warn!("Accepting a connection failed: {err}"),
                        }
                    }
                }
            }
        }

        self.finish(workers).await;
    }

    /// The tail of `do_shutdown`: drain, flush, unlink.
    async fn finish(self, mut workers: JoinSet<()>) {
        if !workers.is_empty() {
            info!("Waiting for {} in-flight request(s)", workers.len());
        }
        let grace = self.center.config.listen.shutdown_grace;
        let drained = timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Abandoning {} request(s) after the shutdown grace period",
                workers.len()
            );
            workers.shutdown().await;
        }

        if let Err(err) = self.center.save_stores().await {
            warn!("Could not flush the stores at shutdown: {err}");
        }

        if let Listener::Unix { path, .. } = &self.listener {
            if let Err(err) = std::fs::remove_file(path.as_std_path()) {
                warn!("Could not unlink the socket '{path}': {err}");
            }
        }
    }
}

/// Handle one accepted connection.
async fn serve(center: Arc<Center>, stream: Stream) {
    match stream {
        Stream::Unix(stream) => serve_io(center, stream).await,
        Stream::Tcp(stream) => serve_io(center, stream).await,
    }
}

/// The codec -> engine -> codec pipeline over any byte stream.
///
/// Every failure mode collapses to the neutral answer; only a peer that
/// sent nothing at all is closed silently.
async fn serve_io<S>(center: Arc<Center>, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let deadline = center.config.listen.read_timeout;
    let action = match timeout(deadline, Request::read_from(&mut reader)).await {
        Err(_) => {
            warn!("A client took too long to send its request");
            Action::Dunno
        }
        Ok(Err(err)) => {
            warn!("Could not read a request: {err}");
            Action::Dunno
        }
        Ok(Ok(None)) => return,
        Ok(Ok(Some(request))) => {
            let now = jiff::Timestamp::now().as_second();
            policy::decide(&center, &request, now).await
        }
    };

    if let Err(err) = write_half.write_all(action.to_wire().as_bytes()).await {
        debug!("Could not answer a client: {err}");
    }
    let _ = write_half.shutdown().await;
}

//----------- Listener ---------------------------------------------------------

/// A bound listening socket.
pub enum Listener {
    /// A filesystem stream socket.
    Unix {
        /// The bound listener.
        listener: UnixListener,

        /// Where it lives, for unlinking at shutdown.
        path: Utf8PathBuf,
    },

    /// A TCP listener.
    Tcp {
        /// The bound listener.
        listener: TcpListener,
    },
}

impl Listener {
    /// Bind the configured endpoint.
    ///
    /// A unix socket path must not exist yet; a stale socket file from an
    /// unclean shutdown has to be removed by the operator (or a supervisor)
    /// before the server will take the path over.
    pub fn bind(config: &ListenConfig) -> Result<Self, BindError> {
        match &config.endpoint {
            Endpoint::Unix { path, mode } => {
                let listener = UnixListener::bind(path.as_std_path())
                    .map_err(|err| BindError::Unix(path.clone(), err))?;
                daemon::set_socket_mode(path, *mode)
                    .map_err(|err| BindError::Unix(path.clone(), err))?;
                Ok(Self::Unix {
                    listener,
                    path: path.clone(),
                })
            }

            Endpoint::Tcp {
                addr,
                backlog,
                reuse_addr,
            } => {
                let socket = match addr {
                    std::net::SocketAddr::V4(_) => TcpSocket::new_v4(),
                    std::net::SocketAddr::V6(_) => TcpSocket::new_v6(),
                }
                .map_err(|err| BindError::Tcp(*addr, err))?;
                socket
                    .set_reuseaddr(*reuse_addr)
                    .and_then(|()| socket.bind(*addr))
                    .map_err(|err| BindError::Tcp(*addr, err))?;
                let listener = socket
                    .listen(*backlog)
                    .map_err(|err| BindError::Tcp(*addr, err))?;
                Ok(Self::Tcp { listener })
            }
        }
    }

    /// The bound TCP address, for callers that asked for port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Self::Tcp { listener } => listener.local_addr().ok(),
            Self::Unix { .. } => None,
        }
    }

    /// Wait for the next connection.
    async fn accept(&self) -> io::Result<Stream> {
        match self {
            Self::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Stream::Unix(stream))
            }
            Self::Tcp { listener } => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Stream::Tcp(stream))
            }
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path, .. } => write!(f, "unix socket '{path}'"),
            Self::Tcp { listener } => match listener.local_addr() {
                Ok(addr) => write!(f, "tcp address {addr}"),
                Err(_) => f.write_str("a tcp address"),
            },
        }
    }
}

/// An accepted connection.
enum Stream {
    /// From the unix listener.
    Unix(UnixStream),

    /// From the TCP listener.
    Tcp(TcpStream),
}

//----------- BindError --------------------------------------------------------

/// An error binding the listener.
#[derive(Debug)]
pub enum BindError {
    /// The unix socket could not be set up.
    Unix(Utf8PathBuf, io::Error),

    /// The TCP listener could not be set up.
    Tcp(std::net::SocketAddr, io::Error),
}

impl std::error::Error for BindError {}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path, err) => write!(f, "cannot listen on unix socket '{path}': {err}"),
            Self::Tcp(addr, err) => write!(f, "cannot listen on {addr}: {err}"),
        }
    }
}

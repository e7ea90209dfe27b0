//! Transport selection
//!
//! Decides how client and server exchange LSP frames. For `Ipc` and `Socket`
//! the client listens and the spawned server connects back, following the
//! usual language-client convention (`--pipe=<path>`, `--socket=<port>`).
//! `Stdio` uses the child's standard streams directly. `Remote` dials a
//! server that is already running elsewhere and spawns nothing.

use crate::types::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which channel carries LSP messages for a session
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Local socket tied to the child's lifetime
    #[default]
    Ipc,
    Stdio,
    Socket { host: String, port: u16 },
    /// Server already listening on another host or sandbox
    Remote { host: String, port: u16 },
}

impl TransportConfig {
    /// Whether the launcher has to spawn a process for this transport
    pub fn spawns_server(&self) -> bool {
        !matches!(self, TransportConfig::Remote { .. })
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Ipc => write!(f, "ipc"),
            TransportConfig::Stdio => write!(f, "stdio"),
            TransportConfig::Socket { host, port } => write!(f, "socket({}:{})", host, port),
            TransportConfig::Remote { host, port } => write!(f, "remote({}:{})", host, port),
        }
    }
}

/// A bidirectional byte channel to the server; framing happens above this.
pub struct MessageChannel {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl MessageChannel {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// A transport whose client-side endpoint exists but is not yet connected.
pub enum PreparedTransport {
    Stdio,
    #[cfg(unix)]
    Ipc(IpcEndpoint),
    Socket { listener: TcpListener, port: u16 },
}

/// Listening unix socket; the socket file is removed when this is dropped.
#[cfg(unix)]
pub struct IpcEndpoint {
    listener: tokio::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl IpcEndpoint {
    fn bind() -> Result<Self, TransportError> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT_SOCKET: AtomicU64 = AtomicU64::new(0);

        let path = std::env::temp_dir().join(format!(
            "lsclient-{}-{}.sock",
            std::process::id(),
            NEXT_SOCKET.fetch_add(1, Ordering::Relaxed)
        ));
        // A stale file from a previous run with the same pid would make bind fail
        let _ = std::fs::remove_file(&path);

        let listener =
            tokio::net::UnixListener::bind(&path).map_err(|source| TransportError::Bind {
                address: path.display().to_string(),
                source,
            })?;

        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(unix)]
impl Drop for IpcEndpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Dial a server that is already listening on `host:port`.
pub async fn connect_remote(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<MessageChannel, TransportError> {
    let address = format!("{}:{}", host, port);
    let stream = timeout(connect_timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| TransportError::Connect {
            address: address.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no answer within {}s", connect_timeout.as_secs()),
            ),
        })?
        .map_err(|source| TransportError::Connect {
            address: address.clone(),
            source,
        })?;
    stream.set_nodelay(true)?;
    info!("Connected to language server at {}", address);

    let (reader, writer) = stream.into_split();
    Ok(MessageChannel::new(reader, writer))
}

impl PreparedTransport {
    /// Create the client-side endpoint for `config`.
    pub async fn prepare(config: &TransportConfig) -> Result<Self, TransportError> {
        match config {
            TransportConfig::Stdio => Ok(PreparedTransport::Stdio),
            TransportConfig::Ipc => Self::prepare_ipc(),
            TransportConfig::Socket { host, port } => {
                let address = format!("{}:{}", host, port);
                let listener = TcpListener::bind(&address)
                    .await
                    .map_err(|source| TransportError::Bind {
                        address: address.clone(),
                        source,
                    })?;
                // Port 0 asks the OS for a free port; advertise the real one
                let port = listener.local_addr()?.port();
                info!("Listening for language server on {}:{}", host, port);
                Ok(PreparedTransport::Socket { listener, port })
            }
            TransportConfig::Remote { .. } => Err(TransportError::Unsupported(
                "remote servers are dialled, not launched",
            )),
        }
    }

    #[cfg(unix)]
    fn prepare_ipc() -> Result<Self, TransportError> {
        let endpoint = IpcEndpoint::bind()?;
        info!("Listening for language server on {}", endpoint.path.display());
        Ok(PreparedTransport::Ipc(endpoint))
    }

    #[cfg(not(unix))]
    fn prepare_ipc() -> Result<Self, TransportError> {
        Err(TransportError::Unsupported("ipc"))
    }

    /// Arguments telling the server which channel to use.
    pub fn server_args(&self) -> Vec<String> {
        match self {
            PreparedTransport::Stdio => vec!["--stdio".to_string()],
            #[cfg(unix)]
            PreparedTransport::Ipc(endpoint) => {
                vec![format!("--pipe={}", endpoint.path.display())]
            }
            PreparedTransport::Socket { port, .. } => vec![format!("--socket={}", port)],
        }
    }

    /// Set up the child's stdin/stdout for this transport.
    pub fn configure(&self, command: &mut Command) {
        match self {
            PreparedTransport::Stdio => {
                command.stdin(Stdio::piped()).stdout(Stdio::piped());
            }
            _ => {
                command.stdin(Stdio::null()).stdout(Stdio::null());
            }
        }
    }

    /// Attach to the spawned server.
    pub async fn connect(
        self,
        child: &mut Child,
        accept_timeout: Duration,
    ) -> Result<MessageChannel, TransportError> {
        match self {
            PreparedTransport::Stdio => {
                let stdin = child.stdin.take().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child stdin not captured")
                })?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child stdout not captured")
                })?;
                Ok(MessageChannel::new(stdout, stdin))
            }
            listening => {
                tokio::select! {
                    channel = listening.accept(accept_timeout) => channel,
                    status = child.wait() => Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        format!("server exited before connecting ({:?})", status?),
                    ))),
                }
            }
        }
    }

    /// Wait for the server to connect to a listening endpoint.
    async fn accept(self, accept_timeout: Duration) -> Result<MessageChannel, TransportError> {
        let secs = accept_timeout.as_secs();
        match self {
            PreparedTransport::Stdio => Err(TransportError::Unsupported(
                "stdio has no endpoint to accept on",
            )),
            #[cfg(unix)]
            PreparedTransport::Ipc(endpoint) => {
                let (stream, _) = timeout(accept_timeout, endpoint.listener.accept())
                    .await
                    .map_err(|_| TransportError::AcceptTimeout(secs))??;
                debug!("Language server connected on {}", endpoint.path.display());
                let (reader, writer) = stream.into_split();
                Ok(MessageChannel::new(reader, writer))
            }
            PreparedTransport::Socket { listener, port } => {
                let (stream, peer) = timeout(accept_timeout, listener.accept())
                    .await
                    .map_err(|_| TransportError::AcceptTimeout(secs))??;
                debug!("Language server connected on port {} from {}", port, peer);
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok(MessageChannel::new(reader, writer))
            }
        }
    }
}

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 55002;

const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
        }
    }
}

impl From<config::ServerConfig> for ServerConfig {
    fn from(value: config::ServerConfig) -> Self {
        Self {
            host: value.host,
            port: value.port,
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind { address: String, source: io::Error },
    SetNonBlocking { source: io::Error },
    ConfigureAcceptedStream { source: io::Error },
    StreamClone { source: io::Error },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone accepted TCP stream for full duplex IO: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

/// One accepted client socket, cloned into independent reader and writer
/// halves so the receive loop and reply path never contend on one stream.
pub struct PersistentConnection {
    id: u64,
    peer_addr: SocketAddr,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

impl PersistentConnection {
    fn new(id: u64, stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        Ok(Self {
            id,
            peer_addr,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.reader
            .lock()
            .expect("connection reader lock poisoned")
            .read(buffer)
    }

    /// Writes the whole payload, retrying through WouldBlock so a frame is
    /// never left half-sent on the socket.
    pub fn send_all(&self, payload: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().expect("connection writer lock poisoned");
        let mut written = 0;

        while written < payload.len() {
            match writer.write(&payload[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => written += count,
                Err(source) if source.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(WRITE_RETRY_INTERVAL);
                }
                Err(source) if source.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => return Err(source),
            }
        }

        Ok(())
    }

    pub fn shutdown(&self) -> io::Result<()> {
        let _ = self
            .reader
            .lock()
            .expect("connection reader lock poisoned")
            .shutdown(Shutdown::Both);
        self.writer
            .lock()
            .expect("connection writer lock poisoned")
            .shutdown(Shutdown::Both)
    }
}

pub struct TcpServer {
    listener: TcpListener,
    next_connection_id: AtomicU64,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address)
            .map_err(|source| ServerError::Bind { address, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        let cfg = ServerConfig::from(app_config.server.clone());
        Self::bind(&cfg)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Polls the listener once. `None` means no client is waiting.
    pub fn try_accept_persistent(&self) -> Result<Option<Arc<PersistentConnection>>, ServerError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                let connection = Arc::new(PersistentConnection::new(id, stream, peer_addr)?);
                Ok(Some(connection))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(ServerError::ConfigureAcceptedStream { source }),
        }
    }
}

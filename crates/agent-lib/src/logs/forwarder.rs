//! Log forwarder to an external sink
//!
//! Supported addresses:
//! - `udp://host:port`, `tcp://host:port`: one JSON record plus `\n` per line
//! - `journal://[socket-path]`: native journald datagram protocol
//! - `__discard__`: drop everything
//!
//! The connection is opened lazily in the background. While disconnected,
//! writes fail fast with [`LogWriterError::Unavailable`] so a pump never
//! blocks on the sink.

use crate::models::{LogRecord, LogStreamType};
use crate::observability::AgentMetrics;
use crate::util::RetryPolicy;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket, UnixDatagram};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Address that disables forwarding
pub const DISCARD: &str = "__discard__";

/// Default journald socket
pub const JOURNAL_SOCKET: &str = "/run/systemd/journal/socket";

#[derive(Debug, Error)]
pub enum LogWriterError {
    #[error("invalid log forward address {0}")]
    InvalidAddress(String),

    /// No connection; the record was dropped
    #[error("log forwarder is not connected")]
    Unavailable,

    #[error("failed to encode log record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("log forwarder I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed forward address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Udp(String),
    Tcp(String),
    Journal(PathBuf),
    Discard,
}

impl LogTarget {
    pub fn parse(addr: &str) -> Result<Self, LogWriterError> {
        if addr == DISCARD {
            return Ok(LogTarget::Discard);
        }
        if let Some(path) = addr.strip_prefix("journal://") {
            let path = if path.is_empty() { JOURNAL_SOCKET } else { path };
            return Ok(LogTarget::Journal(PathBuf::from(path)));
        }

        let url = url::Url::parse(addr)
            .map_err(|_| LogWriterError::InvalidAddress(addr.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| LogWriterError::InvalidAddress(addr.to_string()))?;
        let port = url
            .port()
            .ok_or_else(|| LogWriterError::InvalidAddress(addr.to_string()))?;
        let host_port = format!("{}:{}", host, port);

        match url.scheme() {
            "udp" => Ok(LogTarget::Udp(host_port)),
            "tcp" => Ok(LogTarget::Tcp(host_port)),
            _ => Err(LogWriterError::InvalidAddress(addr.to_string())),
        }
    }
}

/// Reconnect behaviour of a [`LogWriter`]
#[derive(Debug, Clone, Copy)]
pub struct LogWriterConfig {
    /// Attempts per reconnect round
    pub max_attempts: u32,
    /// Fixed delay between attempts of one round
    pub backoff: Duration,
    /// Quiet period after an exhausted round
    pub reconnect_cooldown: Duration,
    pub connect_timeout: Duration,
    /// Bound on one record write; a stalled sink is dropped and reconnected
    pub write_timeout: Duration,
}

impl Default for LogWriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: Duration::from_secs(1),
            reconnect_cooldown: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(1),
        }
    }
}

enum Connection {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Journal(UnixDatagram),
}

#[derive(Default)]
struct ReconnectState {
    in_progress: bool,
    exhausted_at: Option<Instant>,
}

/// Forwarder of log records to the configured sink
pub struct LogWriter {
    target: LogTarget,
    config: LogWriterConfig,
    conn: Arc<Mutex<Option<Connection>>>,
    reconnect: Arc<std::sync::Mutex<ReconnectState>>,
    attempts: Arc<AtomicUsize>,
    token: CancellationToken,
    metrics: AgentMetrics,
}

impl LogWriter {
    pub fn new(addr: &str, config: LogWriterConfig, token: CancellationToken) -> Result<Self, LogWriterError> {
        Ok(Self {
            target: LogTarget::parse(addr)?,
            config,
            conn: Arc::new(Mutex::new(None)),
            reconnect: Arc::new(std::sync::Mutex::new(ReconnectState::default())),
            attempts: Arc::new(AtomicUsize::new(0)),
            token,
            metrics: AgentMetrics::new(),
        })
    }

    pub fn discard() -> Self {
        Self {
            target: LogTarget::Discard,
            config: LogWriterConfig::default(),
            conn: Arc::new(Mutex::new(None)),
            reconnect: Arc::new(std::sync::Mutex::new(ReconnectState::default())),
            attempts: Arc::new(AtomicUsize::new(0)),
            token: CancellationToken::new(),
            metrics: AgentMetrics::new(),
        }
    }

    pub fn target(&self) -> &LogTarget {
        &self.target
    }

    /// Connection attempts made since creation
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Kick off a background connection round if none is running
    pub fn connect(&self) {
        if self.target == LogTarget::Discard {
            return;
        }
        {
            let mut state = match self.reconnect.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.in_progress {
                return;
            }
            if let Some(at) = state.exhausted_at {
                if at.elapsed() < self.config.reconnect_cooldown {
                    return;
                }
            }
            state.in_progress = true;
        }

        let target = self.target.clone();
        let config = self.config;
        let conn = Arc::clone(&self.conn);
        let reconnect = Arc::clone(&self.reconnect);
        let attempts = Arc::clone(&self.attempts);
        let token = self.token.clone();

        tokio::spawn(async move {
            let policy = RetryPolicy::fixed(config.max_attempts, config.backoff);
            let result = policy
                .retry(&token, |attempt| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let target = target.clone();
                    async move {
                        debug!(attempt, "Connecting log forwarder");
                        open(&target, config.connect_timeout).await
                    }
                })
                .await;

            let connected = match result {
                Ok(connection) => {
                    info!(sink = ?target, "Log forwarder connected");
                    *conn.lock().await = Some(connection);
                    true
                }
                Err(e) => {
                    warn!(
                        sink = ?target,
                        error = %e,
                        attempts = config.max_attempts,
                        "Log forwarder reconnect round exhausted"
                    );
                    false
                }
            };

            let mut state = match reconnect.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.in_progress = false;
            state.exhausted_at = if connected { None } else { Some(Instant::now()) };
        });
    }

    /// Forward one record
    pub async fn write(&self, record: &LogRecord) -> Result<(), LogWriterError> {
        if self.target == LogTarget::Discard {
            return Ok(());
        }

        let mut guard = self.conn.lock().await;
        let Some(connection) = guard.as_mut() else {
            drop(guard);
            self.metrics.inc_log_lines_dropped();
            self.connect();
            return Err(LogWriterError::Unavailable);
        };

        let payload = match connection {
            Connection::Journal(_) => journal_payload(record),
            Connection::Udp(_) | Connection::Tcp(_) => json_line(record)?,
        };
        let send = async {
            match connection {
                Connection::Udp(socket) => socket.send(&payload).await.map(|_| ()),
                Connection::Tcp(stream) => stream.write_all(&payload).await,
                Connection::Journal(socket) => socket.send(&payload).await.map(|_| ()),
            }
        };
        let result = tokio::time::timeout(self.config.write_timeout, send).await;

        match result {
            Ok(Ok(())) => {
                self.metrics.inc_log_lines_forwarded();
                Ok(())
            }
            Err(_) => {
                // A partial write leaves the stream unusable.
                *guard = None;
                drop(guard);
                warn!(sink = ?self.target, "Log forwarder write stalled, reconnecting");
                self.metrics.inc_log_lines_dropped();
                self.connect();
                Err(LogWriterError::Unavailable)
            }
            Ok(Err(e)) => {
                *guard = None;
                drop(guard);
                warn!(error = %e, "Log forwarder write failed, reconnecting");
                self.metrics.inc_log_lines_dropped();
                self.connect();
                Err(LogWriterError::Io(e))
            }
        }
    }
}

async fn open(target: &LogTarget, timeout: Duration) -> Result<Connection, std::io::Error> {
    let connect = async {
        match target {
            LogTarget::Udp(addr) => {
                let bind = if addr.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(addr.as_str()).await?;
                Ok(Connection::Udp(socket))
            }
            LogTarget::Tcp(addr) => Ok(Connection::Tcp(TcpStream::connect(addr.as_str()).await?)),
            LogTarget::Journal(path) => {
                let socket = UnixDatagram::unbound()?;
                socket.connect(path)?;
                Ok(Connection::Journal(socket))
            }
            LogTarget::Discard => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "discard target has no connection",
            )),
        }
    };
    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "log forwarder connect timed out",
        )),
    }
}

fn json_line(record: &LogRecord) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Encode a record as a journald native-protocol datagram
pub fn journal_payload(record: &LogRecord) -> Vec<u8> {
    let priority = match record.r#type {
        LogStreamType::Stdout => "6",
        LogStreamType::Stderr => "3",
    };

    let mut payload = Vec::new();
    push_journal_field(&mut payload, "MESSAGE", &record.data);
    push_journal_field(&mut payload, "PRIORITY", priority);
    push_journal_field(&mut payload, "SYSLOG_IDENTIFIER", &record.name);
    push_journal_field(&mut payload, "ERU_ID", &record.id);
    push_journal_field(&mut payload, "ERU_ENTRYPOINT", &record.entrypoint);
    push_journal_field(&mut payload, "ERU_IDENT", &record.ident);
    push_journal_field(&mut payload, "ERU_TYPE", record.r#type.as_str());
    push_journal_field(&mut payload, "ERU_DATETIME", &record.datetime);

    let mut extra: Vec<_> = record.extra.iter().collect();
    extra.sort();
    for (key, value) in extra {
        let key = journal_key(key);
        if !key.is_empty() {
            push_journal_field(&mut payload, &format!("ERU_EXTRA_{}", key), value);
        }
    }
    payload
}

/// Journal field names are upper-case ASCII letters, digits and underscores
fn journal_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn push_journal_field(payload: &mut Vec<u8>, key: &str, value: &str) {
    payload.extend_from_slice(key.as_bytes());
    if value.contains('\n') {
        // Binary form: KEY\n<u64 LE length><value>\n
        payload.push(b'\n');
        payload.extend_from_slice(&(value.len() as u64).to_le_bytes());
        payload.extend_from_slice(value.as_bytes());
    } else {
        payload.push(b'=');
        payload.extend_from_slice(value.as_bytes());
    }
    payload.push(b'\n');
}

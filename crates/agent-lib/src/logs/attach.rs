//! Attaching to workload output and pumping lines into the log pipeline

use super::forwarder::{LogWriter, LogWriterError};
use crate::error::AgentError;
use crate::models::{LogRecord, LogStreamType, LOG_DATETIME_FORMAT};
use crate::runtime::{parse_workload_name, Runtime};
use crate::util::{with_timeout, KeyedLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identity stamped on every record of one workload
#[derive(Debug, Clone, Default)]
pub struct RecordMeta {
    pub id: String,
    pub name: String,
    pub entrypoint: String,
    pub ident: String,
    pub extra: HashMap<String, String>,
}

impl RecordMeta {
    fn record(&self, r#type: LogStreamType, data: String) -> LogRecord {
        LogRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            r#type,
            entrypoint: self.entrypoint.clone(),
            ident: self.ident.clone(),
            data,
            datetime: chrono::Utc::now().format(LOG_DATETIME_FORMAT).to_string(),
            extra: self.extra.clone(),
        }
    }
}

/// Where pumped lines go
#[derive(Clone)]
pub struct LogSink {
    pub broadcaster: mpsc::Sender<LogRecord>,
    pub writer: Arc<LogWriter>,
}

/// Opens workload output at most once per ID and pumps it into a [`LogSink`]
pub struct LogAttacher {
    runtime: Arc<dyn Runtime>,
    sink: LogSink,
    attached: KeyedLock,
    call_timeout: Duration,
}

impl LogAttacher {
    pub fn new(runtime: Arc<dyn Runtime>, sink: LogSink, call_timeout: Duration) -> Self {
        Self {
            runtime,
            sink,
            attached: KeyedLock::new(),
            call_timeout,
        }
    }

    pub fn is_attached(&self, id: &str) -> bool {
        self.attached.is_held(id)
    }

    /// Pump the workload's stdout and stderr until both end or `token` is
    /// cancelled. Returns immediately if the workload is already attached.
    pub async fn attach(&self, id: &str, token: CancellationToken) {
        let Some(_guard) = self.attached.try_acquire(id) else {
            debug!(workload_id = %id, "Workload already attached");
            return;
        };

        let name = match with_timeout(
            "get_workload_name",
            self.call_timeout,
            self.runtime.get_workload_name(id),
        )
        .await
        {
            Ok(name) => name,
            Err(e) => {
                warn!(workload_id = %id, error = %e, "Failed to resolve workload name");
                return;
            }
        };
        let (app, entrypoint, ident) = match parse_workload_name(&name) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(workload_id = %id, name = %name, error = %e, "Not attaching to workload");
                return;
            }
        };

        let extra = with_timeout(
            "log_fields_extra",
            self.call_timeout,
            self.runtime.log_fields_extra(id),
        )
        .await
        .unwrap_or_else(|e| {
            warn!(workload_id = %id, error = %e, "Failed to fetch log extras");
            HashMap::new()
        });

        let streams = match with_timeout(
            "attach_workload",
            self.call_timeout,
            self.runtime.attach_workload(id),
        )
        .await
        {
            Ok(streams) => streams,
            Err(AgentError::NotImplemented(_)) => return,
            Err(e) => {
                warn!(workload_id = %id, error = %e, "Failed to attach workload");
                return;
            }
        };

        let meta = RecordMeta {
            id: id.to_string(),
            name: app,
            entrypoint,
            ident,
            extra,
        };
        info!(workload_id = %id, app = %meta.name, "Attached to workload output");

        tokio::join!(
            pump_lines(streams.stdout, LogStreamType::Stdout, &meta, &self.sink, &token),
            pump_lines(streams.stderr, LogStreamType::Stderr, &meta, &self.sink, &token),
        );

        info!(workload_id = %id, "Workload output closed");
    }
}

/// Read `\n`-delimited lines from `reader` and forward each as a record.
///
/// Trailing `\r\n` is stripped. EOF ends the pump silently.
pub async fn pump_lines<R>(
    reader: R,
    r#type: LogStreamType,
    meta: &RecordMeta,
    sink: &LogSink,
    token: &CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = token.cancelled() => return,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                warn!(workload_id = %meta.id, stream = r#type.as_str(), error = %e, "Failed to read workload output");
                return;
            }
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        let record = meta.record(r#type, String::from_utf8_lossy(&buf).into_owned());

        match sink.writer.write(&record).await {
            Ok(()) | Err(LogWriterError::Unavailable) => {}
            Err(e) => debug!(workload_id = %meta.id, error = %e, "Failed to forward log line"),
        }
        if sink.broadcaster.send(record).await.is_err() {
            debug!(workload_id = %meta.id, "Log broadcaster is gone");
            return;
        }
    }
}

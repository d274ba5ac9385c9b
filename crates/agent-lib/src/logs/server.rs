//! Raw TCP listener for live log subscriptions
//!
//! Accepts `GET /log/?app=<name>` and answers with a chunked HTTP/1.1
//! response whose body is the broadcaster's frame stream for that app.

use super::broadcaster::LogBroadcaster;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const RESPONSE_HEADER: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Request-head size limit
const MAX_HEADER_BYTES: u64 = 8 * 1024;

/// Time a client gets to send its request head
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve subscriptions on `listener` until `token` is cancelled.
///
/// Returns once every connection task has finished.
pub async fn serve(listener: TcpListener, broadcaster: Arc<LogBroadcaster>, token: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!(addr = %addr, "Log subscription server listening"),
        Err(e) => warn!(error = %e, "Log subscription server has no local address"),
    }
    let connections = TaskTracker::new();

    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Failed to accept log subscriber");
                continue;
            }
        };

        debug!(peer = %peer, "Log subscription connection");
        let broadcaster = Arc::clone(&broadcaster);
        let token = token.clone();
        connections.spawn(async move {
            if let Err(e) = handle(stream, broadcaster, token).await {
                debug!(peer = %peer, error = %e, "Log subscription ended with error");
            }
        });
    }

    connections.close();
    connections.wait().await;
    info!("Log subscription server stopped");
}

async fn handle(
    stream: TcpStream,
    broadcaster: Arc<LogBroadcaster>,
    token: CancellationToken,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    let head = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        head = tokio::time::timeout(HEAD_TIMEOUT, read_request_line(&mut reader)) => head,
    };
    let request_line = match head {
        Ok(line) => line?,
        Err(_) => {
            debug!("Log subscriber sent no request in time");
            return Ok(());
        }
    };

    let mut stream = reader.into_inner();
    let parsed = request_line.as_deref().ok_or(BAD_REQUEST).and_then(parse_request);
    let app = match parsed {
        Ok(app) => app,
        Err(response) => {
            stream.write_all(response).await?;
            return stream.shutdown().await;
        }
    };

    stream.write_all(RESPONSE_HEADER).await?;
    broadcaster.subscribe(&app, stream, token).await;
    Ok(())
}

/// Read the request line and drain the rest of the head, at most
/// `MAX_HEADER_BYTES` in total. `None` when the request line is cut short.
async fn read_request_line<R: AsyncBufRead + Unpin>(reader: R) -> std::io::Result<Option<String>> {
    let mut head = reader.take(MAX_HEADER_BYTES);

    let mut request_line = String::new();
    head.read_line(&mut request_line).await?;
    if !request_line.ends_with('\n') {
        return Ok(None);
    }

    loop {
        let mut line = String::new();
        let n = head.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(Some(request_line))
}

/// Extract the app name from the request line, or the error response to send
fn parse_request(request_line: &str) -> Result<String, &'static [u8]> {
    let mut parts = request_line.split_whitespace();
    let (Some("GET"), Some(target)) = (parts.next(), parts.next()) else {
        return Err(BAD_REQUEST);
    };

    let url = url::Url::parse("http://localhost")
        .and_then(|base| base.join(target))
        .map_err(|_| BAD_REQUEST)?;
    if url.path().trim_end_matches('/') != "/log" {
        return Err(NOT_FOUND);
    }

    url.query_pairs()
        .find(|(k, _)| k == "app")
        .map(|(_, v)| v.into_owned())
        .filter(|app| !app.is_empty())
        .ok_or(BAD_REQUEST)
}

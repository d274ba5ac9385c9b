//! TCP and HTTP health probes shared by runtime drivers

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Health check configured on a workload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// `host:port` addresses that must accept a TCP connection
    #[serde(default)]
    pub tcp_addrs: Vec<String>,
    /// URL that must answer a GET with `http_code`
    #[serde(default)]
    pub http_url: Option<String>,
    /// Expected status; 0 accepts any 2xx/3xx
    #[serde(default)]
    pub http_code: u16,
}

impl HealthCheck {
    /// Run every configured probe; all must pass
    pub async fn probe(&self, timeout: Duration) -> bool {
        if !check_tcp(&self.tcp_addrs, timeout).await {
            return false;
        }
        match &self.http_url {
            Some(url) => check_http(url, self.http_code, timeout).await,
            None => true,
        }
    }
}

/// Health to report when no probe is run.
///
/// A running workload without a check is healthy by default; one with a
/// check stays unhealthy until a probe confirms it.
pub fn default_health(running: bool, check: Option<&HealthCheck>) -> bool {
    running && check.is_none()
}

/// Every address must accept a connection within `timeout`
pub async fn check_tcp(addrs: &[String], timeout: Duration) -> bool {
    for addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(addr = %addr, error = %e, "TCP probe failed");
                return false;
            }
            Err(_) => {
                debug!(addr = %addr, "TCP probe timed out");
                return false;
            }
        }
    }
    true
}

/// GET `url` and compare the status code
pub async fn check_http(url: &str, expected: u16, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            debug!(error = %e, "Failed to build HTTP probe client");
            return false;
        }
    };

    match client.get(url).send().await {
        Ok(resp) => {
            let status = resp.status();
            if expected == 0 {
                status.is_success() || status.is_redirection()
            } else {
                status.as_u16() == expected
            }
        }
        Err(e) => {
            debug!(url = %url, error = %e, "HTTP probe failed");
            false
        }
    }
}

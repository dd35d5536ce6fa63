//! Minimal HTTP/1.1-over-Unix-domain-socket client for VMM control sockets
//! (spec §4.6). Neither `reqwest` nor `ureq` speak Unix sockets, so this is
//! the one piece of hand-rolled wire-protocol surface the budget note in
//! spec §2 calls out explicitly.

use std::path::Path;
use std::time::Duration;

use sandbox::{Result, SandboxError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 50;
const RETRY_CAP_MS: u64 = 1000;

pub struct UdsHttpClient {
    sock_path: std::path::PathBuf,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl UdsHttpClient {
    pub fn new(sock_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            sock_path: sock_path.into(),
        }
    }

    /// Poll for the socket's existence every 10ms until `timeout` elapses.
    pub async fn wait_ready(sock_path: &Path, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if sock_path.exists() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SandboxError::SocketTimeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn request(&self, method: &str, path: &str, body: Option<&str>) -> Result<HttpResponse> {
        let mut delay = RETRY_BASE_MS;
        let mut last_err = None;
        for attempt in 0..RETRY_ATTEMPTS {
            match self.request_once(method, path, body).await {
                Ok(resp) => return Ok(resp),
                Err(e) if is_eof(&e) && attempt + 1 < RETRY_ATTEMPTS => {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    delay = (delay * 2).min(RETRY_CAP_MS);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| SandboxError::HypervisorRequest("exhausted retries".into())))
    }

    async fn request_once(&self, method: &str, path: &str, body: Option<&str>) -> Result<HttpResponse> {
        let mut stream = UnixStream::connect(&self.sock_path)
            .await
            .map_err(|e| SandboxError::HypervisorRequest(format!("connect: {e}")))?;

        let body_bytes = body.unwrap_or("");
        let mut req = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n"
        );
        if !body_bytes.is_empty() {
            req.push_str("Content-Type: application/json\r\n");
            req.push_str(&format!("Content-Length: {}\r\n", body_bytes.len()));
        }
        req.push_str("\r\n");
        req.push_str(body_bytes);

        stream
            .write_all(req.as_bytes())
            .await
            .map_err(|e| SandboxError::HypervisorRequest(format!("write: {e}")))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(|e| SandboxError::HypervisorRequest(format!("read: {e}")))?;

        if raw.is_empty() {
            return Err(SandboxError::HypervisorRequest("EOF".into()));
        }

        parse_response(&raw)
    }
}

fn is_eof(err: &SandboxError) -> bool {
    matches!(err, SandboxError::HypervisorRequest(msg) if msg.contains("EOF"))
}

fn parse_response(raw: &[u8]) -> Result<HttpResponse> {
    let text = String::from_utf8_lossy(raw);
    let mut parts = text.splitn(2, "\r\n\r\n");
    let head = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default().to_string();

    let status_line = head
        .lines()
        .next()
        .ok_or_else(|| SandboxError::HypervisorRequest("empty response".into()))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SandboxError::HypervisorRequest(format!("malformed status line: {status_line}")))?;

    Ok(HttpResponse { status, body })
}

/// 2xx success predicate shared by both adapters.
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_splits_head_and_body() {
        let raw = b"HTTP/1.1 204 No Content\r\nServer: x\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 204);
        assert_eq!(resp.body, "");
    }

    #[test]
    fn parse_response_extracts_json_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"a\":1}";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "{\"a\":1}");
    }

    #[test]
    fn is_success_covers_2xx_only() {
        assert!(is_success(200));
        assert!(is_success(204));
        assert!(is_success(299));
        assert!(!is_success(199));
        assert!(!is_success(300));
        assert!(!is_success(500));
    }
}

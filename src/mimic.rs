//! HTTP/WebSocket mimicry handshake.
//!
//! The first round-trip on every tunnel connection looks like a browser
//! WebSocket upgrade: the client sends a GET with upgrade headers against a
//! fake domain, the server validates and answers `101 Switching Protocols`,
//! then both sides fall through to the encrypted frame stream. Rejected
//! requests get an nginx-shaped decoy instead of an error.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Traffic-disguise settings for the handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MimicConfig {
    pub fake_domain: String,
    pub fake_path: String,
    pub user_agent: String,
    /// Extra request headers, `Name: value` per entry.
    pub custom_headers: Vec<String>,
    pub session_cookie: bool,
    pub chunked: bool,
}

impl MimicConfig {
    pub fn apply_defaults(&mut self) {
        if self.fake_domain.is_empty() {
            self.fake_domain = "www.google.com".to_string();
        }
        if self.fake_path.is_empty() {
            self.fake_path = "/search".to_string();
        }
        if !self.fake_path.starts_with('/') {
            self.fake_path.insert(0, '/');
        }
        if self.user_agent.is_empty() {
            self.user_agent =
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string();
        }
    }

    /// Path prefix the server matches against: the configured fake path up
    /// to the first `{` placeholder.
    pub fn path_prefix(&self) -> String {
        let p = if self.fake_path.is_empty() {
            "/tunnel"
        } else {
            &self.fake_path
        };
        let prefix = p.split('{').next().unwrap_or(p);
        if prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{}", prefix)
        }
    }
}

/// Limit on handshake head size, either direction.
const MAX_HEAD: usize = 16 * 1024;

/// A stream with a few already-read bytes stitched back onto the front.
///
/// The handshake response reader may consume past `\r\n\r\n` into the first
/// encrypted frame; those bytes must reach the frame decoder.
pub struct PrefixedStream<S> {
    head: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(head: Bytes, inner: S) -> Self {
        Self { head, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.head.is_empty() {
            let n = this.head.len().min(buf.remaining());
            buf.put_slice(&this.head[..n]);
            let _ = this.head.split_to(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ─── client side ───

/// Sends the fake WebSocket upgrade and waits for 101/200. Returns the
/// stream with any over-read response bytes preserved as its head.
pub async fn client_handshake<S>(mut stream: S, cfg: &MimicConfig) -> io::Result<PrefixedStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_request(cfg);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    let split = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(handshake_err("connection closed during handshake"));
        }
        head.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&head) {
            break pos;
        }
        if head.len() > MAX_HEAD {
            return Err(handshake_err("handshake response too large"));
        }
    };

    let status = parse_status_line(&head[..split])?;
    if status != 101 && status != 200 {
        return Err(handshake_err(&format!(
            "handshake failed: expected 101 or 200, got {}",
            status
        )));
    }

    let remainder = Bytes::copy_from_slice(&head[split..]);
    Ok(PrefixedStream::new(remainder, stream))
}

fn build_request(cfg: &MimicConfig) -> String {
    let mut path = cfg.fake_path.clone();
    if path.is_empty() {
        path = "/".to_string();
    }
    if path.contains("{rand}") {
        path = path.replace("{rand}", &rand_alphanum(8));
    }
    if !path.starts_with('/') {
        path.insert(0, '/');
    }

    let mut req = format!("GET {} HTTP/1.1\r\n", path);
    req.push_str(&format!("Host: {}\r\n", cfg.fake_domain));
    req.push_str(&format!("User-Agent: {}\r\n", cfg.user_agent));
    req.push_str("Connection: Upgrade\r\n");
    req.push_str("Upgrade: websocket\r\n");
    req.push_str(&format!("Sec-WebSocket-Key: {}\r\n", websocket_key()));
    req.push_str("Sec-WebSocket-Version: 13\r\n");
    req.push_str("Accept: */*\r\n");
    req.push_str("Accept-Language: en-US,en;q=0.9\r\n");
    for header in &cfg.custom_headers {
        if let Some((name, value)) = header.split_once(':') {
            req.push_str(&format!("{}: {}\r\n", name.trim(), value.trim()));
        }
    }
    if cfg.session_cookie {
        req.push_str(&format!("Cookie: session={}\r\n", session_id()));
    }
    req.push_str("\r\n");
    req
}

fn parse_status_line(head: &[u8]) -> io::Result<u16> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| handshake_err("non-UTF8 status line"))?;
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(handshake_err("not an HTTP response"));
    }
    parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| handshake_err("malformed status line"))
}

// ─── server side ───

/// Parsed HTTP request head plus any bytes read past it.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub host: String,
    headers: Vec<(String, String)>,
    pub remainder: Bytes,
}

impl RequestHead {
    /// Case-insensitive header lookup; empty string when absent.
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }
}

/// Reads and parses one HTTP request head from an accepted connection.
pub async fn read_request_head<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<RequestHead> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    let split = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(handshake_err("connection closed before request head"));
        }
        head.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&head) {
            break pos;
        }
        if head.len() > MAX_HEAD {
            return Err(handshake_err("request head too large"));
        }
    };

    let text = std::str::from_utf8(&head[..split])
        .map_err(|_| handshake_err("non-UTF8 request head"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();
    if method.is_empty() || path.is_empty() {
        return Err(handshake_err("malformed request line"));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let host = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("host"))
        .map(|(_, v)| v.clone())
        .unwrap_or_default();

    Ok(RequestHead {
        method,
        path,
        host,
        headers,
        remainder: Bytes::copy_from_slice(&head[split..]),
    })
}

/// Applies the mimicry acceptance rules. Returns the rejection reason so the
/// server can log it before serving a decoy.
pub fn validate_request(head: &RequestHead, cfg: &MimicConfig) -> Result<(), &'static str> {
    if head.method != "GET" {
        return Err("method");
    }

    if !cfg.fake_domain.is_empty() {
        let host = head
            .host
            .rsplit_once(':')
            .map(|(h, p)| if p.parse::<u16>().is_ok() { h } else { head.host.as_str() })
            .unwrap_or(head.host.as_str());
        let domain_ok = host == cfg.fake_domain
            || host
                .strip_suffix(&cfg.fake_domain)
                .map_or(false, |rest| rest.ends_with('.'));
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if !domain_ok && bare.parse::<IpAddr>().is_err() {
            return Err("host");
        }
    }

    if head.header("Upgrade").is_empty()
        || !head.header("Connection").to_lowercase().contains("upgrade")
    {
        return Err("no upgrade");
    }

    if !head.path.starts_with(&cfg.path_prefix()) {
        return Err("path");
    }

    Ok(())
}

/// Fixed `101 Switching Protocols` written after a successful validation.
pub const SWITCH_RESPONSE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
\r\n";

/// Builds the catch-all decoy response for a rejected or unrelated request.
/// `/` and `/index.html` get a 200 with a default nginx page; API-looking
/// paths get a JSON error; everything else a 404.
pub fn decoy_response(path: &str) -> Vec<u8> {
    let json = path.contains("api") || path.contains("json");
    let body: Vec<u8> = if json {
        format!(
            "{{\"status\":\"error\",\"code\":404,\"ts\":{}}}",
            chrono::Utc::now().timestamp()
        )
        .into_bytes()
    } else {
        b"<!DOCTYPE html><html><head><title>Welcome to nginx!</title>\
<style>body{width:35em;margin:0 auto;font-family:Tahoma,Verdana,Arial,sans-serif}</style>\
</head><body><h1>Welcome to nginx!</h1>\
<p>If you see this page, the nginx web server is successfully installed.</p>\
</body></html>"
            .to_vec()
    };

    let (status, content_type) = if json {
        ("404 Not Found", "application/json")
    } else if path == "/" || path == "/index.html" {
        ("200 OK", "text/html")
    } else {
        ("404 Not Found", "text/html")
    };

    let mut resp = format!(
        "HTTP/1.1 {}\r\nServer: nginx/1.18.0\r\nDate: {}\r\nContent-Type: {}\r\n\
Content-Length: {}\r\nConnection: keep-alive\r\nX-Frame-Options: SAMEORIGIN\r\n\r\n",
        status,
        chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT"),
        content_type,
        body.len(),
    )
    .into_bytes();
    resp.extend_from_slice(&body);
    resp
}

// ─── helpers ───

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn handshake_err(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn rand_alphanum(n: usize) -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| LETTERS[*b as usize % LETTERS.len()] as char)
        .collect()
}

fn websocket_key() -> String {
    let mut key = [0u8; 16];
    OsRng.fill_bytes(&mut key);
    BASE64.encode(key)
}

fn session_id() -> String {
    let mut id = [0u8; 16];
    OsRng.fill_bytes(&mut id);
    id.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn cfg() -> MimicConfig {
        let mut cfg = MimicConfig::default();
        cfg.apply_defaults();
        cfg
    }

    #[tokio::test]
    async fn test_handshake_both_sides() {
        let (client_end, mut server_end) = duplex(64 * 1024);

        let client = tokio::spawn(async move { client_handshake(client_end, &cfg()).await });

        let head = read_request_head(&mut server_end).await.unwrap();
        assert_eq!(head.method, "GET");
        assert!(validate_request(&head, &cfg()).is_ok());
        server_end.write_all(SWITCH_RESPONSE).await.unwrap();
        // Bytes written before the client finishes parsing must survive as
        // the head of the post-handshake stream.
        server_end.write_all(b"FRAME-BYTES").await.unwrap();

        let mut stream = client.await.unwrap().unwrap();
        let mut got = [0u8; 11];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"FRAME-BYTES");
    }

    #[tokio::test]
    async fn test_request_carries_upgrade_headers() {
        let req = build_request(&cfg());
        assert!(req.starts_with("GET /search HTTP/1.1\r\n"));
        assert!(req.contains("Host: www.google.com\r\n"));
        assert!(req.contains("Connection: Upgrade\r\n"));
        assert!(req.contains("Upgrade: websocket\r\n"));
        assert!(req.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_rand_path_substitution() {
        let mut config = cfg();
        config.fake_path = "/assets/{rand}/app.js".to_string();
        let req = build_request(&config);
        let line = req.lines().next().unwrap();
        assert!(!line.contains("{rand}"));
        assert!(line.starts_with("GET /assets/"));
        assert!(line.ends_with("/app.js HTTP/1.1"));
        assert_eq!(config.path_prefix(), "/assets/");
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        let mk = |method: &str, path: &str, host: &str, upgrade: &str, conn: &str| RequestHead {
            method: method.to_string(),
            path: path.to_string(),
            host: host.to_string(),
            headers: vec![
                ("Upgrade".to_string(), upgrade.to_string()),
                ("Connection".to_string(), conn.to_string()),
            ],
            remainder: Bytes::new(),
        };
        let c = cfg();

        assert!(validate_request(&mk("GET", "/search", "www.google.com", "websocket", "Upgrade"), &c).is_ok());
        // IP-literal hosts are allowed through.
        assert!(validate_request(&mk("GET", "/search", "203.0.113.7:2020", "websocket", "Upgrade"), &c).is_ok());
        // Subdomains of the fake domain pass.
        assert!(validate_request(&mk("GET", "/search", "mail.www.google.com", "websocket", "Upgrade"), &c).is_ok());

        assert_eq!(validate_request(&mk("POST", "/search", "www.google.com", "websocket", "Upgrade"), &c), Err("method"));
        assert_eq!(validate_request(&mk("GET", "/search", "evil.example", "websocket", "Upgrade"), &c), Err("host"));
        assert_eq!(validate_request(&mk("GET", "/search", "www.google.com", "", "Upgrade"), &c), Err("no upgrade"));
        assert_eq!(validate_request(&mk("GET", "/search", "www.google.com", "websocket", "close"), &c), Err("no upgrade"));
        assert_eq!(validate_request(&mk("GET", "/other", "www.google.com", "websocket", "Upgrade"), &c), Err("path"));
    }

    #[test]
    fn test_decoy_variants() {
        let index = String::from_utf8(decoy_response("/")).unwrap();
        assert!(index.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(index.contains("Server: nginx/1.18.0"));
        assert!(index.contains("Welcome to nginx!"));

        let missing = String::from_utf8(decoy_response("/wp-admin")).unwrap();
        assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"));

        let api = String::from_utf8(decoy_response("/api/v1/users")).unwrap();
        assert!(api.contains("\"status\":\"error\""));
        assert!(api.contains("\"code\":404"));
    }

    #[test]
    fn test_handshake_rejects_non_http() {
        assert!(parse_status_line(b"SSH-2.0-OpenSSH_8.9").is_err());
        assert_eq!(parse_status_line(b"HTTP/1.1 101 Switching Protocols").unwrap(), 101);
    }
}

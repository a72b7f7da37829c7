//! Minimal HTTP/1.x client over a byte duplex
//!
//! Enough HTTP for this client's two consumers: directory fetches inside
//! circuits (HTTP/1.0, close-delimited) and user fetches through the façade
//! (HTTP/1.1 with `Connection: close`). Bodies are read by Content-Length,
//! chunked encoding, or connection close.

use async_trait::async_trait;

use crate::error::{Result, TorError};

/// Byte-oriented duplex the HTTP client runs over. Implemented by plain Tor
/// streams and by the TLS wrapper.
#[async_trait(?Send)]
pub trait ByteDuplex {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;
}

#[async_trait(?Send)]
impl ByteDuplex for crate::protocol::TorStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        // Inherent method, not this trait method
        crate::protocol::TorStream::read(self, buf).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        crate::protocol::TorStream::write_all(self, data).await
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub host: String,
    pub version_1_0: bool,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn get(host: &str, path: &str) -> Self {
        Self {
            method: "GET".into(),
            path: path.into(),
            host: host.into(),
            version_1_0: false,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Directory requests use HTTP/1.0 and close-delimited bodies.
    pub fn directory(path: &str) -> Self {
        Self {
            method: "GET".into(),
            path: path.into(),
            host: "127.0.0.1".into(),
            version_1_0: true,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let version = if self.version_1_0 { "1.0" } else { "1.1" };
        let mut out = format!(
            "{} {} HTTP/{}\r\nHost: {}\r\nConnection: close\r\n",
            self.method, self.path, version, self.host
        );
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.body.is_empty() {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// A parsed response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse a full response held in memory.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let header_end = find_header_end(raw)
            .ok_or_else(|| TorError::Internal("response has no header terminator".into()))?;
        let head = std::str::from_utf8(&raw[..header_end])
            .map_err(|_| TorError::Internal("response headers are not UTF-8".into()))?;

        let mut lines = head.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| TorError::Internal("empty response".into()))?;
        let mut status_words = status_line.splitn(3, ' ');
        let _version = status_words.next();
        let status: u16 = status_words
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TorError::Internal(format!("bad status line: {}", status_line)))?;
        let reason = status_words.next().unwrap_or("").to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        let raw_body = &raw[header_end + 4..];
        let mut response = Self {
            status,
            reason,
            headers,
            body: Vec::new(),
        };

        response.body = if response
            .header("transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            decode_chunked(raw_body)?
        } else if let Some(length) = response
            .header("content-length")
            .and_then(|v| v.parse::<usize>().ok())
        {
            raw_body[..length.min(raw_body.len())].to_vec()
        } else {
            raw_body.to_vec()
        };

        Ok(response)
    }
}

/// Send `request` and read the full response (the connection is
/// close-delimited, so EOF bounds the body).
pub async fn execute<D: ByteDuplex>(duplex: &mut D, request: &Request) -> Result<Response> {
    duplex.write_all(&request.to_bytes()).await?;

    let mut raw = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        match duplex.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
            Err(e) if !raw.is_empty() => {
                log::warn!("response truncated after {} bytes: {}", raw.len(), e);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Response::parse(&raw)
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

fn decode_chunked(raw: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut offset = 0;

    loop {
        let line_end = raw[offset..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| offset + p)
            .ok_or_else(|| TorError::Internal("truncated chunk header".into()))?;
        let size_str = std::str::from_utf8(&raw[offset..line_end])
            .map_err(|_| TorError::Internal("bad chunk size".into()))?;
        let size = usize::from_str_radix(size_str.trim().split(';').next().unwrap_or(""), 16)
            .map_err(|_| TorError::Internal(format!("bad chunk size: {}", size_str)))?;

        offset = line_end + 2;
        if size == 0 {
            break;
        }
        if offset + size > raw.len() {
            // Connection closed mid-chunk; keep what arrived.
            body.extend_from_slice(&raw[offset..]);
            break;
        }
        body.extend_from_slice(&raw[offset..offset + size]);
        offset += size + 2; // skip trailing CRLF
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_formatting() {
        let request = Request::get("example.org", "/index.html")
            .header("User-Agent", "test");
        let text = String::from_utf8(request.to_bytes()).unwrap();

        assert!(text.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.org\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("User-Agent: test\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn directory_request_is_http_1_0() {
        let request = Request::directory("/tor/status-vote/current/consensus-microdesc");
        let text = String::from_utf8(request.to_bytes()).unwrap();
        assert!(text.contains("HTTP/1.0\r\n"));
    }

    #[test]
    fn post_carries_content_length() {
        let mut request = Request::get("api.example", "/v1/send");
        request.method = "POST".into();
        request.body = b"{\"a\":1}".to_vec();
        let text = String::from_utf8(request.to_bytes()).unwrap();
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("{\"a\":1}"));
    }

    #[test]
    fn parses_content_length_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Extra: yes\r\n\r\nhellotrailing";
        let response = Response::parse(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert_eq!(response.header("x-extra"), Some("yes"));
        assert_eq!(response.body, b"hello");
        assert!(response.is_success());
    }

    #[test]
    fn parses_chunked_response() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let response = Response::parse(raw).unwrap();
        assert_eq!(response.body, b"hello world");
    }

    #[test]
    fn parses_close_delimited_response() {
        let raw = b"HTTP/1.0 404 Not Found\r\n\r\ngone";
        let response = Response::parse(raw).unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body, b"gone");
        assert!(!response.is_success());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Response::parse(b"not http at all").is_err());
    }
}

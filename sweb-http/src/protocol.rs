//! HTTP request containers and the incremental framing parser.
//!
//! The parser is deliberately small: request line, headers, and a `Content-Length` body. It
//! never blocks and never consumes bytes for an incomplete request, so callers can feed
//! arbitrary network chunks and retry on the next readiness event.

use sweb_common::error::{SwebError, SwebResult};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Request methods understood by the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Patch,
    /// Tunnel establishment. Connections carrying this method switch to long-lived raw
    /// forwarding once a handler owns them.
    Connect,
}

impl HttpMethod {
    /// Parses one request-line method token.
    #[must_use]
    pub fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"GET" => Some(Self::Get),
            b"HEAD" => Some(Self::Head),
            b"POST" => Some(Self::Post),
            b"PUT" => Some(Self::Put),
            b"DELETE" => Some(Self::Delete),
            b"OPTIONS" => Some(Self::Options),
            b"TRACE" => Some(Self::Trace),
            b"PATCH" => Some(Self::Patch),
            b"CONNECT" => Some(Self::Connect),
            _ => None,
        }
    }

    /// Canonical uppercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
            Self::Connect => "CONNECT",
        }
    }

    /// Returns `true` for tunnel-establishing requests.
    #[must_use]
    pub fn is_tunnel(self) -> bool {
        matches!(self, Self::Connect)
    }
}

/// One fully decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    /// Request method.
    pub method: HttpMethod,
    /// Request target exactly as sent (origin-form path or CONNECT authority).
    pub target: String,
    /// Protocol version token, e.g. `HTTP/1.1`.
    pub version: String,
    /// Header name/value pairs in arrival order.
    pub headers: Vec<(String, Vec<u8>)>,
    /// Request body bytes.
    pub body: Vec<u8>,
}

impl DecodedRequest {
    /// Case-insensitive single-header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }
}

/// Size bounds applied while framing one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    /// Maximum bytes allowed for request line plus headers.
    pub max_head_bytes: usize,
    /// Maximum declared `Content-Length`.
    pub max_body_bytes: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_head_bytes: 16 * 1024,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Outcome of one framing attempt over buffered bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are required; nothing was consumed.
    Incomplete,
    /// One request completed, consuming `consumed` buffered bytes.
    Complete {
        request: DecodedRequest,
        consumed: usize,
    },
}

/// Attempts to frame one request from the start of `buffer`.
///
/// # Errors
///
/// Returns `SwebError::Protocol` for malformed request lines or headers, unsupported
/// transfer encodings, and head/body sizes beyond `limits`.
pub fn parse_next_request(buffer: &[u8], limits: &ParseLimits) -> SwebResult<ParseStatus> {
    let Some(head_len) = find_head_end(buffer) else {
        if buffer.len() > limits.max_head_bytes {
            return Err(SwebError::Protocol(format!(
                "request head exceeds {} bytes",
                limits.max_head_bytes
            )));
        }
        return Ok(ParseStatus::Incomplete);
    };
    if head_len > limits.max_head_bytes {
        return Err(SwebError::Protocol(format!(
            "request head exceeds {} bytes",
            limits.max_head_bytes
        )));
    }

    let head = &buffer[..head_len];
    let mut lines = head.split(|byte| *byte == b'\n').map(strip_carriage_return);
    let request_line = lines
        .next()
        .ok_or_else(|| SwebError::Protocol("empty request head".to_string()))?;
    let (method, target, version) = parse_request_line(request_line)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        headers.push(parse_header_line(line)?);
    }

    let request = DecodedRequest {
        method,
        target,
        version,
        headers,
        body: Vec::new(),
    };

    if request.header("transfer-encoding").is_some() {
        return Err(SwebError::Protocol(
            "transfer encoding is not supported by the built-in decoder".to_string(),
        ));
    }

    let body_len = declared_content_length(&request, limits)?;
    let consumed = head_len + HEAD_TERMINATOR.len() + body_len;
    if buffer.len() < consumed {
        return Ok(ParseStatus::Incomplete);
    }

    let body_start = head_len + HEAD_TERMINATOR.len();
    let request = DecodedRequest {
        body: buffer[body_start..consumed].to_vec(),
        ..request
    };
    Ok(ParseStatus::Complete { request, consumed })
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

fn strip_carriage_return(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_request_line(line: &[u8]) -> SwebResult<(HttpMethod, String, String)> {
    let mut parts = line
        .split(|byte| *byte == b' ')
        .filter(|part| !part.is_empty());
    let method_token = parts
        .next()
        .ok_or_else(|| SwebError::Protocol("missing request method".to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| SwebError::Protocol("missing request target".to_string()))?;
    let version = parts
        .next()
        .ok_or_else(|| SwebError::Protocol("missing protocol version".to_string()))?;
    if parts.next().is_some() {
        return Err(SwebError::Protocol(
            "request line has trailing tokens".to_string(),
        ));
    }

    let method = HttpMethod::from_token(method_token).ok_or_else(|| {
        SwebError::Protocol(format!(
            "unknown request method: {}",
            String::from_utf8_lossy(method_token)
        ))
    })?;
    if !version.starts_with(b"HTTP/") {
        return Err(SwebError::Protocol(format!(
            "unsupported protocol version: {}",
            String::from_utf8_lossy(version)
        )));
    }

    let target = String::from_utf8(target.to_vec())
        .map_err(|_| SwebError::Protocol("request target is not valid UTF-8".to_string()))?;
    let version = String::from_utf8(version.to_vec())
        .map_err(|_| SwebError::Protocol("protocol version is not valid UTF-8".to_string()))?;
    Ok((method, target, version))
}

fn parse_header_line(line: &[u8]) -> SwebResult<(String, Vec<u8>)> {
    let colon = line.iter().position(|byte| *byte == b':').ok_or_else(|| {
        SwebError::Protocol(format!(
            "malformed header line: {}",
            String::from_utf8_lossy(line)
        ))
    })?;
    let name = std::str::from_utf8(&line[..colon])
        .map_err(|_| SwebError::Protocol("header name is not valid UTF-8".to_string()))?
        .trim();
    if name.is_empty() {
        return Err(SwebError::Protocol("empty header name".to_string()));
    }
    let value = trim_ascii_whitespace(&line[colon + 1..]);
    Ok((name.to_string(), value.to_vec()))
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(start, |position| position + 1);
    &bytes[start..end]
}

fn declared_content_length(request: &DecodedRequest, limits: &ParseLimits) -> SwebResult<usize> {
    let Some(value) = request.header("content-length") else {
        return Ok(0);
    };
    let text = std::str::from_utf8(value)
        .map_err(|_| SwebError::Protocol("content-length is not valid UTF-8".to_string()))?;
    let length = text
        .trim()
        .parse::<usize>()
        .map_err(|_| SwebError::Protocol(format!("invalid content-length: {text}")))?;
    if length > limits.max_body_bytes {
        return Err(SwebError::Protocol(format!(
            "declared body of {length} bytes exceeds {} byte limit",
            limits.max_body_bytes
        )));
    }
    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::{HttpMethod, ParseLimits, ParseStatus, parse_next_request};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn parser_waits_for_complete_head() {
        let status = parse_next_request(b"GET / HTTP/1.1\r\nHost: local", &ParseLimits::default())
            .expect("partial head should not fail");

        assert_that!(&status, eq(&ParseStatus::Incomplete));
    }

    #[rstest]
    fn parser_frames_request_without_body() {
        let bytes = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let status = parse_next_request(bytes, &ParseLimits::default())
            .expect("well-formed request should parse");

        let ParseStatus::Complete { request, consumed } = status else {
            panic!("request should be complete");
        };
        assert_that!(request.method, eq(HttpMethod::Get));
        assert_that!(request.target.as_str(), eq("/index.html"));
        assert_that!(request.version.as_str(), eq("HTTP/1.1"));
        assert_that!(request.header("host"), some(eq(b"localhost".as_slice())));
        assert_that!(request.body.is_empty(), eq(true));
        assert_that!(consumed, eq(bytes.len()));
    }

    #[rstest]
    fn parser_waits_for_declared_body() {
        let head = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nab";
        let status = parse_next_request(head, &ParseLimits::default())
            .expect("partial body should not fail");
        assert_that!(&status, eq(&ParseStatus::Incomplete));

        let full = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let status = parse_next_request(full, &ParseLimits::default())
            .expect("complete body should parse");
        let ParseStatus::Complete { request, consumed } = status else {
            panic!("request should be complete");
        };
        assert_that!(&request.body, eq(&b"hello".to_vec()));
        assert_that!(consumed, eq(full.len()));
    }

    #[rstest]
    fn parser_classifies_connect_requests() {
        let bytes = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let status = parse_next_request(bytes, &ParseLimits::default())
            .expect("connect request should parse");

        let ParseStatus::Complete { request, .. } = status else {
            panic!("request should be complete");
        };
        assert_that!(request.method.is_tunnel(), eq(true));
        assert_that!(request.target.as_str(), eq("example.com:443"));
    }

    #[rstest]
    fn parser_rejects_unknown_methods() {
        let result = parse_next_request(b"BREW /pot HTTP/1.1\r\n\r\n", &ParseLimits::default());

        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn parser_rejects_oversized_head() {
        let limits = ParseLimits {
            max_head_bytes: 32,
            ..ParseLimits::default()
        };
        let mut bytes = b"GET / HTTP/1.1\r\n".to_vec();
        bytes.extend_from_slice(&b"X".repeat(64));

        let result = parse_next_request(&bytes, &limits);

        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn parser_rejects_body_beyond_limit() {
        let limits = ParseLimits {
            max_body_bytes: 4,
            ..ParseLimits::default()
        };
        let result = parse_next_request(
            b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n",
            &limits,
        );

        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn parser_rejects_transfer_encoding() {
        let result = parse_next_request(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
            &ParseLimits::default(),
        );

        assert_that!(result.is_err(), eq(true));
    }
}

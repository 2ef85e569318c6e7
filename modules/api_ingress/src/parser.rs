//! HTTP/1.1 request reader.
//!
//! Reads one request (line, headers, body) from a buffered stream with hard
//! limits on the header block and the body. Bodies are framed either by
//! `Content-Length` or `Transfer-Encoding: chunked`.

use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::request::{Body, Request};

#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: crate::config::DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: crate::config::DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("connection closed before a request was received")]
    ConnectionClosed,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("unsupported protocol version '{0}'")]
    UnsupportedVersion(String),
    #[error("malformed header line")]
    BadHeader,
    #[error("header block exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },
    #[error("invalid content-length")]
    BadContentLength,
    #[error("unsupported transfer-encoding '{0}'")]
    UnsupportedTransferEncoding(String),
    #[error("malformed chunked body")]
    BadChunk,
    #[error("body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("request body is not valid JSON")]
    Json(#[source] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Status to answer with; `None` when the peer is gone and nothing should be written.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ParseError::ConnectionClosed | ParseError::Io(_) => None,
            ParseError::HeadersTooLarge { .. } => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            ParseError::BodyTooLarge { .. } => Some(StatusCode::PAYLOAD_TOO_LARGE),
            ParseError::UnsupportedTransferEncoding(_) => Some(StatusCode::NOT_IMPLEMENTED),
            ParseError::UnsupportedVersion(_) => Some(StatusCode::HTTP_VERSION_NOT_SUPPORTED),
            // a body that does not parse is a server-side failure for this API
            ParseError::Json(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            _ => Some(StatusCode::BAD_REQUEST),
        }
    }
}

/// Methods whose body is buffered and attached to the request.
pub fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

pub async fn read_request<R>(reader: &mut R, limits: &ParseLimits) -> Result<Request, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = limits.max_header_bytes;

    let mut line = Vec::new();
    // tolerate a stray CRLF between requests
    loop {
        line.clear();
        let n = read_line(reader, &mut line, &mut budget, limits.max_header_bytes).await?;
        if n == 0 {
            return Err(ParseError::ConnectionClosed);
        }
        if !trim_eol(&line).is_empty() {
            break;
        }
    }

    let (method, target) = parse_request_line(trim_eol(&line))?;
    let headers = read_headers(reader, &mut budget, limits.max_header_bytes).await?;

    let mut req = Request::new(method, target);
    let raw = read_body(reader, &headers, limits).await?;
    if carries_body(&req.method) {
        req.body = decode_body(&headers, raw.unwrap_or_default())?;
    }
    req.headers = headers;
    Ok(req)
}

async fn read_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    budget: &mut usize,
    limit: usize,
) -> Result<usize, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(*budget as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if n > *budget {
        return Err(ParseError::HeadersTooLarge { limit });
    }
    *budget -= n;
    if n > 0 && buf.last() != Some(&b'\n') {
        // EOF in the middle of a line
        return Err(ParseError::BadHeader);
    }
    Ok(n)
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String), ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::BadRequestLine)?;
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::BadRequestLine);
    };
    if !version.starts_with("HTTP/") {
        return Err(ParseError::BadRequestLine);
    }
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(ParseError::UnsupportedVersion(version.to_string()));
    }
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::BadRequestLine)?;
    if target.is_empty() || !(target.starts_with('/') || target == "*") {
        return Err(ParseError::BadRequestLine);
    }
    Ok((method, target.to_string()))
}

async fn read_headers<R>(
    reader: &mut R,
    budget: &mut usize,
    limit: usize,
) -> Result<HeaderMap, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if read_line(reader, &mut line, budget, limit).await? == 0 {
            return Err(ParseError::BadHeader);
        }
        let l = trim_eol(&line);
        if l.is_empty() {
            return Ok(headers);
        }
        let colon = l.iter().position(|&b| b == b':').ok_or(ParseError::BadHeader)?;
        let name = HeaderName::from_bytes(&l[..colon]).map_err(|_| ParseError::BadHeader)?;
        let value =
            HeaderValue::from_bytes(l[colon + 1..].trim_ascii()).map_err(|_| ParseError::BadHeader)?;
        headers.append(name, value);
    }
}

enum Framing {
    None,
    Length(usize),
    Chunked,
}

fn framing(headers: &HeaderMap) -> Result<Framing, ParseError> {
    if let Some(te) = headers.get(TRANSFER_ENCODING) {
        let te = te.to_str().map_err(|_| ParseError::BadHeader)?;
        let last = te.rsplit(',').next().unwrap_or("").trim();
        if last.eq_ignore_ascii_case("chunked") && !te.contains(',') {
            return Ok(Framing::Chunked);
        }
        return Err(ParseError::UnsupportedTransferEncoding(te.to_string()));
    }

    let mut length = None;
    for v in headers.get_all(CONTENT_LENGTH) {
        let n: usize = v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or(ParseError::BadContentLength)?;
        if length.is_some_and(|prev| prev != n) {
            return Err(ParseError::BadContentLength);
        }
        length = Some(n);
    }
    Ok(length.map_or(Framing::None, Framing::Length))
}

async fn read_body<R>(
    reader: &mut R,
    headers: &HeaderMap,
    limits: &ParseLimits,
) -> Result<Option<Vec<u8>>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let limit = limits.max_body_bytes;
    match framing(headers)? {
        Framing::None => Ok(None),
        Framing::Length(n) => {
            if n > limit {
                return Err(ParseError::BodyTooLarge { limit });
            }
            let mut body = vec![0u8; n];
            reader.read_exact(&mut body).await?;
            Ok(Some(body))
        }
        Framing::Chunked => read_chunked(reader, limit).await.map(Some),
    }
}

async fn read_chunked<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    const MAX_CHUNK_LINE: usize = 4096;

    let mut body = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let mut budget = MAX_CHUNK_LINE;
        if read_line(reader, &mut line, &mut budget, MAX_CHUNK_LINE)
            .await
            .map_err(|_| ParseError::BadChunk)?
            == 0
        {
            return Err(ParseError::BadChunk);
        }
        let size_field = trim_eol(&line);
        // chunk extensions are ignored
        let size_field = size_field.split(|&b| b == b';').next().unwrap_or(&[]);
        let size_str = std::str::from_utf8(size_field)
            .map_err(|_| ParseError::BadChunk)?
            .trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| ParseError::BadChunk)?;

        if size == 0 {
            // trailer section, discarded
            loop {
                line.clear();
                let mut budget = MAX_CHUNK_LINE;
                let n = read_line(reader, &mut line, &mut budget, MAX_CHUNK_LINE)
                    .await
                    .map_err(|_| ParseError::BadChunk)?;
                if n == 0 || trim_eol(&line).is_empty() {
                    return Ok(body);
                }
            }
        }

        if body.len().saturating_add(size) > limit {
            return Err(ParseError::BodyTooLarge { limit });
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(ParseError::BadChunk);
        }
    }
}

fn decode_body(headers: &HeaderMap, raw: Vec<u8>) -> Result<Body, ParseError> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"));
    if !is_json {
        return Ok(Body::Raw(raw));
    }
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Body::Json(serde_json::Value::Object(Default::default())));
    }
    serde_json::from_slice(&raw).map(Body::Json).map_err(ParseError::Json)
}

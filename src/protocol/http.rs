use crate::utils::error::{AratagaError, Result};
use base64::Engine;

/// Upper bound for an incoming request head. A head that does not fit is
/// treated as a parse error.
pub const MAX_REQUEST_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Parsed request line + headers of one HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub minor_version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

/// Parsed status line + headers of one HTTP/1.1 response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub minor_version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

/// How the message body after a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    UntilEof,
}

/// Try to parse a complete request head out of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some((head, consumed)))`
/// when the head (including the final CRLFCRLF) occupies `consumed` bytes.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let method = req
                .method
                .ok_or_else(|| AratagaError::Protocol("Request without method".to_string()))?
                .to_string();
            let target = req
                .path
                .ok_or_else(|| {
                    AratagaError::Protocol("Request without request-target".to_string())
                })?
                .to_string();
            let minor_version = req.version.unwrap_or(1);

            let headers = req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect();

            Ok(Some((
                RequestHead {
                    method,
                    target,
                    minor_version,
                    headers,
                },
                consumed,
            )))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() >= MAX_REQUEST_HEAD_SIZE {
                return Err(AratagaError::Protocol(
                    "Request head exceeds the allowed size".to_string(),
                ));
            }
            Ok(None)
        }
        Err(e) => Err(AratagaError::Protocol(format!(
            "Malformed HTTP request: {}",
            e
        ))),
    }
}

/// Try to parse a complete response head out of `buf`.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    match resp.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let status = resp
                .code
                .ok_or_else(|| AratagaError::Protocol("Response without status".to_string()))?;
            let reason = resp.reason.unwrap_or("").to_string();
            let minor_version = resp.version.unwrap_or(1);

            let headers = resp
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect();

            Ok(Some((
                ResponseHead {
                    status,
                    reason,
                    minor_version,
                    headers,
                },
                consumed,
            )))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() >= MAX_REQUEST_HEAD_SIZE {
                return Err(AratagaError::Protocol(
                    "Response head exceeds the allowed size".to_string(),
                ));
            }
            Ok(None)
        }
        Err(e) => Err(AratagaError::Protocol(format!(
            "Malformed HTTP response: {}",
            e
        ))),
    }
}

fn header_value<'a>(headers: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_slice())
}

/// Split `host[:port]` into its parts, defaulting the port.
pub fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err(AratagaError::Protocol("Empty target host".to_string()));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port: u16 = port.parse().map_err(|_| {
                AratagaError::Protocol(format!("Invalid target port in '{}'", authority))
            })?;
            if host.is_empty() {
                return Err(AratagaError::Protocol("Empty target host".to_string()));
            }
            Ok((host.to_string(), port))
        }
        // No colon, or a bare IPv6 literal which is not a valid authority here
        _ => {
            if authority.contains(':') {
                return Err(AratagaError::Protocol(format!(
                    "Invalid target authority '{}'",
                    authority
                )));
            }
            Ok((authority.to_string(), default_port))
        }
    }
}

/// Derive the `(host, port)` a request is aimed at.
///
/// For CONNECT the request-target is the authority itself. For other methods
/// the absolute-form request-target wins; an origin-form target falls back to
/// the `Host` header.
pub fn extract_target(head: &RequestHead) -> Result<(String, u16)> {
    if head.method.eq_ignore_ascii_case("CONNECT") {
        return split_host_port(&head.target, 443);
    }

    if let Some(rest) = head.target.strip_prefix("http://") {
        let authority = rest.split(['/', '?']).next().unwrap_or("");
        return split_host_port(authority, 80);
    }

    if head.target.starts_with("https://") {
        return Err(AratagaError::Protocol(
            "https request-target cannot be proxied in plain mode".to_string(),
        ));
    }

    match header_value(&head.headers, "host") {
        Some(host) => {
            let host = std::str::from_utf8(host)
                .map_err(|_| AratagaError::Protocol("Invalid Host header".to_string()))?;
            split_host_port(host, 80)
        }
        None => Err(AratagaError::Protocol(
            "No absolute request-target and no Host header".to_string(),
        )),
    }
}

/// Extract credentials from `Proxy-Authorization: Basic <base64(user:pass)>`.
///
/// A missing header yields `Ok(None)`; a present but malformed header is an
/// error so the caller can answer with the right 400 variant.
pub fn extract_proxy_credentials(head: &RequestHead) -> Result<Option<(String, String)>> {
    let value = match header_value(&head.headers, "proxy-authorization") {
        Some(v) => v,
        None => return Ok(None),
    };

    let value = std::str::from_utf8(value)
        .map_err(|_| AratagaError::Protocol("Invalid Proxy-Authorization header".to_string()))?;

    let payload = value
        .trim()
        .strip_prefix("Basic ")
        .or_else(|| value.trim().strip_prefix("basic "))
        .ok_or_else(|| {
            AratagaError::Protocol("Only Basic proxy authorization is supported".to_string())
        })?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|_| AratagaError::Protocol("Invalid base64 in Proxy-Authorization".to_string()))?;

    let decoded = String::from_utf8(decoded)
        .map_err(|_| AratagaError::Protocol("Invalid Proxy-Authorization payload".to_string()))?;

    match decoded.split_once(':') {
        Some((user, pass)) => Ok(Some((user.to_string(), pass.to_string()))),
        None => Err(AratagaError::Protocol(
            "Proxy-Authorization payload has no ':' separator".to_string(),
        )),
    }
}

/// Whether the client side of this request should be kept open afterwards.
pub fn request_keeps_alive(head: &RequestHead) -> bool {
    keeps_alive(head.minor_version, &head.headers)
}

fn keeps_alive(minor_version: u8, headers: &[(String, Vec<u8>)]) -> bool {
    let connection = header_value(headers, "connection")
        .or_else(|| header_value(headers, "proxy-connection"));

    match connection {
        Some(v) => {
            let v = String::from_utf8_lossy(v);
            let wants_close = v
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"));
            let wants_keep = v
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("keep-alive"));
            if minor_version == 0 {
                wants_keep
            } else {
                !wants_close
            }
        }
        None => minor_version >= 1,
    }
}

/// Determine how a request body is framed.
pub fn request_body_framing(head: &RequestHead) -> Result<BodyFraming> {
    body_framing_from_headers(&head.headers, BodyFraming::None)
}

/// Determine how a response body is framed.
///
/// `head_request` must be true when replying to a HEAD request; 1xx/204/304
/// responses never carry a body either.
pub fn response_body_framing(head: &ResponseHead, head_request: bool) -> Result<BodyFraming> {
    if head_request || head.status / 100 == 1 || head.status == 204 || head.status == 304 {
        return Ok(BodyFraming::None);
    }
    body_framing_from_headers(&head.headers, BodyFraming::UntilEof)
}

fn body_framing_from_headers(
    headers: &[(String, Vec<u8>)],
    fallback: BodyFraming,
) -> Result<BodyFraming> {
    if let Some(te) = header_value(headers, "transfer-encoding") {
        let te = String::from_utf8_lossy(te);
        if te
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
        {
            return Ok(BodyFraming::Chunked);
        }
        return Err(AratagaError::Protocol(format!(
            "Unsupported transfer-encoding: {}",
            te
        )));
    }

    if let Some(cl) = header_value(headers, "content-length") {
        let cl = std::str::from_utf8(cl)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| AratagaError::Protocol("Invalid Content-Length".to_string()))?;
        if cl == 0 {
            return Ok(BodyFraming::None);
        }
        return Ok(BodyFraming::ContentLength(cl));
    }

    Ok(fallback)
}

/// Headers that must not travel past this hop when a request is forwarded.
///
/// `Transfer-Encoding` stays: the body is relayed with its original framing.
pub fn is_hop_by_hop_request_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

/// Serialize a request head for the origin: origin-form target, hop-by-hop
/// headers stripped, an explicit Connection header appended.
pub fn serialize_outgoing_request(head: &RequestHead, keep_alive: bool) -> Vec<u8> {
    let target = if let Some(rest) = head.target.strip_prefix("http://") {
        match rest.find('/') {
            Some(idx) => rest[idx..].to_string(),
            None => "/".to_string(),
        }
    } else {
        head.target.clone()
    };

    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(head.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    for (name, value) in &head.headers {
        if is_hop_by_hop_request_header(name) {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }

    if keep_alive {
        out.extend_from_slice(b"connection: keep-alive\r\n");
    } else {
        out.extend_from_slice(b"connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");

    out
}

/// Serialize a response head for the client, preserving the origin's framing
/// headers and replacing connection management with our own.
pub fn serialize_incoming_response(head: &ResponseHead, keep_alive: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(head.status.to_string().as_bytes());
    if !head.reason.is_empty() {
        out.push(b' ');
        out.extend_from_slice(head.reason.as_bytes());
    }
    out.extend_from_slice(b"\r\n");

    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("keep-alive")
            || name.eq_ignore_ascii_case("proxy-connection")
        {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }

    if keep_alive {
        out.extend_from_slice(b"connection: keep-alive\r\n");
    } else {
        out.extend_from_slice(b"connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");

    out
}

macro_rules! negative_response {
    ($status_line:literal, $title:literal, $detail:literal) => {
        concat!(
            "HTTP/1.1 ",
            $status_line,
            "\r\n",
            "connection: close\r\n",
            "content-type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<html><head><title>",
            $title,
            "</title></head>\r\n",
            "<body><h2>",
            $title,
            "</h2>",
            "<p>",
            $detail,
            "</p>",
            "</body></html>\r\n"
        )
    };
    ($status_line:literal, $title:literal, $detail:literal, auth) => {
        concat!(
            "HTTP/1.1 ",
            $status_line,
            "\r\n",
            "connection: close\r\n",
            "content-type: text/html; charset=utf-8\r\n",
            "proxy-authenticate: Basic\r\n",
            "\r\n",
            "<html><head><title>",
            $title,
            "</title></head>\r\n",
            "<body><h2>",
            $title,
            "</h2>",
            "<p>",
            $detail,
            "</p>",
            "</body></html>\r\n"
        )
    };
}

pub const RESPONSE_BAD_REQUEST_PARSE_ERROR: &str = negative_response!(
    "400 Bad Request",
    "400 Bad Request",
    "Unable to parse incoming request."
);

pub const RESPONSE_BAD_REQUEST_UNEXPECTED_PARSING_ERROR: &str = negative_response!(
    "400 Bad Request",
    "400 Bad Request",
    "Unexpected request parsing error."
);

pub const RESPONSE_BAD_REQUEST_AUTH_PARAMS_EXTRACTION_FAILURE: &str = negative_response!(
    "400 Bad Request",
    "400 Bad Request",
    "An attempt to extract username/password from Proxy-Authorization failed."
);

pub const RESPONSE_BAD_REQUEST_TARGET_HOST_EXTRACTION_FAILURE: &str = negative_response!(
    "400 Bad Request",
    "400 Bad Request",
    "An attempt to detect target-host and target-port from incoming request failed."
);

pub const RESPONSE_BAD_REQUEST_INVALID_REQUEST_TARGET: &str = negative_response!(
    "400 Bad Request",
    "400 Bad Request",
    "Invalid request-target format."
);

pub const RESPONSE_REQUEST_TIMEOUT_HEADERS_COMPLETE_TIMEOUT: &str = negative_response!(
    "408 Request Timeout",
    "408 Request Timeout",
    "Client sends the request too slowly (timeout.http.headers_complete)"
);

pub const RESPONSE_PROXY_AUTH_REQUIRED_AUTH_TIMEOUT: &str = negative_response!(
    "407 Proxy Authentication Required",
    "407 Proxy Authentication Required",
    "Unable to authentificate (timeout.authentification)",
    auth
);

pub const RESPONSE_PROXY_AUTH_REQUIRED_NOT_AUTHORIZED: &str = negative_response!(
    "407 Proxy Authentication Required",
    "407 Proxy Authentication Required",
    "Access to requested resource disallowed by administrator or you need \
     valid username/password to use this resource",
    auth
);

pub const RESPONSE_REQUEST_TIMEOUT_DNS_LOOKUP_TIMEOUT: &str = negative_response!(
    "408 Request Timeout",
    "408 Request Timeout",
    "DNS lookup procedure timed out (timeout.dns_resolving)"
);

pub const RESPONSE_BAD_GATEWAY_DNS_LOOKUP_FAILURE: &str = negative_response!(
    "502 Bad Gateway",
    "502 Bad Gateway",
    "DNS lookup procedure failed"
);

pub const RESPONSE_BAD_GATEWAY_CONNECT_TIMEOUT: &str = negative_response!(
    "502 Bad Gateway",
    "502 Bad Gateway",
    "Connect to the target host timed out (timeout.connect_target)"
);

pub const RESPONSE_BAD_GATEWAY_CONNECT_FAILURE: &str = negative_response!(
    "502 Bad Gateway",
    "502 Bad Gateway",
    "Unable to connect to the target host"
);

pub const RESPONSE_BAD_GATEWAY_INVALID_RESPONSE: &str = negative_response!(
    "502 Bad Gateway",
    "502 Bad Gateway",
    "Invalid response received from the target host"
);

pub const RESPONSE_INTERNAL_SERVER_ERROR: &str = negative_response!(
    "500 Internal Server Error",
    "500 Internal Server Error",
    "The request can't be processed"
);

pub const RESPONSE_OK_FOR_CONNECT_METHOD: &str = "HTTP/1.1 200 Ok\r\n\r\n";

//! Just enough HTTP/1.1 for the control panel: one request per connection,
//! GET/POST only, always answered with `200 OK` and an HTML body.

use core::fmt;
use std::io;

use log::{debug, warn};

use crate::net::{Clock, Stream};

pub const FIRST_BYTE_TIMEOUT_MS: u64 = 2_000;
pub const LINE_TIMEOUT_MS: u64 = 100;
pub const MAX_LINE_LEN: usize = 512;
pub const MAX_HEADER_LINES: usize = 32;
pub const MAX_BODY_LEN: usize = 1024;
pub const PAGE_CAPACITY: usize = 4096;
const POLL_MS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    /// Path with the query string, as sent.
    pub full_path: String,
    /// Path used for routing.
    pub path: String,
    pub query: String,
    pub content_length: usize,
}

/// `GET /path?query HTTP/1.1` into method and full path. Other methods yield `None`.
pub fn parse_request_line(line: &str) -> Option<(Method, String)> {
    let mut parts = line.trim_end_matches(['\r', '\n']).splitn(3, ' ');
    let method = match parts.next()? {
        "GET" => Method::Get,
        "POST" => Method::Post,
        _ => return None,
    };
    let target = parts.next().filter(|target| !target.is_empty())?;
    Some((method, target.to_string()))
}

impl HttpRequest {
    pub fn new(method: Method, full_path: String) -> Self {
        let (path, query) = match full_path.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (full_path.clone(), String::new()),
        };
        Self {
            method,
            full_path,
            path,
            query,
            content_length: 0,
        }
    }

    /// See [`query_param`].
    pub fn param(&self, name: &str, capacity: usize) -> Option<String> {
        query_param(&self.full_path, name, capacity)
    }
}

/// Finds the first `name=` anywhere in `full_path` and returns the decoded value
/// up to the next `&` or space, limited to `capacity - 1` bytes.
///
/// This is a substring search, not a real query parser: `name=` also matches
/// inside a longer key (`xname=`) and `=` is not special inside values.
pub fn query_param(full_path: &str, name: &str, capacity: usize) -> Option<String> {
    let needle = format!("{name}=");
    let start = full_path.find(&needle)? + needle.len();
    let rest = &full_path[start..];
    let end = rest.find(['&', ' ']).unwrap_or(rest.len());

    let mut value = percent_decode(&rest[..end]);
    truncate_on_char_boundary(&mut value, capacity.saturating_sub(1));
    Some(value)
}

/// `%XX` escapes and `+` as space. Malformed escapes are kept as written.
pub fn percent_decode(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

fn truncate_on_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

/// Fixed-capacity page body. Writes past the capacity are dropped and the
/// page is served truncated.
#[derive(Debug)]
pub struct PageBuffer {
    body: String,
    capacity: usize,
    truncated: bool,
}

impl PageBuffer {
    pub fn new() -> Self {
        Self::with_capacity(PAGE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            body: String::with_capacity(capacity),
            capacity,
            truncated: false,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn as_str(&self) -> &str {
        &self.body
    }

    pub fn finish(self) -> String {
        if self.truncated {
            warn!(
                "page exceeded {} bytes and was truncated",
                self.capacity
            );
        }
        self.body
    }
}

impl Default for PageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for PageBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.capacity - self.body.len();
        if s.len() <= room {
            self.body.push_str(s);
            return Ok(());
        }

        let mut end = room;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.body.push_str(&s[..end]);
        self.truncated = true;
        Ok(())
    }
}

pub fn response_header(content_length: usize) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Connection: close\r\n\
         Cache-Control: no-cache, no-store, must-revalidate\r\n\
         Pragma: no-cache\r\n\
         Expires: 0\r\n\
         Content-Length: {content_length}\r\n\
         \r\n"
    )
}

pub fn write_response<S: Stream>(stream: &mut S, body: &str) -> io::Result<()> {
    stream.write_all(response_header(body.len()).as_bytes())?;
    stream.write_all(body.as_bytes())?;
    stream.flush()
}

fn wait_for_data<S: Stream>(stream: &mut S, clock: &dyn Clock, timeout_ms: u64) -> io::Result<bool> {
    let start = clock.now_ms();
    loop {
        if stream.available()? > 0 {
            return Ok(true);
        }
        if clock.now_ms().saturating_sub(start) >= timeout_ms || !stream.is_connected() {
            return Ok(false);
        }
        clock.sleep_ms(POLL_MS);
    }
}

/// Reads one `\n`-terminated line within `timeout_ms`. Returns what arrived
/// when the deadline passes first.
fn read_line<S: Stream>(stream: &mut S, clock: &dyn Clock, timeout_ms: u64) -> io::Result<String> {
    let start = clock.now_ms();
    let mut line = Vec::new();

    loop {
        let mut byte = [0_u8; 1];
        if stream.read(&mut byte)? == 1 {
            if byte[0] == b'\n' {
                break;
            }
            if line.len() < MAX_LINE_LEN {
                line.push(byte[0]);
            }
            continue;
        }

        if clock.now_ms().saturating_sub(start) >= timeout_ms || !stream.is_connected() {
            break;
        }
        clock.sleep_ms(POLL_MS);
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Reads a request from a freshly accepted connection. `Ok(None)` means the
/// connection should be closed without a response.
pub fn read_request<S: Stream>(stream: &mut S, clock: &dyn Clock) -> io::Result<Option<HttpRequest>> {
    if !wait_for_data(stream, clock, FIRST_BYTE_TIMEOUT_MS)? {
        debug!("control client sent nothing within {FIRST_BYTE_TIMEOUT_MS}ms");
        return Ok(None);
    }

    let request_line = read_line(stream, clock, LINE_TIMEOUT_MS)?;
    let Some((method, full_path)) = parse_request_line(&request_line) else {
        debug!("ignoring request line `{request_line}`");
        return Ok(None);
    };

    let mut request = HttpRequest::new(method, full_path);

    for _ in 0..MAX_HEADER_LINES {
        let header = read_line(stream, clock, LINE_TIMEOUT_MS)?;
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                request.content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    if request.method == Method::Post && request.content_length > 0 {
        drain_body(stream, clock, request.content_length.min(MAX_BODY_LEN))?;
    }

    Ok(Some(request))
}

fn drain_body<S: Stream>(stream: &mut S, clock: &dyn Clock, len: usize) -> io::Result<()> {
    let start = clock.now_ms();
    let mut remaining = len;
    let mut chunk = [0_u8; 128];

    while remaining > 0 {
        let read = stream.read(&mut chunk[..remaining.min(128)])?;
        if read > 0 {
            remaining -= read;
            continue;
        }
        if clock.now_ms().saturating_sub(start) >= LINE_TIMEOUT_MS || !stream.is_connected() {
            break;
        }
        clock.sleep_ms(POLL_MS);
    }
    Ok(())
}

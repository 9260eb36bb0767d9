// src/parser.rs
//
// Incremental HTTP/1.x request parser. Parse states form a linear chain
// Line -> Head -> Body -> Over, with Error absorbing; each call to
// `recv_http_request` advances as far as the buffered bytes allow and the
// next call resumes where it stopped. One context parses one request at a
// time and is `reset` between requests on a keep-alive connection.
use crate::buffer::Buffer;
use crate::http::HttpRequest;
use crate::util;
use regex::Regex;
use std::sync::LazyLock;

/// Upper bound for a request line or header line, including line ending.
pub const MAX_LINE: usize = 8192;

static REQUEST_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(GET|HEAD|POST|PUT|DELETE) ([^?]*)(?:\?(.*))? (HTTP/1\.[01])(?:\n|\r\n)?$")
        .expect("request line regex")
});

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecvStatus {
    Line,
    Head,
    Body,
    Over,
    Error,
}

pub struct HttpContext {
    resp_status: u16,
    recv_status: RecvStatus,
    request: HttpRequest,
}

impl HttpContext {
    pub fn new() -> Self {
        Self {
            resp_status: 200,
            recv_status: RecvStatus::Line,
            request: HttpRequest::new(),
        }
    }

    pub fn reset(&mut self) {
        self.resp_status = 200;
        self.recv_status = RecvStatus::Line;
        self.request.reset();
    }

    /// Tentative response status; >= 400 once parsing has failed.
    pub fn resp_status(&self) -> u16 {
        self.resp_status
    }

    pub fn recv_status(&self) -> RecvStatus {
        self.recv_status
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut HttpRequest {
        &mut self.request
    }

    /// Advance the parse as far as `buf` allows. Each completed stage feeds
    /// straight into the next within the same call.
    pub fn recv_http_request(&mut self, buf: &mut Buffer) {
        if self.recv_status == RecvStatus::Line {
            self.recv_line(buf);
        }
        if self.recv_status == RecvStatus::Head {
            self.recv_head(buf);
        }
        if self.recv_status == RecvStatus::Body {
            self.recv_body(buf);
        }
    }

    fn fail(&mut self, status: u16) {
        self.recv_status = RecvStatus::Error;
        self.resp_status = status;
    }

    fn recv_line(&mut self, buf: &mut Buffer) {
        let line = buf.get_line_and_pop();
        if line.is_empty() {
            // Not a full line yet. If this much is buffered without a line
            // ending, the request line cannot be valid.
            if buf.readable() > MAX_LINE {
                self.fail(414);
            }
            return;
        }
        if line.len() > MAX_LINE {
            return self.fail(414);
        }
        if self.parse_line(&line) {
            self.recv_status = RecvStatus::Head;
        }
    }

    fn parse_line(&mut self, line: &[u8]) -> bool {
        let line = match std::str::from_utf8(line) {
            Ok(s) => s,
            Err(_) => {
                self.fail(400);
                return false;
            }
        };
        let caps = match REQUEST_LINE_RE.captures(line) {
            Some(c) => c,
            None => {
                self.fail(400);
                return false;
            }
        };
        self.request.method = caps[1].to_ascii_uppercase();
        self.request.path = util::url_decode(caps.get(2).map_or("", |m| m.as_str()), false);
        self.request.version = caps[4].to_string();
        if let Some(query) = caps.get(3) {
            for pair in query.as_str().split('&').filter(|s| !s.is_empty()) {
                let eq = match pair.find('=') {
                    Some(pos) => pos,
                    None => {
                        self.fail(400);
                        return false;
                    }
                };
                let key = util::url_decode(&pair[..eq], true);
                let val = util::url_decode(&pair[eq + 1..], true);
                self.request.set_param(key, val);
            }
        }
        true
    }

    fn recv_head(&mut self, buf: &mut Buffer) {
        loop {
            let line = buf.get_line_and_pop();
            if line.is_empty() {
                if buf.readable() > MAX_LINE {
                    self.fail(414);
                }
                return;
            }
            if line.len() > MAX_LINE {
                return self.fail(414);
            }
            if line.as_slice() == b"\n" || line.as_slice() == b"\r\n" {
                break;
            }
            if !self.parse_head(&line) {
                return;
            }
        }
        self.recv_status = RecvStatus::Body;
    }

    fn parse_head(&mut self, line: &[u8]) -> bool {
        let mut line = line;
        if line.ends_with(b"\n") {
            line = &line[..line.len() - 1];
        }
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        let line = match std::str::from_utf8(line) {
            Ok(s) => s,
            Err(_) => {
                self.fail(400);
                return false;
            }
        };
        let pos = match line.find(": ") {
            Some(pos) => pos,
            None => {
                self.fail(400);
                return false;
            }
        };
        self.request
            .set_header(line[..pos].to_string(), line[pos + 2..].to_string());
        true
    }

    fn recv_body(&mut self, buf: &mut Buffer) {
        let content_length = self.request.content_length();
        if content_length == 0 {
            self.recv_status = RecvStatus::Over;
            return;
        }
        let needed = content_length - self.request.body.len();
        if buf.readable() >= needed {
            self.request.body.extend_from_slice(buf.read(needed));
            buf.move_read_offset(needed);
            self.recv_status = RecvStatus::Over;
            return;
        }
        // Take what is there; the next invocation resumes.
        let available = buf.readable();
        self.request.body.extend_from_slice(buf.read(available));
        buf.move_read_offset(available);
    }
}

impl Default for HttpContext {
    fn default() -> Self {
        Self::new()
    }
}

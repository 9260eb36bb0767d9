// src/http_server.rs
//
// HTTP protocol glue over TcpServer: stores an HttpContext in each
// connection, drives it from the message callback, routes completed requests
// and serializes responses back onto the connection.
use crate::buffer::Buffer;
use crate::conn::ConnRef;
use crate::error::{MillError, MillResult};
use crate::http::{HttpRequest, HttpResponse};
use crate::parser::{HttpContext, RecvStatus};
use crate::router::{Handler, Router};
use crate::server::TcpServer;
use crate::util;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default idle timeout in seconds.
pub const DEFAULT_TIMEOUT: u64 = 30;

pub struct HttpServer {
    server: Arc<TcpServer>,
    router: Router,
    base_dir: Option<String>,
}

impl HttpServer {
    /// Bind to `port`. Connections idle for `timeout_secs` (1..=60) are
    /// reaped; zero disables the idle timer.
    pub fn new(port: u16, timeout_secs: u64) -> MillResult<HttpServer> {
        let server = TcpServer::new(port)?;
        if timeout_secs > 0 {
            server.enable_inactive_release(timeout_secs);
        }
        Ok(HttpServer {
            server,
            router: Router::new(),
            base_dir: None,
        })
    }

    /// Serve static files from `path` for GET/HEAD requests.
    pub fn set_base_dir(&mut self, path: &str) -> MillResult<()> {
        if !util::is_directory(path) {
            return Err(MillError::NotADirectory(path.to_string()));
        }
        self.base_dir = Some(path.to_string());
        Ok(())
    }

    pub fn set_thread_count(&self, count: usize) {
        self.server.set_thread_count(count);
    }

    /// The underlying TcpServer, e.g. for `run_after` or introspection.
    pub fn tcp_server(&self) -> Arc<TcpServer> {
        self.server.clone()
    }

    pub fn get<H>(&mut self, pattern: &str, handler: H) -> MillResult<()>
    where
        H: Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    {
        self.router.get(pattern, Arc::new(handler))
    }

    pub fn post<H>(&mut self, pattern: &str, handler: H) -> MillResult<()>
    where
        H: Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    {
        self.router.post(pattern, Arc::new(handler))
    }

    pub fn put<H>(&mut self, pattern: &str, handler: H) -> MillResult<()>
    where
        H: Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    {
        self.router.put(pattern, Arc::new(handler))
    }

    pub fn delete<H>(&mut self, pattern: &str, handler: H) -> MillResult<()>
    where
        H: Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    {
        self.router.delete(pattern, Arc::new(handler))
    }

    /// Wire the protocol callbacks and run the server. Never returns.
    pub fn listen(self) {
        let state = Arc::new(HttpState {
            router: self.router,
            base_dir: self.base_dir,
        });
        let server = self.server;
        server.set_connected_callback(Arc::new(|conn: &ConnRef| {
            conn.set_context(Box::new(HttpContext::new()));
            debug!(id = conn.id(), "http connection established");
        }));
        server.set_message_callback(Arc::new(move |conn: &ConnRef, buf: &mut Buffer| {
            state.on_message(conn, buf);
        }));
        server.start();
    }
}

struct HttpState {
    router: Router,
    base_dir: Option<String>,
}

impl HttpState {
    /// Per-connection protocol loop: keep parsing while bytes remain, answer
    /// each completed request, and stop on error or a short connection.
    fn on_message(&self, conn: &ConnRef, buf: &mut Buffer) {
        while buf.readable() > 0 {
            let mut guard = conn.context();
            let ctx = match guard.as_mut().and_then(|c| c.downcast_mut::<HttpContext>()) {
                Some(ctx) => ctx,
                None => return,
            };
            ctx.recv_http_request(buf);
            if ctx.resp_status() >= 400 {
                let mut rsp = HttpResponse::with_status(ctx.resp_status());
                error_handler(ctx.request(), &mut rsp);
                let payload = render_response(ctx.request(), &mut rsp);
                conn.send(&payload);
                ctx.reset();
                let leftover = buf.readable();
                buf.move_read_offset(leftover);
                drop(guard);
                conn.shutdown();
                return;
            }
            if ctx.recv_status() != RecvStatus::Over {
                // Await more bytes.
                return;
            }
            let mut rsp = HttpResponse::new();
            self.route(ctx.request_mut(), &mut rsp);
            let payload = render_response(ctx.request(), &mut rsp);
            conn.send(&payload);
            let close = rsp.close();
            ctx.reset();
            drop(guard);
            if close {
                conn.shutdown();
            }
        }
    }

    fn route(&self, req: &mut HttpRequest, rsp: &mut HttpResponse) {
        if self.is_file_request(req) {
            return self.file_handler(req, rsp);
        }
        self.router.route(req, rsp);
    }

    /// Static dispatch applies only to GET/HEAD of an existing regular file
    /// under the base dir, reached without escaping it.
    fn is_file_request(&self, req: &HttpRequest) -> bool {
        let base = match &self.base_dir {
            Some(base) => base,
            None => return false,
        };
        if req.method != "GET" && req.method != "HEAD" {
            return false;
        }
        if !util::valid_path(&req.path) {
            return false;
        }
        util::is_regular(&resolve_path(base, &req.path))
    }

    fn file_handler(&self, req: &HttpRequest, rsp: &mut HttpResponse) {
        let base = self.base_dir.as_deref().unwrap_or("");
        let path = resolve_path(base, &req.path);
        match util::read_file(&path) {
            Ok(data) => {
                rsp.body = data;
                rsp.set_header("Content-Type", util::ext_mime(&path));
            }
            Err(e) => warn!(path = %path, error = %e, "static file read failed"),
        }
    }
}

/// Map a request path onto the filesystem; directory paths get index.html.
fn resolve_path(base: &str, req_path: &str) -> String {
    let mut path = format!("{}{}", base, req_path);
    if req_path.ends_with('/') {
        path.push_str("index.html");
    }
    path
}

/// Error page: a bare heading with the code and reason phrase.
fn error_handler(_req: &HttpRequest, rsp: &mut HttpResponse) {
    let body = format!(
        "<html><head><meta http-equiv='Content-Type' content='text/html;charset=utf-8'></head>\
         <body><h1>{} {}</h1></body></html>",
        rsp.status,
        util::status_text(rsp.status)
    );
    rsp.set_content(body, "text/html");
}

/// Serialize a response against its request: mirror the connection intent,
/// default the entity headers, then status line, headers, blank line, body.
fn render_response(req: &HttpRequest, rsp: &mut HttpResponse) -> Vec<u8> {
    if req.close() {
        rsp.set_header("Connection", "close");
    } else {
        rsp.set_header("Connection", "keep-alive");
    }
    if !rsp.body.is_empty() && !rsp.has_header("Content-Length") {
        let len = rsp.body.len().to_string();
        rsp.set_header("Content-Length", &len);
    }
    if !rsp.body.is_empty() && !rsp.has_header("Content-Type") {
        rsp.set_header("Content-Type", "application/octet-stream");
    }
    if let Some(url) = rsp.redirect().map(str::to_string) {
        rsp.set_header("Location", &url);
    }

    let mut out = Vec::with_capacity(rsp.body.len() + 256);
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            req.version,
            rsp.status,
            util::status_text(rsp.status)
        )
        .as_bytes(),
    );
    for (key, val) in rsp.headers() {
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(val.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&rsp.body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::parser::HttpContext;

    fn parse(bytes: &[u8]) -> HttpContext {
        let mut ctx = HttpContext::new();
        let mut buf = Buffer::new();
        buf.write_and_push(bytes);
        ctx.recv_http_request(&mut buf);
        ctx
    }

    #[test]
    fn test_render_mirrors_keep_alive() {
        let ctx = parse(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        let mut rsp = HttpResponse::new();
        rsp.set_content("ok", "text/plain");
        let out = render_response(ctx.request(), &mut rsp);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));
    }

    #[test]
    fn test_render_defaults_content_type() {
        let ctx = parse(b"GET / HTTP/1.1\r\n\r\n");
        let mut rsp = HttpResponse::new();
        rsp.body = b"raw".to_vec();
        let out = render_response(ctx.request(), &mut rsp);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Type: application/octet-stream\r\n"));
    }

    #[test]
    fn test_render_reparses_identically() {
        let ctx = parse(b"POST /up?k=v HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc");
        assert_eq!(ctx.recv_status(), crate::parser::RecvStatus::Over);
        let req = ctx.request();
        // Re-serialize the parsed request and parse it again: the fields
        // survive the round trip.
        let wire = format!(
            "{} {} {}\r\nContent-Length: {}\r\n\r\n",
            req.method,
            req.path,
            req.version,
            req.body.len()
        );
        let mut bytes = wire.into_bytes();
        bytes.extend_from_slice(&req.body);
        let again = parse(&bytes);
        assert_eq!(again.request().method, req.method);
        assert_eq!(again.request().path, req.path);
        assert_eq!(again.request().version, req.version);
        assert_eq!(again.request().body, req.body);
    }

    #[test]
    fn test_render_sets_location_on_redirect() {
        let ctx = parse(b"GET /old HTTP/1.1\r\n\r\n");
        let mut rsp = HttpResponse::new();
        rsp.set_redirect("/new");
        let out = render_response(ctx.request(), &mut rsp);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(text.contains("Location: /new\r\n"));
    }

    #[test]
    fn test_error_page_shape() {
        let mut rsp = HttpResponse::with_status(404);
        error_handler(&HttpRequest::new(), &mut rsp);
        let body = String::from_utf8(rsp.body.clone()).unwrap();
        assert!(body.contains("<h1>404 Not Found</h1>"));
        assert_eq!(rsp.header("Content-Type"), Some("text/html"));
    }

    #[test]
    fn test_resolve_path_appends_index() {
        assert_eq!(resolve_path("./www", "/"), "./www/index.html");
        assert_eq!(resolve_path("./www", "/img/a.png"), "./www/img/a.png");
        assert_eq!(resolve_path("./www", "/docs/"), "./www/docs/index.html");
    }
}

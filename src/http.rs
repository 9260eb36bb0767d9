// src/http.rs
//
// Parsed request and response value objects. Headers and query params use
// insert-if-absent semantics: the first writer of a key wins.
use std::collections::HashMap;

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub body: Vec<u8>,
    /// Capture groups from the route regex that matched this request;
    /// index 0 is the whole match.
    pub matches: Vec<String>,
    headers: HashMap<String, String>,
    params: HashMap<String, String>,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            method: String::new(),
            path: String::new(),
            version: "HTTP/1.1".to_string(),
            body: Vec::new(),
            matches: Vec::new(),
            headers: HashMap::new(),
            params: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.method.clear();
        self.path.clear();
        self.version = "HTTP/1.1".to_string();
        self.body.clear();
        self.matches.clear();
        self.headers.clear();
        self.params.clear();
    }

    pub fn set_header(&mut self, key: String, val: String) {
        self.headers.entry(key).or_insert(val);
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn set_param(&mut self, key: String, val: String) {
        self.params.entry(key).or_insert(val);
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// A request is short-lived unless it explicitly asks for keep-alive.
    pub fn close(&self) -> bool {
        self.header("Connection") != Some("keep-alive")
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    redirect_url: Option<String>,
    headers: HashMap<String, String>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            redirect_url: None,
            headers: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.status = 200;
        self.body.clear();
        self.redirect_url = None;
        self.headers.clear();
    }

    pub fn set_header(&mut self, key: &str, val: &str) {
        self.headers
            .entry(key.to_string())
            .or_insert_with(|| val.to_string());
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn set_content(&mut self, body: impl Into<Vec<u8>>, mime: &str) {
        self.body = body.into();
        self.set_header("Content-Type", mime);
    }

    /// 302 redirect to `url`; the serializer emits the Location header.
    pub fn set_redirect(&mut self, url: &str) {
        self.status = 302;
        self.redirect_url = Some(url.to_string());
    }

    pub fn redirect(&self) -> Option<&str> {
        self.redirect_url.as_deref()
    }

    pub fn close(&self) -> bool {
        self.header("Connection") != Some("keep-alive")
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_header_write_wins() {
        let mut req = HttpRequest::new();
        req.set_header("Host".into(), "a".into());
        req.set_header("Host".into(), "b".into());
        assert_eq!(req.header("Host"), Some("a"));
    }

    #[test]
    fn test_close_semantics() {
        let mut req = HttpRequest::new();
        assert!(req.close());
        req.set_header("Connection".into(), "keep-alive".into());
        assert!(!req.close());

        let mut rsp = HttpResponse::new();
        assert!(rsp.close());
        rsp.set_header("Connection", "keep-alive");
        assert!(!rsp.close());
    }

    #[test]
    fn test_content_length_parsing() {
        let mut req = HttpRequest::new();
        assert_eq!(req.content_length(), 0);
        req.set_header("Content-Length".into(), "42".into());
        assert_eq!(req.content_length(), 42);
    }

    #[test]
    fn test_redirect_sets_status() {
        let mut rsp = HttpResponse::new();
        rsp.set_redirect("/login");
        assert_eq!(rsp.status, 302);
        assert_eq!(rsp.redirect(), Some("/login"));
    }
}

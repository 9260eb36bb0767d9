// src/router.rs
//
// Regex route tables, one per method; HEAD is served from the GET table.
// Matching is an ordered scan and the first pattern that matches the whole
// path wins; its capture groups are left on the request for the handler.
use crate::error::MillResult;
use crate::http::{HttpRequest, HttpResponse};
use regex::Regex;
use std::sync::Arc;

pub type Handler = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;

type RouteTable = Vec<(Regex, Handler)>;

pub struct Router {
    get_route: RouteTable,
    post_route: RouteTable,
    put_route: RouteTable,
    delete_route: RouteTable,
}

impl Router {
    pub fn new() -> Self {
        Self {
            get_route: Vec::new(),
            post_route: Vec::new(),
            put_route: Vec::new(),
            delete_route: Vec::new(),
        }
    }

    /// Patterns must match the entire path, so they are wrapped in anchors
    /// at compile time.
    fn compile(pattern: &str) -> MillResult<Regex> {
        Ok(Regex::new(&format!("^(?:{})$", pattern))?)
    }

    pub fn get(&mut self, pattern: &str, handler: Handler) -> MillResult<()> {
        self.get_route.push((Self::compile(pattern)?, handler));
        Ok(())
    }

    pub fn post(&mut self, pattern: &str, handler: Handler) -> MillResult<()> {
        self.post_route.push((Self::compile(pattern)?, handler));
        Ok(())
    }

    pub fn put(&mut self, pattern: &str, handler: Handler) -> MillResult<()> {
        self.put_route.push((Self::compile(pattern)?, handler));
        Ok(())
    }

    pub fn delete(&mut self, pattern: &str, handler: Handler) -> MillResult<()> {
        self.delete_route.push((Self::compile(pattern)?, handler));
        Ok(())
    }

    /// Route to the handler registered for the request's method and path.
    /// A method outside the tables draws 405, a path with no match 404.
    pub fn route(&self, req: &mut HttpRequest, rsp: &mut HttpResponse) {
        let table = match req.method.as_str() {
            "GET" | "HEAD" => &self.get_route,
            "POST" => &self.post_route,
            "PUT" => &self.put_route,
            "DELETE" => &self.delete_route,
            _ => {
                rsp.status = 405;
                return;
            }
        };
        Self::dispatch(table, req, rsp);
    }

    fn dispatch(table: &RouteTable, req: &mut HttpRequest, rsp: &mut HttpResponse) {
        for (pattern, handler) in table {
            let matched: Vec<String> = match pattern.captures(&req.path) {
                Some(caps) => caps
                    .iter()
                    .map(|g| g.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect(),
                None => continue,
            };
            req.matches = matched;
            return handler(req, rsp);
        }
        rsp.status = 404;
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_path() -> Handler {
        Arc::new(|req: &HttpRequest, rsp: &mut HttpResponse| {
            rsp.set_content(req.path.clone(), "text/plain");
        })
    }

    fn request(method: &str, path: &str) -> HttpRequest {
        let mut req = HttpRequest::new();
        req.method = method.to_string();
        req.path = path.to_string();
        req
    }

    #[test]
    fn test_full_match_required() {
        let mut router = Router::new();
        router.get("/hello", echo_path()).unwrap();

        let mut rsp = HttpResponse::new();
        router.route(&mut request("GET", "/hello"), &mut rsp);
        assert_eq!(rsp.status, 200);
        assert_eq!(rsp.body, b"/hello");

        let mut rsp = HttpResponse::new();
        router.route(&mut request("GET", "/hello/world"), &mut rsp);
        assert_eq!(rsp.status, 404);
    }

    #[test]
    fn test_head_shares_get_table() {
        let mut router = Router::new();
        router.get("/page", echo_path()).unwrap();
        let mut rsp = HttpResponse::new();
        router.route(&mut request("HEAD", "/page"), &mut rsp);
        assert_eq!(rsp.status, 200);
    }

    #[test]
    fn test_captures_reach_the_handler() {
        let mut router = Router::new();
        router
            .get(
                r"/numbers/(\d+)",
                Arc::new(|req: &HttpRequest, rsp: &mut HttpResponse| {
                    rsp.set_content(req.matches[1].clone(), "text/plain");
                }),
            )
            .unwrap();
        let mut rsp = HttpResponse::new();
        router.route(&mut request("GET", "/numbers/12345"), &mut rsp);
        assert_eq!(rsp.body, b"12345");
    }

    #[test]
    fn test_first_match_wins() {
        let mut router = Router::new();
        router
            .get(
                "/item/.*",
                Arc::new(|_req: &HttpRequest, rsp: &mut HttpResponse| {
                    rsp.set_content("broad", "text/plain");
                }),
            )
            .unwrap();
        router
            .get(
                "/item/special",
                Arc::new(|_req: &HttpRequest, rsp: &mut HttpResponse| {
                    rsp.set_content("narrow", "text/plain");
                }),
            )
            .unwrap();
        let mut rsp = HttpResponse::new();
        router.route(&mut request("GET", "/item/special"), &mut rsp);
        assert_eq!(rsp.body, b"broad");
    }

    #[test]
    fn test_unsupported_method_is_405() {
        let mut router = Router::new();
        let mut rsp = HttpResponse::new();
        router.route(&mut request("PATCH", "/x"), &mut rsp);
        assert_eq!(rsp.status, 405);
    }

    #[test]
    fn test_method_tables_are_separate() {
        let mut router = Router::new();
        router.post("/submit", echo_path()).unwrap();
        let mut rsp = HttpResponse::new();
        router.route(&mut request("GET", "/submit"), &mut rsp);
        assert_eq!(rsp.status, 404);

        let mut rsp = HttpResponse::new();
        router.route(&mut request("POST", "/submit"), &mut rsp);
        assert_eq!(rsp.status, 200);
    }

    #[test]
    fn test_bad_pattern_is_reported() {
        let mut router = Router::new();
        assert!(router.get("/broken(", echo_path()).is_err());
    }
}

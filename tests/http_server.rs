// End-to-end tests: each case boots a real server on its own port and talks
// to it over loopback with a plain TcpStream.
use millrace::{HttpRequest, HttpResponse, HttpServer};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn start_server<F>(port: u16, timeout_secs: u64, configure: F) -> std::sync::Arc<millrace::TcpServer>
where
    F: FnOnce(&mut HttpServer) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut server = HttpServer::new(port, timeout_secs).expect("bind");
        configure(&mut server);
        tx.send(server.tcp_server()).unwrap();
        server.listen();
    });
    let tcp = rx.recv_timeout(Duration::from_secs(5)).expect("server boot");
    wait_until_up(port);
    tcp
}

fn wait_until_up(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("server on port {} never came up", port);
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

fn read_response(stream: &mut TcpStream) -> (u16, HashMap<String, String>, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("read headers");
        assert!(n > 0, "connection closed before headers completed");
        head.push(byte[0]);
    }
    let text = String::from_utf8(head).unwrap();
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap();
    let status: u16 = status_line
        .split(' ')
        .nth(1)
        .expect("status code")
        .parse()
        .unwrap();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, val)) = line.split_once(": ") {
            headers.entry(key.to_string()).or_insert(val.to_string());
        }
    }
    let body = match headers.get("Content-Length") {
        Some(len) => {
            let mut body = vec![0u8; len.parse().unwrap()];
            stream.read_exact(&mut body).expect("read body");
            body
        }
        None => Vec::new(),
    };
    (status, headers, body)
}

fn make_www(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("millrace-www-{}", tag));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("index.html"), "<h1>hi</h1>").unwrap();
    dir
}

#[test]
fn static_get_on_root() {
    let www = make_www("static");
    start_server(19401, 10, move |server| {
        server.set_base_dir(www.to_str().unwrap()).unwrap();
    });

    let mut stream = connect(19401);
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"<h1>hi</h1>");
    assert_eq!(headers.get("Content-Type").map(String::as_str), Some("text/html"));
    assert_eq!(headers.get("Content-Length").map(String::as_str), Some("11"));
    assert_eq!(headers.get("Connection").map(String::as_str), Some("close"));

    // The server closes after a short response.
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
}

#[test]
fn keep_alive_echo() {
    start_server(19402, 10, |server| {
        server.set_thread_count(2);
        server
            .get("^/echo$", |req: &HttpRequest, rsp: &mut HttpResponse| {
                rsp.set_content(req.param("msg").unwrap_or("").to_string(), "text/plain");
            })
            .unwrap();
    });

    let mut stream = connect(19402);
    stream
        .write_all(b"GET /echo?msg=hi%20there HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"hi there");
    assert_eq!(
        headers.get("Connection").map(String::as_str),
        Some("keep-alive")
    );

    // Socket stays open: a second request on the same connection works.
    stream
        .write_all(b"GET /echo?msg=again HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"again");
}

#[test]
fn malformed_request_line_draws_400() {
    start_server(19403, 10, |_server| {});

    let mut stream = connect(19403);
    stream.write_all(b"GOT / HTTP/1.1\r\n\r\n").unwrap();
    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, 400);
    assert!(String::from_utf8(body).unwrap().contains("400 Bad Request"));
    assert_eq!(headers.get("Connection").map(String::as_str), Some("close"));

    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
}

#[test]
fn post_body_round_trip() {
    start_server(19404, 10, |server| {
        server
            .post("^/upload$", |req: &HttpRequest, rsp: &mut HttpResponse| {
                rsp.set_content(req.body.clone(), "text/plain");
            })
            .unwrap();
    });

    let mut stream = connect(19404);
    stream
        .write_all(b"POST /upload HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcde")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"abcde");
}

#[test]
fn idle_connection_is_reaped() {
    let tcp = start_server(19405, 2, |_server| {});

    let mut stream = connect(19405);
    // Send nothing: the idle timer must fire within timeout + one tick.
    let mut probe = [0u8; 1];
    let n = stream.read(&mut probe).expect("expected orderly close");
    assert_eq!(n, 0, "server should close the idle socket");

    // The connection also disappears from the server's registry.
    for _ in 0..50 {
        if tcp.connection_count() == 0 {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("connection was not erased from the server table");
}

#[test]
fn path_traversal_is_not_served() {
    let www = make_www("traversal");
    start_server(19406, 10, move |server| {
        server.set_base_dir(www.to_str().unwrap()).unwrap();
    });

    let mut stream = connect(19406);
    stream
        .write_all(b"GET /../etc/passwd HTTP/1.1\r\n\r\n")
        .unwrap();
    let (status, _, _) = read_response(&mut stream);
    assert_eq!(status, 404);
}

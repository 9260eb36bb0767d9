// src/util.rs
//
// Protocol lookups and path helpers consumed by the HTTP layer: status text,
// extension MIME table, URL codec, traversal check and file probing.
use std::fs;
use std::io;

/// Reason phrase for a status code.
pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// MIME type from the file extension, `application/octet-stream` otherwise.
pub fn ext_mime(path: &str) -> &'static str {
    let ext = match path.rfind('.') {
        Some(pos) => &path[pos..],
        None => return "application/octet-stream",
    };
    match ext {
        ".html" | ".htm" => "text/html",
        ".css" => "text/css",
        ".js" => "application/javascript",
        ".json" => "application/json",
        ".xml" => "application/xml",
        ".txt" => "text/plain",
        ".csv" => "text/csv",
        ".png" => "image/png",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".gif" => "image/gif",
        ".svg" => "image/svg+xml",
        ".ico" => "image/x-icon",
        ".webp" => "image/webp",
        ".bmp" => "image/bmp",
        ".mp3" => "audio/mpeg",
        ".wav" => "audio/wav",
        ".mp4" => "video/mp4",
        ".webm" => "video/webm",
        ".avi" => "video/x-msvideo",
        ".pdf" => "application/pdf",
        ".zip" => "application/zip",
        ".gz" => "application/gzip",
        ".tar" => "application/x-tar",
        ".woff" => "font/woff",
        ".woff2" => "font/woff2",
        ".ttf" => "font/ttf",
        ".wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set. Spaces
/// become `+` only when encoding query-string components.
pub fn url_encode(src: &str, space_to_plus: bool) -> String {
    let mut out = String::with_capacity(src.len());
    for &b in src.as_bytes() {
        match b {
            b'.' | b'-' | b'_' | b'~' => out.push(b as char),
            b' ' if space_to_plus => out.push('+'),
            _ if b.is_ascii_alphanumeric() => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode `%HH` escapes; `+` becomes a space only in query-string context.
/// A `%` not followed by two hex digits passes through literally.
pub fn url_decode(src: &str, plus_to_space: bool) -> String {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' if plus_to_space => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A path is servable only while its running depth stays non-negative: every
/// plain segment descends one level, every `..` ascends one.
pub fn valid_path(path: &str) -> bool {
    let mut level: i32 = 0;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment == ".." {
            level -= 1;
            if level < 0 {
                return false;
            }
        } else {
            level += 1;
        }
    }
    true
}

pub fn is_directory(path: &str) -> bool {
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

pub fn is_regular(path: &str) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

pub fn read_file(path: &str) -> io::Result<Vec<u8>> {
    fs::read(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_encode_decode_round_trip() {
        for s in ["hello world", "C++ & Rust?", "/a/b c.html", "100%~ok"] {
            for flag in [false, true] {
                assert_eq!(url_decode(&url_encode(s, flag), flag), s);
            }
        }
    }

    #[test]
    fn test_plus_is_query_only() {
        assert_eq!(url_decode("a+b", true), "a b");
        assert_eq!(url_decode("a+b", false), "a+b");
        assert_eq!(url_encode("a b", true), "a+b");
        assert_eq!(url_encode("a b", false), "a%20b");
    }

    #[test]
    fn test_decode_percent_escapes() {
        assert_eq!(url_decode("hi%20there", false), "hi there");
        assert_eq!(url_decode("%2Fetc%2Fpasswd", false), "/etc/passwd");
        // Truncated escape passes through.
        assert_eq!(url_decode("100%", false), "100%");
        assert_eq!(url_decode("%zz", false), "%zz");
    }

    #[test]
    fn test_valid_path() {
        assert!(valid_path("/index.html"));
        assert!(valid_path("/a/b/../c.png"));
        assert!(valid_path("/"));
        assert!(!valid_path("/../etc/passwd"));
        assert!(!valid_path("/a/../../b"));
    }

    #[test]
    fn test_ext_mime() {
        assert_eq!(ext_mime("/www/index.html"), "text/html");
        assert_eq!(ext_mime("logo.svg"), "image/svg+xml");
        assert_eq!(ext_mime("archive.tar.gz"), "application/gzip");
        assert_eq!(ext_mime("no_extension"), "application/octet-stream");
    }

    #[test]
    fn test_status_text() {
        assert_eq!(status_text(200), "OK");
        assert_eq!(status_text(404), "Not Found");
        assert_eq!(status_text(414), "URI Too Long");
        assert_eq!(status_text(999), "Unknown");
    }
}

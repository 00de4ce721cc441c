//! Minimal embedded HTTP endpoint for metrics scrapes.
//!
//! One listener thread, blocking accept, one request per connection:
//!
//! - `GET /metrics` responds `200 text/plain; version=0.0.4` with the
//!   tracker's Prometheus exposition.
//! - Any other path responds `404`.
//!
//! This is a scrape endpoint, not a web server: no keep-alive, no TLS, no
//! request body handling. The listener thread runs for the life of the
//! process; [`crate::progress::ProgressTracker::start_server`] guards
//! against double starts.

use crate::progress::ProgressTracker;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Bind `0.0.0.0:port` and spawn the accept loop.
///
/// Returns the locally bound port (useful when `port` is 0).
///
/// # Errors
///
/// Returns the bind error; no thread is spawned in that case.
pub(crate) fn start(tracker: Arc<ProgressTracker>, port: u16) -> io::Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    let bound = listener.local_addr()?.port();
    thread::Builder::new()
        .name("jobforge-metrics".to_string())
        .spawn(move || accept_loop(listener, tracker))?;
    Ok(bound)
}

fn accept_loop(listener: TcpListener, tracker: Arc<ProgressTracker>) {
    for stream in listener.incoming() {
        let Ok(stream) = stream else { continue };
        // A misbehaving scraper only costs us this one connection.
        let _ = handle_connection(stream, &tracker);
    }
}

fn handle_connection(stream: TcpStream, tracker: &ProgressTracker) -> io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    stream.set_write_timeout(Some(Duration::from_secs(2)))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    let mut stream = stream;
    if method == "GET" && path == "/metrics" {
        let body = tracker.export_prometheus();
        write_response(
            &mut stream,
            "200 OK",
            "text/plain; version=0.0.4",
            &body,
        )
    } else {
        write_response(&mut stream, "404 Not Found", "text/plain", "not found\n")
    }
}

fn write_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &str,
) -> io::Result<()> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body.as_bytes())?;
    stream.flush()
}

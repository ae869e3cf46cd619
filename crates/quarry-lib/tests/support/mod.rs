//! Minimal loopback HTTP/1.1 fixture for exercising the download stack
//! without leaving the machine. Serves byte bodies with HEAD and Range
//! support, can cut a response short once to provoke a resume, and records
//! every request it sees.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One observed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
}

struct Route {
    body: Vec<u8>,
    /// Cut the first full-body response after this many bytes while still
    /// advertising the full Content-Length.
    cut_once_at: Option<usize>,
    cut_done: AtomicBool,
}

#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<String, Arc<Route>>>,
    seen: Mutex<Vec<SeenRequest>>,
}

pub struct TestServer {
    shared: Arc<Shared>,
    addr: std::net::SocketAddr,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let conn_shared = accept_shared.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, conn_shared).await;
                });
            }
        });

        Self { shared, addr }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn serve(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.shared.routes.lock().unwrap().insert(
            path.to_string(),
            Arc::new(Route {
                body: body.into(),
                cut_once_at: None,
                cut_done: AtomicBool::new(false),
            }),
        );
    }

    /// Serve `body`, but close the connection after `cut_at` bytes on the
    /// first full-body request.
    pub fn serve_flaky(&self, path: &str, body: impl Into<Vec<u8>>, cut_at: usize) {
        self.shared.routes.lock().unwrap().insert(
            path.to_string(),
            Arc::new(Route {
                body: body.into(),
                cut_once_at: Some(cut_at),
                cut_done: AtomicBool::new(false),
            }),
        );
    }

    pub fn remove(&self, path: &str) {
        self.shared.routes.lock().unwrap().remove(path);
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.shared.seen.lock().unwrap().clone()
    }

    pub fn requests_for(&self, path: &str) -> Vec<SeenRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    pub fn body_requests_for(&self, path: &str) -> Vec<SeenRequest> {
        self.requests_for(path)
            .into_iter()
            .filter(|r| r.method == "GET")
            .collect()
    }
}

async fn handle_connection(mut stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    // Read the request head; test requests carry no body.
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > 64 * 1024 {
            return Ok(());
        }
    }

    let text = String::from_utf8_lossy(&head);
    let mut lines = text.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut range = None;
    for line in lines {
        if let Some(value) = line.strip_prefix("Range:").or_else(|| line.strip_prefix("range:")) {
            range = Some(value.trim().to_string());
        }
    }

    shared.seen.lock().unwrap().push(SeenRequest {
        method: method.clone(),
        path: path.clone(),
        range: range.clone(),
    });

    let route = shared.routes.lock().unwrap().get(&path).cloned();
    let Some(route) = route else {
        let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        stream.write_all(response.as_bytes()).await?;
        return Ok(());
    };

    let total = route.body.len();

    if method == "HEAD" {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(response.as_bytes()).await?;
        return Ok(());
    }

    if let Some(spec) = range.as_deref().and_then(|r| r.strip_prefix("bytes=")) {
        let (start_s, end_s) = spec.split_once('-').unwrap_or((spec, ""));
        let start: usize = start_s.parse().unwrap_or(0);
        if start >= total {
            let response = format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{total}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(response.as_bytes()).await?;
            return Ok(());
        }
        let end = end_s
            .parse::<usize>()
            .ok()
            .map(|e| e.min(total - 1))
            .unwrap_or(total - 1);
        let slice = &route.body[start..=end];
        let response = format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {start}-{end}/{total}\r\nConnection: close\r\n\r\n",
            slice.len()
        );
        stream.write_all(response.as_bytes()).await?;
        stream.write_all(slice).await?;
        return Ok(());
    }

    // Full-body GET; honour a one-shot cut to simulate a dropped transfer.
    let cut = match route.cut_once_at {
        Some(at) if !route.cut_done.swap(true, Ordering::SeqCst) => Some(at),
        _ => None,
    };

    let response =
        format!("HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n");
    stream.write_all(response.as_bytes()).await?;
    match cut {
        Some(at) => {
            stream.write_all(&route.body[..at.min(total)]).await?;
            stream.flush().await?;
            // Dropping the stream mid-body leaves the client short of the
            // advertised Content-Length.
        }
        None => stream.write_all(&route.body).await?,
    }
    Ok(())
}

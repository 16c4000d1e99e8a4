//! Local HTTP bridge: listen on localhost so a browser page can read history and post lines.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::transport::GroupSocket;

/// Requests larger than this are refused with 413.
const MAX_REQUEST_LEN: usize = 256 * 1024;

/// Recent public lines, oldest first, rendered as `sender: text`.
pub struct History {
    lines: Mutex<VecDeque<String>>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
            limit,
        }
    }

    pub fn push(&self, sender: &str, text: &str) {
        if self.limit == 0 {
            return;
        }
        let line = if sender.is_empty() {
            text.to_string()
        } else {
            format!("{sender}: {text}")
        };
        let mut lines = self.lines.lock();
        while lines.len() >= self.limit {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

/// Body of POST /api/sendMessage. Other keys such as `username` are ignored; the session nickname is used.
#[derive(Debug, Deserialize)]
struct SendMessage {
    message: String,
}

#[derive(Debug, PartialEq, Eq)]
struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
enum RequestError {
    #[error("malformed request")]
    Malformed,
    #[error("request too large")]
    TooLarge,
}

#[derive(Debug, PartialEq, Eq)]
struct Response {
    status: u16,
    body: Option<String>,
}

impl Response {
    fn empty(status: u16) -> Self {
        Self { status, body: None }
    }

    fn json(status: u16, body: String) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            204 => "No Content",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Payload Too Large",
            _ => "Internal Server Error",
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let body = self.body.as_deref().unwrap_or("");
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
             Access-Control-Allow-Headers: Content-Type\r\n\
             Connection: close\r\n",
            self.status,
            self.reason()
        );
        if self.body.is_some() {
            out.push_str("Content-Type: application/json\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        out.push_str(body);
        out.into_bytes()
    }
}

/// Parse head and body. `Ok(None)` means more bytes are needed.
fn parse_request(buf: &[u8]) -> Result<Option<Request>, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf).map_err(|_| RequestError::Malformed)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return if buf.len() > MAX_REQUEST_LEN {
                Err(RequestError::TooLarge)
            } else {
                Ok(None)
            };
        }
    };
    let method = req.method.ok_or(RequestError::Malformed)?.to_string();
    let path = req.path.ok_or(RequestError::Malformed)?;
    let path = path.split('?').next().unwrap_or(path).to_string();
    let mut content_length = 0usize;
    for h in req.headers.iter() {
        if h.name.eq_ignore_ascii_case("Content-Length") {
            content_length = std::str::from_utf8(h.value)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or(RequestError::Malformed)?;
        }
    }
    let total = head_len
        .checked_add(content_length)
        .filter(|&n| n <= MAX_REQUEST_LEN)
        .ok_or(RequestError::TooLarge)?;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(Request {
        method,
        path,
        body: buf[head_len..total].to_vec(),
    }))
}

/// Route one request.
async fn handle<S: GroupSocket + 'static>(
    req: &Request,
    session: &Session<S>,
    history: &History,
) -> Response {
    if req.method.eq_ignore_ascii_case("OPTIONS") {
        return Response::empty(204);
    }
    match req.path.as_str() {
        "/api/messages" => {
            if !req.method.eq_ignore_ascii_case("GET") {
                return Response::empty(405);
            }
            match serde_json::to_string(&history.lines()) {
                Ok(body) => Response::json(200, body),
                Err(e) => {
                    warn!("history encode failed: {}", e);
                    Response::empty(500)
                }
            }
        }
        "/api/sendMessage" => {
            if !req.method.eq_ignore_ascii_case("POST") {
                return Response::empty(405);
            }
            let msg: SendMessage = match serde_json::from_slice(&req.body) {
                Ok(m) => m,
                Err(e) => {
                    debug!("bad sendMessage body: {}", e);
                    return Response::empty(400);
                }
            };
            let text = msg.message.trim();
            if text.is_empty() {
                return Response::empty(400);
            }
            match session.send_chat(text).await {
                Ok(()) => {
                    history.push(session.nickname(), text);
                    Response::empty(204)
                }
                Err(e) if e.is_oversized() => Response::empty(413),
                Err(e) => {
                    warn!("bridge send failed: {}", e);
                    Response::empty(500)
                }
            }
        }
        _ => Response::empty(404),
    }
}

/// Bind `bind` and serve until the task is dropped.
pub async fn run_bridge<S: GroupSocket + 'static>(
    bind: SocketAddr,
    session: Arc<Session<S>>,
    history: Arc<History>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(%bind, "HTTP bridge listening");
    serve(listener, session, history).await
}

async fn serve<S: GroupSocket + 'static>(
    listener: TcpListener,
    session: Arc<Session<S>>,
    history: Arc<History>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let session = session.clone();
        let history = history.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, &session, &history).await {
                debug!(%peer, "bridge connection error: {}", e);
            }
        });
    }
}

async fn handle_client<S: GroupSocket + 'static>(
    mut client: TcpStream,
    session: &Session<S>,
    history: &History,
) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let response = loop {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        match parse_request(&buf) {
            Ok(Some(req)) => break handle(&req, session, history).await,
            Ok(None) => continue,
            Err(RequestError::Malformed) => break Response::empty(400),
            Err(RequestError::TooLarge) => break Response::empty(413),
        }
    };
    client.write_all(&response.to_bytes()).await?;
    client.shutdown().await?;
    Ok(())
}

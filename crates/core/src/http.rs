//! HTTP responder hook
//!
//! Filters exposing content over HTTP delegate request handling to an [`HttpResponder`]. The
//! engine serves connections with axum, hands the responder the request head as an
//! [`HttpRequest`] and turns its [`HttpReply`] into the response. Reply bodies are either
//! complete (bytes or a file) or streamed through a [`ReplyBody`], which also receives the
//! decoded request body of uploads and can pace itself with `throttle`.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result};
use crate::io::IoRegistry;

/// Bytes read from a streamed body per chunk
const STREAM_CHUNK: usize = 16 * 1024;
/// Chunks buffered between a streamed body and the connection
const STREAM_QUEUE: usize = 4;

/// `Authorization` header, split into scheme and credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAuth {
    pub scheme: String,
    pub credentials: String,
}

impl HttpAuth {
    fn parse(value: &str) -> Self {
        let (scheme, credentials) = value.split_once(' ').unwrap_or((value, ""));
        HttpAuth {
            scheme: scheme.to_string(),
            credentials: credentials.trim().to_string(),
        }
    }
}

/// Request head handed to the responder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Origin-form target: path and query
    pub url: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub auth: Option<HttpAuth>,
}

impl HttpRequest {
    pub fn from_parts(parts: &Parts) -> Self {
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let mut request = HttpRequest {
            method: parts.method.as_str().to_string(),
            url: parts
                .uri
                .path_and_query()
                .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string()),
            version: format!("{:?}", parts.version),
            headers,
            auth: None,
        };
        request.auth = request.header("authorization").map(HttpAuth::parse);
        request
    }

    /// First header named `name`, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request path without query string
    pub fn path(&self) -> &str {
        self.url.split(['?', '#']).next().unwrap_or_default()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

/// Streamed reply body
#[async_trait]
pub trait ReplyBody: Send {
    /// Fills `buf`; 0 ends the body
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Receives request body data (uploads), before the first `read`
    async fn write(&mut self, _data: &[u8]) -> Result<usize> {
        Err(Error::NotSupported("reply body does not accept uploads".into()))
    }

    /// Delay to observe before the next read, `None` to read immediately
    fn throttle(&mut self) -> Option<Duration> {
        None
    }

    /// Called once the exchange ends, `completed` is false when the peer went away
    async fn close(&mut self, _completed: bool) -> Result<()> {
        Ok(())
    }
}

pub enum ReplyContent {
    Empty,
    Bytes(Bytes),
    File(PathBuf),
    Stream(Box<dyn ReplyBody>),
}

impl fmt::Debug for ReplyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyContent::Empty => f.write_str("Empty"),
            ReplyContent::Bytes(b) => write!(f, "Bytes({})", b.len()),
            ReplyContent::File(p) => write!(f, "File({})", p.display()),
            ReplyContent::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Responder answer
#[derive(Debug)]
pub struct HttpReply {
    pub code: u16,
    pub headers: Vec<(String, String)>,
    pub body: ReplyContent,
}

impl HttpReply {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            headers: Vec::new(),
            body: ReplyContent::Empty,
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200).with_body(ReplyContent::Bytes(body.into()))
    }

    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: ReplyContent) -> Self {
        self.body = body;
        self
    }
}

/// Answers HTTP requests on behalf of a filter
#[async_trait]
pub trait HttpResponder: Send + Sync {
    async fn respond(&self, request: &HttpRequest) -> Result<HttpReply>;
}

/// Router sending every request to `responder`
pub fn router(responder: Arc<dyn HttpResponder>) -> Router {
    Router::new().fallback(handle).with_state(responder)
}

/// Serves `responder` on `listener` until the listener fails
pub async fn serve(listener: TcpListener, responder: Arc<dyn HttpResponder>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Serving HTTP responder on {}", addr);
    }
    axum::serve(listener, router(responder))
        .await
        .map_err(|e| Error::ServiceError(format!("HTTP server error: {}", e)))
}

async fn handle(State(responder): State<Arc<dyn HttpResponder>>, request: Request) -> Response {
    let (parts, upload) = request.into_parts();
    let request = HttpRequest::from_parts(&parts);
    tracing::debug!(method = %request.method, url = %request.url, "HTTP request");

    let reply = match responder.respond(&request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(url = %request.url, "HTTP responder failed: {}", e);
            HttpReply::new(500)
        }
    };
    match build_response(&request, reply, upload).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(url = %request.url, "HTTP reply not sent: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn build_response(request: &HttpRequest, reply: HttpReply, upload: Body) -> Result<Response> {
    let status = StatusCode::from_u16(reply.code)
        .map_err(|_| Error::BadParam(format!("invalid HTTP status {}", reply.code)))?;
    let mut builder = Response::builder().status(status);
    for (name, value) in &reply.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let head_only = request.method == "HEAD";
    let body = match reply.body {
        ReplyContent::Empty => Body::empty(),
        ReplyContent::Bytes(data) if head_only => {
            builder = builder.header(CONTENT_LENGTH, data.len());
            Body::empty()
        }
        ReplyContent::Bytes(data) => Body::from(data),
        ReplyContent::File(path) => {
            let file = tokio::fs::File::open(&path).await?;
            let len = file.metadata().await?.len();
            builder = builder.header(CONTENT_LENGTH, len);
            if head_only {
                Body::empty()
            } else {
                stream_body(Box::new(FileBody { file }))
            }
        }
        ReplyContent::Stream(mut body) => {
            receive_upload(body.as_mut(), upload).await?;
            if head_only {
                body.close(true).await?;
                Body::empty()
            } else {
                stream_body(body)
            }
        }
    };
    builder
        .body(body)
        .map_err(|e| Error::BadParam(format!("invalid HTTP reply: {}", e)))
}

/// Feeds the decoded request body to a streamed reply
async fn receive_upload(body: &mut dyn ReplyBody, upload: Body) -> Result<()> {
    let mut chunks = upload.into_data_stream();
    let mut received = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| Error::ServiceError(format!("upload interrupted: {}", e)))?;
        let mut rest = &chunk[..];
        while !rest.is_empty() {
            let n = body.write(rest).await?;
            if n == 0 {
                return Err(Error::ServiceError("reply body refused upload data".into()));
            }
            rest = &rest[n..];
        }
        received += chunk.len() as u64;
    }
    if received > 0 {
        tracing::debug!(bytes = received, "HTTP upload received");
    }
    Ok(())
}

/// Pumps a streamed reply into a response body; the connection pulls at its own pace
fn stream_body(mut body: Box<dyn ReplyBody>) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes>>(STREAM_QUEUE);
    tokio::spawn(async move {
        let mut buf = vec![0u8; STREAM_CHUNK];
        let completed = loop {
            if let Some(delay) = body.throttle() {
                tokio::time::sleep(delay).await;
            }
            match body.read(&mut buf).await {
                Ok(0) => break true,
                Ok(n) => {
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        tracing::debug!("HTTP peer gone");
                        break false;
                    }
                }
                Err(e) => {
                    tracing::warn!("HTTP reply body failed: {}", e);
                    let _ = tx.send(Err(e)).await;
                    break false;
                }
            }
        };
        if let Err(e) = body.close(completed).await {
            tracing::debug!("HTTP reply body close failed: {}", e);
        }
    });
    Body::from_stream(ReceiverStream::new(rx))
}

struct FileBody {
    file: tokio::fs::File,
}

#[async_trait]
impl ReplyBody for FileBody {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf).await?)
    }
}

/// Serves resources of an [`IoRegistry`] under a URL prefix (`mem://site` + request path)
pub struct IoResponder {
    io: Arc<IoRegistry>,
    root: String,
}

impl IoResponder {
    pub fn new(io: Arc<IoRegistry>, root: impl Into<String>) -> Self {
        Self {
            io,
            root: root.into(),
        }
    }
}

#[async_trait]
impl HttpResponder for IoResponder {
    async fn respond(&self, request: &HttpRequest) -> Result<HttpReply> {
        if request.method != "GET" && request.method != "HEAD" {
            return Ok(HttpReply::new(405).with_header("Allow", "GET, HEAD"));
        }
        let url = format!("{}{}", self.root.trim_end_matches('/'), request.path());
        if !self.io.probe(&url) {
            return Ok(HttpReply::not_found());
        }
        let data = self.io.read_all(&url)?;
        Ok(HttpReply::ok(data))
    }
}

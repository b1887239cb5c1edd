//! Integration tests for virtual I/O backends, file filters and the HTTP responder

mod common;

use async_trait::async_trait;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use filtergraph_core::http::{
    self, HttpReply, HttpRequest, HttpResponder, IoResponder, ReplyBody, ReplyContent,
};
use filtergraph_core::io::{IoHandle, IoMode, IoOpened, IoRegistry, VirtualIo};
use filtergraph_core::{Error, Result, RunOutcome};

/// `pattern://<len>` resources: `len` bytes counting up from zero
struct PatternIo;

struct PatternHandle {
    len: u64,
    pos: u64,
}

fn pattern_len(url: &str) -> Result<u64> {
    url.strip_prefix("pattern://")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| Error::BadParam(format!("bad pattern URL '{}'", url)))
}

impl VirtualIo for PatternIo {
    fn name(&self) -> &str {
        "pattern"
    }

    fn schemes(&self) -> Vec<String> {
        vec!["pattern".to_string()]
    }

    fn open(&self, url: &str, mode: IoMode) -> Result<IoOpened> {
        match mode {
            IoMode::Read => Ok(IoOpened::Handle(Box::new(PatternHandle {
                len: pattern_len(url)?,
                pos: 0,
            }))),
            IoMode::Probe => Ok(IoOpened::Exists(pattern_len(url).is_ok())),
            IoMode::Url => Ok(IoOpened::Url(url.to_string())),
            other => Err(Error::NotSupported(format!("pattern resources are read-only ({:?})", other))),
        }
    }
}

impl IoHandle for PatternHandle {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::Current(d) => self.pos.saturating_add_signed(d),
            SeekFrom::End(d) => self.len.saturating_add_signed(d),
        }
        .min(self.len);
        Ok(self.pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = (self.len - self.pos).min(buf.len() as u64) as usize;
        for (i, b) in buf[..n].iter_mut().enumerate() {
            *b = (self.pos + i as u64) as u8;
        }
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(Error::NotSupported("read-only".into()))
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.pos)
    }

    fn eof(&mut self) -> bool {
        self.pos >= self.len
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_file_copy_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.bin");
    let output = dir.path().join("output.bin");
    let payload: Vec<u8> = (0..12_345u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&input, &payload).unwrap();

    let session = common::session();
    session.load_source(input.to_str().unwrap()).unwrap();
    session.load_destination(output.to_str().unwrap()).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    assert_eq!(std::fs::read(&output).unwrap(), payload);
    // 5000-byte blocks
    assert_eq!(session.stats().filter("fin").unwrap().packets_out, 3);
}

#[test]
fn test_custom_backend_feeds_file_input() {
    let session = common::session();
    session.io().register(Arc::new(PatternIo)).unwrap();
    assert!(session.io().schemes().contains(&"pattern".to_string()));

    session.load_source("pattern://7000").unwrap();
    session.load_destination("mem://copy").unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let copy = session.io().memory().get("copy").unwrap();
    assert_eq!(copy.len(), 7000);
    assert!(copy.iter().enumerate().all(|(i, b)| *b == i as u8));
}

#[test]
fn test_duplicate_scheme_rejected() {
    struct Shadow;
    impl VirtualIo for Shadow {
        fn name(&self) -> &str {
            "shadow"
        }
        fn schemes(&self) -> Vec<String> {
            vec!["mem".to_string()]
        }
        fn open(&self, _url: &str, _mode: IoMode) -> Result<IoOpened> {
            Ok(IoOpened::Exists(false))
        }
    }

    let io = IoRegistry::new();
    assert!(matches!(io.register(Arc::new(Shadow)), Err(Error::Config(_))));
    io.memory().insert("kept", b"data".to_vec());
    assert!(io.probe("mem://kept"));
}

#[test]
fn test_memory_references_release_resource() {
    let io = IoRegistry::new();
    assert_eq!(io.reference("mem://shared").unwrap(), 1);
    assert_eq!(io.reference("mem://shared").unwrap(), 2);
    assert!(io.memory().contains("shared"));

    assert_eq!(io.unreference("mem://shared").unwrap(), 1);
    assert!(io.memory().contains("shared"));
    assert_eq!(io.unreference("mem://shared").unwrap(), 0);
    assert!(!io.memory().contains("shared"));
}

#[test]
fn test_missing_source_fails_open() {
    let io = IoRegistry::new();
    assert!(!io.probe("mem://absent"));
    assert!(matches!(io.open("mem://absent", IoMode::Read), Err(Error::Io(_))));
    assert!(matches!(io.open("mem://absent", IoMode::Probe), Err(Error::BadParam(_))));
    assert!(matches!(io.resolve("gopher://x"), Err(Error::NotSupported(_))));
}

#[test]
fn test_inspect_log_written_to_memory() {
    let session = common::session();
    session.load_filter("testsrc:dur=1:size=16x16:streams=v").unwrap();
    session.load_filter("inspect:log=mem://report").unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let report = session.io().memory().get("report").unwrap();
    let text = String::from_utf8(report).unwrap();
    assert!(text.contains("from testsrc: 25 packets"), "{}", text);
    assert!(text.contains("eos"));
}

fn responder_with_site() -> Arc<dyn HttpResponder> {
    let io = Arc::new(IoRegistry::new());
    io.memory().insert("site/index.html", b"hello".to_vec());
    Arc::new(IoResponder::new(io, "mem://site"))
}

/// Serves `responder` on an ephemeral local port
async fn start(responder: Arc<dyn HttpResponder>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(http::serve(listener, responder));
    addr
}

/// Sends a raw request (which must ask for `Connection: close`) and reads the whole reply
async fn exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8(reply).unwrap()
}

#[tokio::test]
async fn test_io_responder_serves_memory_resource() {
    let addr = start(responder_with_site()).await;

    let reply = exchange(
        addr,
        b"GET /index.html?v=2 HTTP/1.1\r\nHost: local\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
    assert!(reply.contains("content-length: 5\r\n"));
    assert!(reply.ends_with("\r\n\r\nhello"));

    let reply = exchange(addr, b"HEAD /index.html HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
    assert!(reply.contains("content-length: 5\r\n"));
    assert!(reply.ends_with("\r\n\r\n"));
}

#[tokio::test]
async fn test_io_responder_errors() {
    let addr = start(responder_with_site()).await;

    let reply = exchange(addr, b"GET /missing HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", reply);

    let reply = exchange(addr, b"DELETE /index.html HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{}", reply);
    assert!(reply.contains("allow: GET, HEAD\r\n"));
}

/// Streamed reply sending back what was uploaded
struct EchoBody {
    data: Vec<u8>,
    sent: bool,
    uploads: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl ReplyBody for EchoBody {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.sent {
            return Ok(0);
        }
        self.sent = true;
        buf[..self.data.len()].copy_from_slice(&self.data);
        Ok(self.data.len())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.data.extend_from_slice(data);
        Ok(data.len())
    }

    async fn close(&mut self, _completed: bool) -> Result<()> {
        self.uploads.lock().unwrap().push(self.data.clone());
        Ok(())
    }
}

struct EchoResponder {
    uploads: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl HttpResponder for EchoResponder {
    async fn respond(&self, _request: &HttpRequest) -> Result<HttpReply> {
        Ok(HttpReply::new(200).with_body(ReplyContent::Stream(Box::new(EchoBody {
            data: Vec::new(),
            sent: false,
            uploads: self.uploads.clone(),
        }))))
    }
}

#[tokio::test]
async fn test_chunked_upload_reaches_streamed_reply() {
    let uploads = Arc::new(Mutex::new(Vec::new()));
    let addr = start(Arc::new(EchoResponder {
        uploads: uploads.clone(),
    }))
    .await;

    let reply = exchange(
        addr,
        b"POST /up HTTP/1.1\r\nHost: local\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    )
    .await;
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
    assert!(reply.contains("transfer-encoding: chunked\r\n"));
    assert!(reply.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"), "{}", reply);
    assert_eq!(*uploads.lock().unwrap(), vec![b"hello".to_vec()]);
}

use crate::executor::Executor;
use crate::tcp::{TcpListener, TcpStream};
use crate::worker::{Worker, WorkerError};
use std::{hint::black_box, io, rc::Rc, time::Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// `/block`和`/offload`默认的计数循环次数
pub const DEFAULT_BLOCK_ITERS: u64 = 400_000_000;

/// 请求头最多读这么多字节
const MAX_REQUEST_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request line: {0:?}")]
    Malformed(String),
    #[error("request head too large")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 解析后的请求。只关心请求行，头部读完即弃。
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
}

impl Request {
    /// 解析`"GET /path HTTP/1.1"`形式的请求行
    pub fn parse(line: &str) -> Result<Self, HttpError> {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), Some(version), None) if version.starts_with("HTTP/") => {
                Ok(Self {
                    method: method.to_string(),
                    path: path.to_string(),
                })
            }
            _ => Err(HttpError::Malformed(line.to_string())),
        }
    }
}

/// 纯文本响应
#[derive(Debug)]
pub struct Response {
    status: u16,
    reason: &'static str,
    body: String,
}

impl Response {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            reason: "OK",
            body: body.into(),
        }
    }

    pub fn bad_request() -> Self {
        Self {
            status: 400,
            reason: "Bad Request",
            body: "bad request\n".to_string(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            reason: "Not Found",
            body: "not found\n".to_string(),
        }
    }

    pub fn method_not_allowed() -> Self {
        Self {
            status: 405,
            reason: "Method Not Allowed",
            body: "only GET is served here\n".to_string(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        let mut body = message.into();
        if !body.ends_with('\n') {
            body.push('\n');
        }
        Self {
            status: 500,
            reason: "Internal Server Error",
            body,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.reason,
            self.body.len()
        );
        writer.write_all(head.as_bytes()).await?;
        writer.write_all(self.body.as_bytes()).await?;
        writer.flush().await
    }
}

/// 三路由演示服务：`/`非阻塞、`/block`阻塞、`/offload`卸载到`Worker`
pub struct Server {
    block_iters: u64,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self::with_block_iters(DEFAULT_BLOCK_ITERS)
    }

    pub fn with_block_iters(block_iters: u64) -> Self {
        Self { block_iters }
    }

    /// accept循环。每个连接丢进一个新任务处理，accept本身永远不等待连接处理。
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        let server = Rc::new(self);
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "connection accepted");
            let server = server.clone();
            Executor::spawn(async move {
                if let Err(err) = server.handle(stream).await {
                    warn!(error = %err, "connection failed");
                }
            });
        }
    }

    /// 读一个请求、路由、写回响应、关写端
    pub async fn handle(&self, mut stream: TcpStream) -> Result<(), HttpError> {
        let response = match read_request(&mut stream).await {
            Ok(request) => self.route(&request).await,
            Err(HttpError::Io(err)) => return Err(HttpError::Io(err)),
            Err(err) => {
                warn!(error = %err, "bad request");
                Response::bad_request()
            }
        };
        response.write_to(&mut stream).await?;
        stream.shutdown().await?;
        Ok(())
    }

    pub async fn route(&self, request: &Request) -> Response {
        if request.method != "GET" {
            return Response::method_not_allowed();
        }
        match request.path.as_str() {
            "/" => {
                let started = Instant::now();
                info!("baseline: replying immediately");
                let response = Response::ok("hello\n");
                info!(elapsed = ?started.elapsed(), "baseline: reply ready");
                response
            }
            "/block" => {
                let started = Instant::now();
                info!(iters = self.block_iters, "blocking the loop thread");
                let count = count_up(self.block_iters);
                info!(elapsed = ?started.elapsed(), "loop thread unblocked");
                Response::ok(format!("counted to {} on the loop thread\n", count))
            }
            "/offload" => {
                let started = Instant::now();
                match self.offload().await {
                    Ok(count) => {
                        info!(elapsed = ?started.elapsed(), "worker replied");
                        Response::ok(format!("counted to {} on a worker\n", count))
                    }
                    Err(err) => {
                        error!(error = %err, "worker failed");
                        Response::internal_error(err.to_string())
                    }
                }
            }
            _ => Response::not_found(),
        }
    }

    /// 每个请求一个`Worker`：发一条消息，等回复，然后关掉它
    async fn offload(&self) -> Result<u64, WorkerError> {
        let worker = Worker::spawn(count_up)?;
        let reply = worker.call(self.block_iters).await;
        if worker.terminate().is_err() {
            warn!("worker did not shut down cleanly");
        }
        reply
    }
}

/// 同步计数大循环。`black_box`防止整个循环被优化掉。
pub fn count_up(iters: u64) -> u64 {
    let mut count = 0u64;
    for _ in 0..iters {
        count = black_box(count) + 1;
    }
    count
}

/// 读到空行为止，然后解析请求行
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Request, HttpError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = header_end(&buf) {
            let head = std::str::from_utf8(&buf[..end])
                .map_err(|_| HttpError::Malformed("<not utf-8>".to_string()))?;
            let line = head
                .lines()
                .next()
                .ok_or_else(|| HttpError::Malformed(String::new()))?;
            return Request::parse(line);
        }
        if buf.len() >= MAX_REQUEST_BYTES {
            return Err(HttpError::TooLarge);
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::Malformed("<connection closed early>".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use assert_matches::assert_matches;

    #[test]
    fn parses_a_plain_request_line() {
        let request = Request::parse("GET /block HTTP/1.1").unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/block");
    }

    #[test]
    fn rejects_garbage_request_lines() {
        assert_matches!(Request::parse("GET"), Err(HttpError::Malformed(_)));
        assert_matches!(Request::parse("GET / nonsense"), Err(HttpError::Malformed(_)));
        assert_matches!(
            Request::parse("GET / HTTP/1.1 extra"),
            Err(HttpError::Malformed(_))
        );
    }

    #[test]
    fn reads_a_request_from_a_buffer() {
        let ex = Executor::new();
        let request = ex.block_on(|| async {
            let mut raw: &[u8] = b"GET /offload HTTP/1.1\r\nHost: localhost\r\n\r\n";
            read_request(&mut raw).await.unwrap()
        });
        assert_eq!(request.path, "/offload");
    }

    #[test]
    fn truncated_requests_are_malformed() {
        let ex = Executor::new();
        let result = ex.block_on(|| async {
            let mut raw: &[u8] = b"GET / HTTP/1.1\r\nHost:";
            read_request(&mut raw).await
        });
        assert_matches!(result, Err(HttpError::Malformed(_)));
    }

    #[test]
    fn responses_carry_status_line_and_content_length() {
        let ex = Executor::new();
        let written = ex.block_on(|| async {
            let mut out = Vec::new();
            Response::ok("hello\n").write_to(&mut out).await.unwrap();
            out
        });
        let text = String::from_utf8(written).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\nhello\n"));
    }

    #[test]
    fn baseline_route_replies_immediately() {
        let ex = Executor::new();
        let response = ex.block_on(|| async {
            let server = Server::with_block_iters(10);
            server
                .route(&Request::parse("GET / HTTP/1.1").unwrap())
                .await
        });
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), "hello\n");
    }

    #[test]
    fn block_route_counts_on_the_loop_thread() {
        let ex = Executor::new();
        let response = ex.block_on(|| async {
            let server = Server::with_block_iters(12345);
            server
                .route(&Request::parse("GET /block HTTP/1.1").unwrap())
                .await
        });
        assert_eq!(response.status(), 200);
        assert!(response.body().contains("12345"));
    }

    #[test]
    fn offload_route_counts_on_a_worker() {
        let ex = Executor::new();
        let response = ex.block_on(|| async {
            let server = Server::with_block_iters(54321);
            server
                .route(&Request::parse("GET /offload HTTP/1.1").unwrap())
                .await
        });
        assert_eq!(response.status(), 200);
        assert!(response.body().contains("54321"));
        assert!(response.body().contains("worker"));
    }

    #[test]
    fn unknown_paths_get_404_and_non_get_gets_405() {
        let ex = Executor::new();
        let (missing, posted) = ex.block_on(|| async {
            let server = Server::with_block_iters(10);
            let missing = server
                .route(&Request::parse("GET /nope HTTP/1.1").unwrap())
                .await;
            let posted = server
                .route(&Request::parse("POST / HTTP/1.1").unwrap())
                .await;
            (missing, posted)
        });
        assert_eq!(missing.status(), 404);
        assert_eq!(posted.status(), 405);
    }
}

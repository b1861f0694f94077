//! HTTP connection handling module
//!
//! This module provides functionality for managing HTTP connections and processing
//! HTTP requests and responses. It implements the core connection handling logic
//! for the HTTP server.
//!
//! # Components
//!
//! - [`HttpConnection`]: Main connection handler that:
//!   - Manages the lifecycle of HTTP connections
//!   - Processes incoming requests, dispatching each to the handler as soon as
//!     its body has been read off the wire
//!   - Streams responses back to the client through an order-preserving writer
//!     queue, so a slow response never blocks a faster one behind it from
//!     being generated, only from reaching the wire out of turn
//!   - Supports keep-alive connections with an idle deadline
//!   - Implements expect-continue handling
//!   - Supports graceful shutdown: stop accepting new requests, finish what's
//!     in flight, then close
//!
//! # Features
//!
//! - Asynchronous I/O handling
//! - Streaming request and response processing
//! - HTTP/1.1 pipelining with strict in-order response delivery
//! - Keep-alive connection support with idle timeout
//! - Error handling and recovery
//! - Expect-continue mechanism
//! - Efficient memory usage through buffering

use std::error::Error;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use http::header::EXPECT;
use http::{Response, StatusCode};
use http_body::Body;
use http_body_util::Empty;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;

use crate::codec::RequestDecoder;
use crate::connection::writer::{ResponseWriter, WriterQueue};
use crate::handler::Handler;
use crate::protocol::body::ReqBody;
use crate::protocol::{HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHeader, ResponseHead, SendError};

use futures::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

/// Default idle keep-alive timeout: how long a connection waits for the next
/// pipelined request before it closes itself.
const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on requests dispatched to the handler but not yet fully
/// written back to the client. Bounds how much response data a slow client
/// or a deliberately abusive pipeline can force the server to buffer.
const DEFAULT_MAX_PIPELINE_DEPTH: usize = 32;

/// An HTTP connection that manages request processing and response streaming
///
/// `HttpConnection` handles the full lifecycle of an HTTP connection, including:
/// - Reading and decoding requests
/// - Processing request headers and bodies
/// - Handling expect-continue mechanism
/// - Pipelining requests while keeping responses strictly in order
///
/// # Type Parameters
///
/// * `R`: The async readable stream type
/// * `W`: The async writable stream type
pub struct HttpConnection<R, W> {
    framed_read: Option<FramedRead<R, RequestDecoder>>,
    writers: WriterQueue<W>,
    pipeline_limit: Arc<Semaphore>,
    keep_alive_timeout: Duration,
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Unpin + Send + std::fmt::Debug + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_config(reader, writer, DEFAULT_KEEP_ALIVE_TIMEOUT, DEFAULT_MAX_PIPELINE_DEPTH)
    }

    pub fn with_config(reader: R, writer: W, keep_alive_timeout: Duration, max_pipeline_depth: usize) -> Self {
        Self {
            framed_read: Some(FramedRead::with_capacity(reader, RequestDecoder::new(), 8 * 1024)),
            writers: WriterQueue::new(writer),
            pipeline_limit: Arc::new(Semaphore::new(max_pipeline_depth)),
            keep_alive_timeout,
        }
    }

    /// Drives the connection to completion: reads requests, dispatches each to
    /// `handler`, and streams responses back until the peer disconnects, the
    /// keep-alive deadline elapses, or `shutdown` resolves.
    ///
    /// `shutdown` is polled alongside the read loop so a listener can ask every
    /// open connection to wind down gracefully; requests already dispatched are
    /// still allowed to finish, but no further request is read once it fires.
    pub async fn process<H>(mut self, handler: Arc<H>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), HttpError>
    where
        H: Handler + 'static,
        H::RespBody: Body<Data = Bytes> + Unpin + 'static,
        <H::RespBody as Body>::Error: Display,
    {
        loop {
            let mut framed_read = self.framed_read.take().expect("framed_read missing between requests");

            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("shutdown requested, closing connection after draining in-flight requests");
                    self.framed_read = Some(framed_read);
                    return Ok(());
                }
                _ = tokio::time::sleep(self.keep_alive_timeout) => {
                    debug!("keep-alive timeout elapsed, closing idle connection");
                    self.framed_read = Some(framed_read);
                    return Ok(());
                }
                item = framed_read.next() => item,
            };

            match next {
                Some(Ok(Message::Header((header, payload_size)))) => {
                    self.framed_read = Some(framed_read);
                    self.dispatch(header, payload_size, &handler).await?;
                }

                Some(Ok(Message::Payload(_))) => {
                    error!("expected a request header but received a body frame");
                    let writer = self.writers.next_writer();
                    Self::send_error(writer, StatusCode::BAD_REQUEST, false).await?;
                    return Err(ParseError::invalid_body("need header while receive body").into());
                }

                Some(Err(e)) => {
                    error!("can't receive next request, cause {}", e);
                    let writer = self.writers.next_writer();
                    Self::send_error(writer, StatusCode::BAD_REQUEST, false).await?;
                    return Err(e.into());
                }

                None => {
                    info!("peer closed the connection, nothing more to read");
                    return Ok(());
                }
            }
        }
    }

    /// Reads and drains the body for one request, runs the handler, and spawns
    /// a local task that streams the response through its reserved writer slot
    /// without blocking this loop from moving on to the next request.
    async fn dispatch<H>(&mut self, header: RequestHeader, payload_size: PayloadSize, handler: &Arc<H>) -> Result<(), HttpError>
    where
        H: Handler + 'static,
        H::RespBody: Body<Data = Bytes> + Unpin + 'static,
        <H::RespBody as Body>::Error: Display,
    {
        let permit = Arc::clone(&self.pipeline_limit).acquire_owned().await.expect("pipeline semaphore never closed");
        let mut writer = self.writers.next_writer();
        let keep_alive = header.keep_alive();

        if let Some(value) = header.headers().get(EXPECT) {
            let slice = value.as_bytes();
            if slice.len() >= 4 && &slice[0..4] == b"100-" {
                writer.write_continue().await?;
                info!("received expect-continue request header, sent interim continue response");
            }
        }

        let framed_read = self.framed_read.take().expect("framed_read missing while dispatching");
        let (req_body, body_state) = ReqBody::create_req_body(framed_read, payload_size);
        let request = header.body(req_body);

        let response_result = handler.call(request).await;

        self.framed_read = Some(body_state.finish().await?);

        tokio::task::spawn_local(async move {
            let _permit = permit;
            if let Err(e) = Self::send_response(writer, response_result, keep_alive).await {
                error!("failed streaming response to client: {}", e);
            }
        });

        Ok(())
    }

    async fn send_response<T, E>(writer: ResponseWriter<W>, response_result: Result<Response<T>, E>, keep_alive: bool) -> Result<(), HttpError>
    where
        T: Body + Unpin,
        T::Error: Display,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        match response_result {
            Ok(response) => Self::write_response(writer, response, keep_alive).await,
            Err(e) => {
                error!("handler returned an error, cause: {}", e.into());
                let response = Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).body(Empty::<Bytes>::new()).unwrap();
                Self::write_response(writer, response, keep_alive).await
            }
        }
    }

    async fn write_response<T>(mut writer: ResponseWriter<W>, response: Response<T>, keep_alive: bool) -> Result<(), HttpError>
    where
        T: Body + Unpin,
        T::Error: Display,
    {
        let (header_parts, mut body) = response.into_parts();

        let payload_size = match body.size_hint().exact() {
            Some(0) => PayloadSize::Empty,
            Some(length) => PayloadSize::Length(length),
            None => PayloadSize::Chunked,
        };

        let header = ResponseHead::from_parts(header_parts, ());

        let result = async {
            writer.write_header(header, payload_size, keep_alive).await?;

            if payload_size.is_empty() {
                return Ok(());
            }

            loop {
                match body.frame().await {
                    Some(Ok(frame)) => {
                        let item = frame.into_data().map(PayloadItem::Chunk).map_err(|_e| SendError::invalid_body("resolve body response error"))?;
                        writer.write_payload(item).await?;
                    }
                    Some(Err(e)) => return Err(SendError::invalid_body(format!("resolve response body error: {e}"))),
                    None => {
                        writer.write_payload(PayloadItem::<Bytes>::Eof).await?;
                        return Ok(());
                    }
                }
            }
        }
        .await;

        match result {
            Ok(()) => {
                writer.done().await?;
                Ok(())
            }
            Err(e) => {
                writer.abort().await?;
                Err(e.into())
            }
        }
    }

    async fn send_error(writer: ResponseWriter<W>, status: StatusCode, keep_alive: bool) -> Result<(), HttpError> {
        warn!(status = %status, "sending generated error response");
        let response = Response::builder().status(status).body(Empty::<Bytes>::new()).unwrap();
        Self::write_response(writer, response, keep_alive).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request as HttpRequest, StatusCode};
    use http_body_util::{BodyExt, Full};
    use std::cell::RefCell;
    use std::io;
    use std::pin::Pin;
    use std::rc::Rc;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    #[derive(Debug)]
    struct MockReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl MockReader {
        fn new(data: impl Into<Vec<u8>>) -> Self {
            Self { data: data.into(), pos: 0 }
        }
    }

    impl AsyncRead for MockReader {
        fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            let remaining = &self.data[self.pos..];
            let amt = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..amt]);
            self.pos += amt;
            Poll::Ready(Ok(()))
        }
    }

    /// Reads a fixed-size slice per poll regardless of how much is actually
    /// buffered, to exercise the decoder against a small read buffer.
    #[derive(Debug)]
    struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl AsyncRead for ChunkedReader {
        fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            let remaining = &self.data[self.pos..];
            let amt = remaining.len().min(self.step).min(buf.remaining());
            buf.put_slice(&remaining[..amt]);
            self.pos += amt;
            Poll::Ready(Ok(()))
        }
    }

    #[derive(Clone, Debug, Default)]
    struct MockWriter(Rc<RefCell<Vec<u8>>>);

    impl MockWriter {
        fn snapshot(&self) -> Vec<u8> {
            self.0.borrow().clone()
        }
    }

    impl AsyncWrite for MockWriter {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.0.borrow_mut().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Drives `process` to completion on a single-threaded `LocalSet` (required
    /// by the response writer's `spawn_local` task) and returns everything
    /// written to the socket once every spawned task has finished.
    async fn run<R, H>(reader: R, handler: H) -> Vec<u8>
    where
        R: AsyncRead + Unpin + Send + std::fmt::Debug + 'static,
        H: Handler + 'static,
        H::RespBody: Body<Data = Bytes> + Unpin + 'static,
        <H::RespBody as Body>::Error: Display,
    {
        let writer = MockWriter::default();
        let written = writer.clone();
        let connection = HttpConnection::new(reader, writer);
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let handler = Arc::new(handler);

        let local = tokio::task::LocalSet::new();
        local.spawn_local(async move {
            connection.process(handler, rx).await.unwrap();
        });
        local.await;

        written.snapshot()
    }

    async fn ok_handler(_req: HttpRequest<ReqBody>) -> Result<Response<Empty<Bytes>>, Box<dyn Error + Send + Sync>> {
        Ok(Response::builder().status(StatusCode::OK).body(Empty::new()).unwrap())
    }

    async fn echo_handler(req: HttpRequest<ReqBody>) -> Result<Response<Full<Bytes>>, Box<dyn Error + Send + Sync>> {
        let collected = req.into_body().collect().await.map_err(|e| Box::new(e) as Box<dyn Error + Send + Sync>)?;
        Ok(Response::builder().status(StatusCode::OK).body(Full::new(collected.to_bytes())).unwrap())
    }

    async fn stop_after_first_chunk_handler(req: HttpRequest<ReqBody>) -> Result<Response<Full<Bytes>>, Box<dyn Error + Send + Sync>> {
        let mut body = req.into_body();
        let _first_chunk = body.frame().await;
        Ok(Response::builder().status(StatusCode::OK).body(Full::new(Bytes::from_static(b"Hello, World!"))).unwrap())
    }

    #[tokio::test]
    async fn ok_response_for_simple_get() {
        let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        let written = run(MockReader::new(request), crate::handler::make_handler(ok_handler)).await;
        let text = String::from_utf8(written).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.to_lowercase().contains("connection: keep-alive"));
        assert!(text.ends_with("0\r\n\r\n"));
    }

    #[tokio::test]
    async fn echoes_request_body() {
        let request = b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 14\r\nConnection: close\r\n\r\nThis is a test".to_vec();
        let written = run(MockReader::new(request), crate::handler::make_handler(echo_handler)).await;
        let text = String::from_utf8(written).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("This is a test"));
    }

    /// Connection-count side of this scenario (registry stays at 1 for the
    /// whole sequence) is exercised by `listener::registry`'s test; here we
    /// only check that every pipelined response carries `Connection: keep-alive`.
    #[tokio::test]
    async fn keep_alive_sequence_of_three_requests() {
        let request = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\nGET /c HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n".to_vec();
        let written = run(MockReader::new(request), crate::handler::make_handler(ok_handler)).await;
        let text = String::from_utf8(written).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 3);
        assert_eq!(text.to_lowercase().matches("connection: keep-alive").count(), 2);
        assert_eq!(text.to_lowercase().matches("connection: close").count(), 1);
    }

    #[tokio::test]
    async fn explicit_close_is_echoed_back() {
        let request = b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n".to_vec();
        let written = run(MockReader::new(request), crate::handler::make_handler(ok_handler)).await;
        let text = String::from_utf8(written).unwrap();
        assert!(text.to_lowercase().contains("connection: close"));
    }

    #[tokio::test]
    async fn large_echo_with_small_read_buffer() {
        let body = "x".repeat(16_385);
        let request =
            format!("POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}", body.len(), body);
        let reader = ChunkedReader { data: request.into_bytes(), pos: 0, step: 1024 };
        let written = run(reader, crate::handler::make_handler(echo_handler)).await;
        let text = String::from_utf8(written).unwrap();
        assert!(text.ends_with(&body));
    }

    #[tokio::test]
    async fn stop_mid_upload_still_drains_the_body() {
        let request = b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello".to_vec();
        let written = run(MockReader::new(request), crate::handler::make_handler(stop_after_first_chunk_handler)).await;
        let text = String::from_utf8(written).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("Hello, World!"));
    }
}

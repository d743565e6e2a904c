//! Server side of the HTTP/1.1 protocol, one request at a time.
//!
//! # Example
//!
//! ```rust, no_run
//! use fdk_h1::server::{self, ResponseBody};
//! use async_std::os::unix::net::UnixListener;
//! use http::{Response, StatusCode};
//!
//! #[async_std::main]
//! async fn main() -> Result<(), fdk_h1::Error> {
//!     let listener = UnixListener::bind("/tmp/echo.sock").await?;
//!
//!     loop {
//!         let (socket, _) = listener.accept().await?;
//!
//!         async_std::task::spawn(async move {
//!             let mut h1 = server::handshake(socket);
//!
//!             // Handle incoming requests from this socket, one by one.
//!             while let Some(Ok((req, mut body))) = h1.accept().await {
//!                 let data = body.read_all().await.unwrap_or_default();
//!                 println!("{} {}: {} bytes", req.method(), req.uri(), data.len());
//!
//!                 let res = Response::builder()
//!                     .status(StatusCode::OK)
//!                     .body(ResponseBody::Bytes(data))
//!                     .unwrap();
//!
//!                 if h1.send_response(res).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         });
//!     }
//! }
//! ```

use crate::body::{closed_err, Body, LimitRead};
use crate::buf_reader::BufIo;
use crate::http11::{poll_for_crlfcrlf, try_parse_req, write_http1x_res};
use crate::Error;
use crate::{AsyncRead, AsyncWrite};
use futures_util::future::poll_fn;
use futures_util::ready;
use futures_util::stream::{BoxStream, StreamExt};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

/// Initial size of the read-ahead buffer.
const READ_BUF_INIT_SIZE: usize = 16_384;

/// Size of buffer used when draining an unread request body.
const DRAIN_CHUNK: usize = 8192;

/// Start serving a connection.
///
/// See [module level doc](index.html) for an example.
pub fn handshake<S>(io: S) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Connection {
        inner: Arc::new(Mutex::new(Codec::new(io))),
    }
}

/// Body of a response.
pub enum ResponseBody {
    /// Complete body, sent with `content-length`.
    Bytes(Vec<u8>),
    /// Body produced piece by piece. Sent chunked to an HTTP/1.1 peer and
    /// delimited by closing the connection for HTTP/1.0.
    Stream(BoxStream<'static, io::Result<Vec<u8>>>),
}

impl ResponseBody {
    pub fn empty() -> Self {
        ResponseBody::Bytes(vec![])
    }
}

impl Default for ResponseBody {
    fn default() -> Self {
        ResponseBody::empty()
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(v: Vec<u8>) -> Self {
        ResponseBody::Bytes(v)
    }
}

impl From<String> for ResponseBody {
    fn from(v: String) -> Self {
        ResponseBody::Bytes(v.into_bytes())
    }
}

impl From<&str> for ResponseBody {
    fn from(v: &str) -> Self {
        ResponseBody::Bytes(v.as_bytes().to_vec())
    }
}

/// Server connection accepting requests and sending responses.
///
/// Requests are handled strictly in turn: every request from [`accept`] must
/// get a [`send_response`] before the next `accept`.
///
/// [`accept`]: Connection::accept
/// [`send_response`]: Connection::send_response
pub struct Connection {
    inner: Arc<Mutex<Codec>>,
}

impl Connection {
    /// Wait for the next request.
    ///
    /// `None` when the peer closed the connection between requests. A
    /// malformed request is an error and closes the connection, no response
    /// is written for it.
    pub async fn accept(&mut self) -> Option<Result<(http::Request<()>, Body), Error>> {
        let inner = &self.inner;
        poll_fn(|cx| lock(inner).poll_accept(cx, inner)).await
    }

    /// Wait until the first bytes of a next request arrive, or the peer
    /// closes. Consumes nothing, follow up with [`accept`].
    ///
    /// [`accept`]: Connection::accept
    pub async fn wait_for_request(&self) -> io::Result<()> {
        let inner = &self.inner;
        poll_fn(|cx| {
            let mut codec = lock(inner);
            if !codec.io.buffered().is_empty() {
                return Poll::Ready(Ok(()));
            }
            codec.io.poll_fill_buf(cx).map_ok(|_| ())
        })
        .await
    }

    /// Send the response to the request last accepted.
    ///
    /// What the handler left unread of the request body is drained first.
    /// Afterwards the connection is either ready for the next request, or
    /// closed if the request or the response asked for it. On error the
    /// connection is closed.
    pub async fn send_response(&mut self, res: http::Response<ResponseBody>) -> Result<(), Error> {
        let ret = self.do_send_response(res).await;

        if let Err(e) = &ret {
            debug!("Failed to send response: {}", e);
            self.close().await;
        }

        ret
    }

    async fn do_send_response(&mut self, res: http::Response<ResponseBody>) -> Result<(), Error> {
        let req = match lock(&self.inner).state {
            State::Respond(r) => r,
            _ => return Err(Error::User("No request to respond to".into())),
        };

        {
            let inner = &self.inner;
            poll_fn(|cx| lock(inner).poll_drain(cx)).await?;
        }

        // any Body handed out for this request is now stale.
        lock(&self.inner).seq += 1;

        let (mut parts, body) = res.into_parts();
        parts.version = req.version;

        let status = parts.status;

        // https://tools.ietf.org/html/rfc7230#page-31
        // any response with a 1xx (Informational), 204 (No Content), or
        // 304 (Not Modified) status code, and any response to a HEAD request,
        // cannot contain a message body.
        let no_body = req.is_head
            || status.is_informational()
            || status == http::StatusCode::NO_CONTENT
            || status == http::StatusCode::NOT_MODIFIED;

        let is_stream = matches!(body, ResponseBody::Stream(_));

        let wants_close = !allow_reuse(&parts.headers, http::Version::HTTP_11);

        let chunked = is_stream && !no_body && req.version == http::Version::HTTP_11;

        let must_close = !req.reusable || wants_close || (is_stream && !no_body && !chunked);

        let headers = &mut parts.headers;
        headers.remove("connection");
        headers.remove("transfer-encoding");

        match &body {
            ResponseBody::Bytes(b) => {
                if !headers.contains_key("content-length") {
                    headers.insert("content-length", b.len().into());
                }
            }
            ResponseBody::Stream(_) => {
                headers.remove("content-length");
                if chunked {
                    headers.insert("transfer-encoding", http::HeaderValue::from_static("chunked"));
                }
            }
        }

        if must_close {
            headers.insert("connection", http::HeaderValue::from_static("close"));
        } else if req.version == http::Version::HTTP_10 {
            headers.insert("connection", http::HeaderValue::from_static("keep-alive"));
        }

        let head = http::Response::from_parts(parts, ());

        let mut buf = Vec::with_capacity(1024);
        write_http1x_res(&head, &mut buf)?;

        trace!("Send response: {:?}", head);

        self.write_all(&buf).await?;

        if !no_body {
            match body {
                ResponseBody::Bytes(b) => self.write_all(&b).await?,
                ResponseBody::Stream(mut s) => {
                    while let Some(chunk) = s.next().await {
                        let chunk = chunk?;
                        if chunk.is_empty() {
                            continue;
                        }
                        if chunked {
                            let mut framed = format!("{:x}\r\n", chunk.len()).into_bytes();
                            framed.extend_from_slice(&chunk);
                            framed.extend_from_slice(b"\r\n");
                            self.write_all(&framed).await?;
                        } else {
                            self.write_all(&chunk).await?;
                        }
                    }
                    if chunked {
                        self.write_all(b"0\r\n\r\n").await?;
                    }
                }
            }
        }

        {
            let inner = &self.inner;
            poll_fn(|cx| lock(inner).io.poll_flush(cx)).await?;
        }

        trace!("Connection is reusable: {}", !must_close);

        if must_close {
            self.close().await;
        } else {
            lock(&self.inner).state = State::Waiting;
        }

        Ok(())
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let inner = &self.inner;
        let mut pos = 0;
        poll_fn(|cx| lock(inner).io.poll_write_all(cx, buf, &mut pos)).await
    }

    /// Close the transport. Further calls to [`accept`] return `None`.
    ///
    /// [`accept`]: Connection::accept
    pub async fn close(&mut self) {
        lock(&self.inner).state = State::Closed;

        let inner = &self.inner;
        if let Err(e) = poll_fn(|cx| lock(inner).io.poll_close(cx)).await {
            trace!("Close transport: {}", e);
        }
    }

    /// Tells whether the connection was closed, by either side.
    pub fn is_closed(&self) -> bool {
        matches!(lock(&self.inner).state, State::Closed)
    }
}

pub(crate) struct Codec {
    io: BufIo<Box<dyn Io>>,
    state: State,
    limit: LimitRead,
    /// Bumped when a response is sent, invalidating the request's Body.
    seq: u64,
    /// How far the read buffer was scanned for the end of a request head.
    scanned: usize,
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the next request.
    Waiting,
    /// Request accepted, waiting for its response.
    Respond(ReqInfo),
    /// Closed
    Closed,
}

/// What sending the response needs to know about the request.
#[derive(Debug, Clone, Copy)]
struct ReqInfo {
    version: http::Version,
    is_head: bool,
    reusable: bool,
}

pub(crate) fn lock(inner: &Mutex<Codec>) -> MutexGuard<'_, Codec> {
    // a panicking handler must not take the connection down with it.
    inner.lock().unwrap_or_else(|p| p.into_inner())
}

impl Codec {
    fn new<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(io: S) -> Self {
        Codec {
            io: BufIo::with_capacity(READ_BUF_INIT_SIZE, Box::new(io)),
            state: State::Waiting,
            limit: LimitRead::NoBody,
            seq: 0,
            scanned: 0,
        }
    }

    fn poll_accept(
        &mut self,
        cx: &mut Context<'_>,
        inner: &Arc<Mutex<Codec>>,
    ) -> Poll<Option<Result<(http::Request<()>, Body), Error>>> {
        trace!("poll_accept: {:?}", self.state);

        match self.state {
            State::Closed => return None.into(),
            State::Respond(_) => {
                return Some(Err(Error::User(
                    "Previous request has no response".into(),
                )))
                .into();
            }
            State::Waiting => {}
        }

        let ret = ready!(self.poll_next_req(cx));

        match ret {
            Ok(Some(req)) => {
                let body = Body::new(inner.clone(), self.seq, self.limit.body_size());
                Some(Ok((req, body))).into()
            }
            Ok(None) => {
                self.state = State::Closed;
                None.into()
            }
            Err(e) => {
                debug!("Failed to read request: {}", e);
                self.state = State::Closed;
                Some(Err(e)).into()
            }
        }
    }

    fn poll_next_req(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<http::Request<()>>, Error>> {
        let len = match ready!(poll_for_crlfcrlf(cx, &mut self.io, &mut self.scanned))? {
            Some(len) => len,
            None => return Ok(None).into(),
        };

        let (req, size) = match try_parse_req(&self.io.buffered()[..len])? {
            Some(v) => v,
            None => return Err(Error::User("Incomplete request head".into())).into(),
        };

        self.io.consume(size);

        // Limiter to read the correct body amount from the socket.
        self.limit = LimitRead::from_headers(req.headers())?;

        self.state = State::Respond(ReqInfo {
            version: req.version(),
            is_head: req.method() == http::Method::HEAD,
            reusable: allow_reuse(req.headers(), req.version()),
        });

        Ok(Some(req)).into()
    }

    /// Read body data for the Body handle issued under `seq`.
    pub(crate) fn poll_body(
        &mut self,
        cx: &mut Context<'_>,
        seq: u64,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        if seq != self.seq || !matches!(self.state, State::Respond(_)) {
            return Err(closed_err()).into();
        }

        self.limit.poll_read(cx, &mut self.io, buf)
    }

    /// Read and discard what is left of the request body.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut scratch = [0; DRAIN_CHUNK];

        loop {
            if self.limit.is_complete() {
                return Ok(()).into();
            }

            let amount = ready!(self.limit.poll_read(cx, &mut self.io, &mut scratch[..]))?;
            trace!("Drained request body: {}", amount);

            if amount == 0 {
                return Ok(()).into();
            }
        }
    }
}

/// Whether the peer allows the connection to serve another request.
///
/// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close.
pub(crate) fn allow_reuse(headers: &http::HeaderMap, version: http::Version) -> bool {
    is_keep_alive(headers, version == http::Version::HTTP_11)
}

fn is_keep_alive(headers: &http::HeaderMap, default: bool) -> bool {
    headers
        .get("connection")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            let h = h.trim();
            if h.eq_ignore_ascii_case("keep-alive") {
                Some(true)
            } else if h.eq_ignore_ascii_case("close") {
                Some(false)
            } else {
                None
            }
        })
        .unwrap_or(default)
}

// ***************** Boiler plate to hide IO behind a Box<dyn trait> ***************

trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<S> Io for S where S: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection")
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Bytes(b) => write!(f, "Bytes({})", b.len()),
            ResponseBody::Stream(_) => write!(f, "Stream"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> http::HeaderMap {
        let mut h = http::HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, http::HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn reuse_defaults_by_version() {
        let none = headers(&[]);
        assert!(allow_reuse(&none, http::Version::HTTP_11));
        assert!(!allow_reuse(&none, http::Version::HTTP_10));
    }

    #[test]
    fn reuse_by_connection_header() {
        let close = headers(&[("connection", "Close")]);
        assert!(!allow_reuse(&close, http::Version::HTTP_11));

        let keep = headers(&[("connection", "keep-alive")]);
        assert!(allow_reuse(&keep, http::Version::HTTP_10));

        let other = headers(&[("connection", "upgrade")]);
        assert!(allow_reuse(&other, http::Version::HTTP_11));
    }
}

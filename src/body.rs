use crate::buf_reader::BufIo;
use crate::server::{lock, Codec};
use crate::AsyncRead;
use crate::Error;
use futures_util::future::poll_fn;
use futures_util::ready;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// Size of each read when reading a whole body.
const READ_CHUNK: usize = 16_384;

/// Longest chunk-size or trailer line accepted.
const MAX_LINE: usize = 4096;

/// Limit reading a request body given the request headers.
pub(crate) enum LimitRead {
    /// Body is chunked, the decoder knows when it ends.
    ChunkedDecoder(ChunkedDecoder),
    /// Body data is limited by a `content-length` header.
    ContentLength(ContentLengthRead),
    /// No expected body.
    NoBody,
}

impl LimitRead {
    /// Create an instance from request headers.
    ///
    /// 1. If header `content-length: <number>` use a reader limited by length.
    /// 2. If header `transfer-encoding: chunked` use the chunked decoder.
    /// 3. Otherwise there is no body.
    pub fn from_headers(headers: &http::HeaderMap) -> Result<Self, Error> {
        let chunked = is_chunked(headers);

        let ret = if let Some(v) = headers.get("content-length") {
            if chunked {
                warn!("Request has both content-length and transfer-encoding: chunked");
            }
            let size = v
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| Error::User(format!("Invalid content-length: {:?}", v)))?;
            LimitRead::ContentLength(ContentLengthRead::new(size))
        } else if chunked {
            LimitRead::ChunkedDecoder(ChunkedDecoder::new())
        } else {
            LimitRead::NoBody
        };

        trace!("LimitRead from headers: {:?}", ret);

        Ok(ret)
    }

    pub fn is_complete(&self) -> bool {
        match self {
            LimitRead::ChunkedDecoder(v) => v.is_end(),
            LimitRead::ContentLength(v) => v.is_end(),
            LimitRead::NoBody => true,
        }
    }

    pub fn body_size(&self) -> Option<u64> {
        match self {
            LimitRead::ContentLength(v) => Some(v.limit),
            LimitRead::NoBody => Some(0),
            LimitRead::ChunkedDecoder(_) => None,
        }
    }

    /// Try read some data. `Ok(0)` is the end of the body.
    pub fn poll_read<S: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut BufIo<S>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self {
            LimitRead::ChunkedDecoder(v) => v.poll_read(cx, recv, buf),
            LimitRead::ContentLength(v) => v.poll_read(cx, recv, buf),
            LimitRead::NoBody => Ok(0).into(),
        }
    }
}

/// Reader limited by a set length.
#[derive(Debug)]
pub(crate) struct ContentLengthRead {
    limit: u64,
    total: u64,
}

impl ContentLengthRead {
    fn new(limit: u64) -> Self {
        ContentLengthRead { limit, total: 0 }
    }

    fn is_end(&self) -> bool {
        self.total == self.limit
    }

    fn poll_read<S: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut BufIo<S>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        assert!(!buf.is_empty(), "poll_read with len 0 buf");

        let left = (self.limit - self.total).min(usize::max_value() as u64) as usize;

        if left == 0 {
            // Nothing more should be read.
            return Ok(0).into();
        }

        let max = buf.len().min(left);
        let amount = ready!(recv.poll_read_buf(cx, &mut buf[0..max]))?;

        if amount == 0 {
            // https://tools.ietf.org/html/rfc7230#page-32
            // If the sender closes the connection or the recipient times out
            // before the indicated number of octets are received, the
            // recipient MUST consider the message to be incomplete and close
            // the connection.
            let msg = format!(
                "Partial body received {} bytes and expected {}",
                self.total, self.limit
            );
            trace!("{}", msg);
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg)).into();
        }
        self.total += amount as u64;

        Ok(amount).into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Expecting a hex chunk-size line.
    Size,
    /// Inside chunk data, this much left.
    Data(u64),
    /// Expecting the CRLF that ends chunk data.
    DataEnd,
    /// After the zero-size chunk, skipping trailer fields until a blank line.
    Trailer,
    End,
}

/// Decoder of `transfer-encoding: chunked`.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
}

impl ChunkedDecoder {
    fn new() -> Self {
        ChunkedDecoder {
            state: ChunkState::Size,
        }
    }

    fn is_end(&self) -> bool {
        self.state == ChunkState::End
    }

    fn poll_read<S: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut BufIo<S>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        assert!(!buf.is_empty(), "poll_read with len 0 buf");

        loop {
            match self.state {
                ChunkState::Size => {
                    let line = ready!(poll_line(cx, recv))?;
                    let size = parse_chunk_size(&line)?;
                    trace!("Chunk size: {}", size);
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }

                ChunkState::Data(left) => {
                    let max = buf.len().min(left.min(usize::max_value() as u64) as usize);
                    let amount = ready!(recv.poll_read_buf(cx, &mut buf[0..max]))?;

                    if amount == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "EOF inside chunk data",
                        ))
                        .into();
                    }

                    let left = left - amount as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };

                    return Ok(amount).into();
                }

                ChunkState::DataEnd => {
                    let line = ready!(poll_line(cx, recv))?;
                    if !line.is_empty() {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, "Malformed chunk"))
                            .into();
                    }
                    self.state = ChunkState::Size;
                }

                ChunkState::Trailer => {
                    let line = ready!(poll_line(cx, recv))?;
                    if line.is_empty() {
                        self.state = ChunkState::End;
                    } else {
                        trace!("Ignoring chunked trailer: {:?}", String::from_utf8_lossy(&line));
                    }
                }

                ChunkState::End => return Ok(0).into(),
            }
        }
    }
}

/// Read one CRLF terminated line from the buffer, without the CRLF.
fn poll_line<S: AsyncRead + Unpin>(cx: &mut Context, recv: &mut BufIo<S>) -> Poll<io::Result<Vec<u8>>> {
    let mut scanned = 0;

    loop {
        let buf = recv.buffered();

        if let Some(idx) = buf[scanned..].iter().position(|c| *c == b'\n') {
            let end = scanned + idx;

            if end == 0 || buf[end - 1] != b'\r' {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "Chunk line without CRLF"))
                    .into();
            }

            let line = buf[..end - 1].to_vec();
            recv.consume(end + 1);

            return Ok(line).into();
        }

        if buf.len() > MAX_LINE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Chunk line too long")).into();
        }

        scanned = buf.len();

        let amount = ready!(recv.poll_fill_buf(cx))?;

        if amount == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF in chunked body",
            ))
            .into();
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    // chunk extensions after ';' are ignored.
    let hex = line.split(|c| *c == b';').next().unwrap_or(line);
    let hex = std::str::from_utf8(hex)
        .map(str::trim)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Chunk size not utf-8"))?;

    u64::from_str_radix(hex, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Chunk size not hex: {:?}", hex),
        )
    })
}

fn is_chunked(headers: &http::HeaderMap) -> bool {
    headers
        .get("transfer-encoding")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

/// Request body handed to a handler.
///
/// Reads come straight off the connection, framed by `content-length` or
/// chunked encoding. Nothing is buffered beyond what the framing needs.
/// Whatever the handler leaves unread is drained before the response is
/// written, so the connection stays usable for the next request.
pub struct Body {
    inner: Arc<Mutex<Codec>>,
    seq: u64,
    size: Option<u64>,
    closed: bool,
}

impl Body {
    pub(crate) fn new(inner: Arc<Mutex<Codec>>, seq: u64, size: Option<u64>) -> Self {
        Body {
            inner,
            seq,
            size,
            closed: false,
        }
    }

    /// Declared size, `None` for a chunked body.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read at most `max` bytes. An empty vec is the end of the body.
    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        if self.closed {
            return Err(closed_err().into());
        }

        if max == 0 {
            return Ok(vec![]);
        }

        let mut buf = vec![0; max];
        let amount = poll_fn(|cx| Pin::new(&mut *self).poll_read(cx, &mut buf[..])).await?;
        buf.truncate(amount);

        Ok(buf)
    }

    /// Read the rest of the body.
    pub async fn read_all(&mut self) -> Result<Vec<u8>, Error> {
        let mut all = Vec::with_capacity(self.size.unwrap_or(0).min(READ_CHUNK as u64) as usize);

        loop {
            let more = self.read(READ_CHUNK).await?;
            if more.is_empty() {
                return Ok(all);
            }
            all.extend_from_slice(&more);
        }
    }

    /// Read the rest of the body into a string, failing on invalid utf-8.
    pub async fn read_to_string(&mut self) -> Result<String, Error> {
        let all = self.read_all().await?;
        String::from_utf8(all).map_err(|e| Error::User(format!("Body is not utf-8: {}", e)))
    }

    /// Drain what is left of the body and close it. Calling it again does
    /// nothing.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }

        let mut scratch = vec![0; READ_CHUNK];
        let ret = loop {
            match poll_fn(|cx| Pin::new(&mut *self).poll_read(cx, &mut scratch[..])).await {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                // the response went out already and the body was drained with it.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };

        self.closed = true;

        ret
    }
}

impl AsyncRead for Body {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.closed {
            return Err(closed_err()).into();
        }

        if buf.is_empty() {
            return Ok(0).into();
        }

        lock(&this.inner).poll_body(cx, this.seq, buf)
    }
}

pub(crate) fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "Operation on closed stream")
}

impl fmt::Debug for LimitRead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LimitRead::ChunkedDecoder(_) => write!(f, "ChunkedDecoder"),
            LimitRead::ContentLength(l) => write!(f, "ContentLength({})", l.limit),
            LimitRead::NoBody => write!(f, "NoBody"),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Body(size: {:?}, closed: {})", self.size, self.closed)
    }
}

use crate::buf_reader::BufIo;
use crate::AsyncRead;
use crate::Error;
use futures_util::ready;
use http::header::{HeaderName, HeaderValue};
use std::io;
use std::io::Write;
use std::task::{Context, Poll};

/// Largest request head accepted, request line and headers together.
pub const MAX_HEAD_SIZE: usize = 65_536;

/// Max number of headers in one request.
const MAX_HEADERS: usize = 128;

const END_OF_HEADER: &[u8] = b"\r\n\r\n";

/// Reason phrase used in the status line.
pub fn reason_phrase(status: http::StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("Unknown")
}

/// Write an http/1.x response head to a buffer.
#[allow(clippy::write_with_newline)]
pub fn write_http1x_res(res: &http::Response<()>, buf: &mut Vec<u8>) -> Result<(), Error> {
    let ver = match res.version() {
        http::Version::HTTP_10 => "1.0",
        http::Version::HTTP_11 => "1.1",
        v => return Err(Error::User(format!("Unsupported http version: {:?}", v))),
    };

    let start = buf.len();

    write!(
        buf,
        "HTTP/{} {} {}\r\n",
        ver,
        res.status().as_u16(),
        reason_phrase(res.status())
    )?;

    // multi-valued headers go out as repeated lines.
    for (name, value) in res.headers() {
        write!(buf, "{}: ", name)?;
        buf.write_all(value.as_bytes())?;
        write!(buf, "\r\n")?;
    }
    write!(buf, "\r\n")?;

    debug!(
        "write_http1x_res: {:?}",
        String::from_utf8_lossy(&buf[start..])
    );

    Ok(())
}

/// Attempt to parse an http/1.x request head.
///
/// `Ok(None)` means more bytes are needed.
pub fn try_parse_req(buf: &[u8]) -> Result<Option<(http::Request<()>, usize)>, Error> {
    trace!("try_parse_req: {:?}", String::from_utf8_lossy(buf));

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parser = httparse::Request::new(&mut headers);

    let status = parser.parse(buf)?;

    let len = match status {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let version = match parser.version {
        Some(1) => http::Version::HTTP_11,
        _ => http::Version::HTTP_10,
    };

    let uri = http::Uri::builder()
        .path_and_query(parser.path.unwrap_or("/"))
        .build()?;

    let mut bld = http::Request::builder().version(version).uri(uri);

    if let Some(method) = parser.method {
        bld = bld.method(method);
    }

    for head in parser.headers.iter() {
        let name = HeaderName::from_bytes(head.name.as_bytes());
        let value = HeaderValue::from_bytes(head.value);
        match (name, value) {
            (Ok(name), Ok(value)) => bld = bld.header(name, value),
            (Err(e), _) => {
                debug!("Dropping bad header name: {}", e);
            }
            (Ok(name), Err(e)) => {
                debug!("Dropping bad header value ({}): {}", name, e);
            }
        }
    }

    let built = bld.body(())?;

    debug!("try_parse_req success: {:?}", built);

    Ok(Some((built, len)))
}

/// Poll until the buffer holds a complete request head.
///
/// `Ready(Ok(Some(len)))` is the head length including the final `\r\n\r\n`.
/// `Ready(Ok(None))` is a clean EOF before any byte of a new request. `scanned`
/// carries how far the buffer was searched between polls.
pub fn poll_for_crlfcrlf<S>(
    cx: &mut Context<'_>,
    io: &mut BufIo<S>,
    scanned: &mut usize,
) -> Poll<io::Result<Option<usize>>>
where
    S: AsyncRead + Unpin,
{
    loop {
        // https://tools.ietf.org/html/rfc7230#section-3.5
        // a server SHOULD ignore at least one empty line (CRLF) received
        // prior to the request-line.
        while *scanned == 0 && io.buffered().starts_with(b"\r\n") {
            io.consume(2);
        }

        let buf = io.buffered();

        let from = (*scanned).min(buf.len());
        if let Some(idx) = buf[from..]
            .windows(END_OF_HEADER.len())
            .position(|w| w == END_OF_HEADER)
        {
            let len = from + idx + END_OF_HEADER.len();
            *scanned = 0;
            return Ok(Some(len)).into();
        }

        if buf.len() > MAX_HEAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Request head larger than {} bytes", MAX_HEAD_SIZE),
            ))
            .into();
        }

        // the terminator may straddle the next read.
        *scanned = buf.len().saturating_sub(END_OF_HEADER.len() - 1);
        let was_empty = buf.is_empty();

        let amount = ready!(io.poll_fill_buf(cx))?;

        if amount == 0 {
            if was_empty {
                trace!("Connection closed between requests");
                return Ok(None).into();
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF before complete http11 header",
            ))
            .into();
        }
    }
}

use crate::{AsyncRead, AsyncWrite};
use futures_util::ready;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Amount to try reading from the transport in one go.
const READ_CHUNK: usize = 16_384;

#[derive(Debug)]
/// Buffered duplex over the raw transport.
///
/// Reads happen ahead into an internal buffer that the framer scans for request
/// heads and chunk-size lines. Bytes past a head stay buffered and are handed to
/// the body reader first, before reading the transport again. Writes go
/// straight through to the transport.
pub struct BufIo<S> {
    inner: S,
    buf: Vec<u8>,
    pos: usize,
}

impl<S> BufIo<S> {
    pub fn with_capacity(capacity: usize, inner: S) -> Self {
        BufIo {
            inner,
            buf: Vec::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Bytes read from the transport but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Mark `amount` of the buffered bytes as used.
    pub fn consume(&mut self, amount: usize) {
        let new_pos = self.pos + amount;

        // can't consume more than we have.
        assert!(new_pos <= self.buf.len());

        if new_pos == self.buf.len() {
            self.pos = 0;
            self.buf.clear();
        } else {
            self.pos = new_pos;
        }
    }
}

impl<S> BufIo<S>
where
    S: AsyncRead + Unpin,
{
    /// Read more from the transport and append it to the buffered bytes.
    ///
    /// `Ready(Ok(0))` is EOF.
    pub fn poll_fill_buf(&mut self, cx: &mut Context) -> Poll<io::Result<usize>> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }

        let cur_len = self.buf.len();
        self.buf.resize(cur_len + READ_CHUNK, 0);

        match Pin::new(&mut self.inner).poll_read(cx, &mut self.buf[cur_len..]) {
            Poll::Pending => {
                trace!("poll_fill_buf: Pending");
                self.buf.truncate(cur_len);
                Poll::Pending
            }
            Poll::Ready(Err(e)) => {
                trace!("poll_fill_buf err: {:?}", e);
                self.buf.truncate(cur_len);
                Err(e).into()
            }
            Poll::Ready(Ok(amount)) => {
                trace!("poll_fill_buf amount: {}", amount);
                self.buf.truncate(cur_len + amount);
                Ok(amount).into()
            }
        }
    }

    /// Read into `buf`, serving buffered bytes before touching the transport.
    pub fn poll_read_buf(&mut self, cx: &mut Context, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let has_amount = self.buf.len() - self.pos;

        if has_amount > 0 {
            let max = buf.len().min(has_amount);
            trace!("poll_read_buf from buffer: {}", max);

            buf[0..max].copy_from_slice(&self.buf[self.pos..self.pos + max]);
            self.consume(max);

            return Ok(max).into();
        }

        // once inner buffer is used up, read directly from underlying.
        let r = ready!(Pin::new(&mut self.inner).poll_read(cx, buf));
        trace!("poll_read_buf: {:?}", r);
        r.into()
    }
}

impl<S> BufIo<S>
where
    S: AsyncWrite + Unpin,
{
    /// Write `buf[*pos..]` entirely, advancing `pos` as the transport accepts bytes.
    ///
    /// On `Pending` the transport is full. Call again with the same `pos` to
    /// continue where it left off.
    pub fn poll_write_all(
        &mut self,
        cx: &mut Context,
        buf: &[u8],
        pos: &mut usize,
    ) -> Poll<io::Result<()>> {
        while *pos < buf.len() {
            let amount = ready!(Pin::new(&mut self.inner).poll_write(cx, &buf[*pos..]))?;
            trace!("poll_write_all sent: {}", amount);

            if amount == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "Transport accepted no bytes",
                ))
                .into();
            }

            *pos += amount;
        }

        Ok(()).into()
    }

    pub fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    pub fn poll_close(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

// ***********  BOILERPLATE BELOW ******************************

impl<S> AsyncRead for BufIo<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().poll_read_buf(cx, buf)
    }
}

impl<S> AsyncWrite for BufIo<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        BufIo::poll_flush(self.get_mut(), cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        BufIo::poll_close(self.get_mut(), cx)
    }
}

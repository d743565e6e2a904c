#![no_main]
use libfuzzer_sys::fuzz_target;

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_std::io::Cursor;
use futures_io::{AsyncRead, AsyncWrite};

use fdk_h1::{Body, Config, Dispatcher, HandlerError, InvokeContext, Reply};

#[derive(Clone, Debug)]
struct RwWrapper(Arc<Mutex<Cursor<Vec<u8>>>>);

impl RwWrapper {
    fn new(input: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(Cursor::new(input))))
    }
}

impl AsyncRead for RwWrapper {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.0.lock().unwrap()).poll_read(cx, buf)
    }
}

impl AsyncWrite for RwWrapper {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn echo(_ctx: InvokeContext, mut body: Body) -> Result<Reply, HandlerError> {
    Ok(Reply::pending(async move { Ok(body.read_all().await?.into()) }))
}

fuzz_target!(|data: &[u8]| {
    let stream = RwWrapper::new(data.to_vec());

    let config = Config::from_vars(vec![
        ("FN_FORMAT", "http-stream"),
        ("FN_LISTENER", "unix:/tmp/fdk-fuzz.sock"),
    ])
    .unwrap();

    let dispatcher = Dispatcher::new(config, echo);

    async_std::task::block_on(async move {
        let _ = dispatcher.serve_connection(stream).await;
    });
});

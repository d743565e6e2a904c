#![allow(dead_code)]

use async_std::os::unix::net::UnixStream;
use async_std::task::JoinHandle;
use fdk_h1::buf_reader::BufIo;
use fdk_h1::server::{self, Connection};
use fdk_h1::{Config, Dispatcher, Error, Handler};
use futures_util::future::poll_fn;
use futures_util::{AsyncReadExt, AsyncWriteExt};
use std::future::Future;
use std::io;
use std::sync::Once;

pub type Client = BufIo<UnixStream>;

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);
        let level = if test_log {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module("fdk_h1", level)
            .target(env_logger::Target::Stdout)
            .init();
    });
}

pub fn test_config() -> Config {
    config_with(&[])
}

/// Test config with `extra` variables on top.
pub fn config_with(extra: &[(&str, &str)]) -> Config {
    let mut vars = vec![
        ("FN_FORMAT", "http-stream"),
        ("FN_LISTENER", "unix:/tmp/fdk-h1-test.sock"),
        ("FN_APP_NAME", "testapp"),
        ("FN_FN_NAME", "testfn"),
    ];
    vars.extend_from_slice(extra);
    Config::from_vars(vars).expect("test config")
}

/// Serve `handler` over one end of a socket pair, returning the other end.
pub fn serve<H: Handler>(handler: H) -> Result<(Client, JoinHandle<Result<(), Error>>), Error> {
    serve_with(test_config(), handler)
}

pub fn serve_with<H: Handler>(
    config: Config,
    handler: H,
) -> Result<(Client, JoinHandle<Result<(), Error>>), Error> {
    setup_logger();

    let (client, server) = UnixStream::pair()?;
    let dispatcher = Dispatcher::new(config, handler);

    let join = async_std::task::spawn(async move { dispatcher.serve_connection(server).await });

    Ok((BufIo::with_capacity(8192, client), join))
}

/// Run `f` with the server side of a bare connection, no dispatcher.
pub fn serve_raw<F, R>(f: F) -> Result<(Client, JoinHandle<Result<(), Error>>), Error>
where
    F: FnOnce(Connection) -> R + Send + 'static,
    R: Future<Output = Result<(), Error>> + Send + 'static,
{
    setup_logger();

    let (client, server) = UnixStream::pair()?;

    let join = async_std::task::spawn(async move { f(server::handshake(server)).await });

    Ok((BufIo::with_capacity(8192, client), join))
}

/// A response as read off the wire.
#[derive(Debug)]
pub struct TestResponse {
    pub head: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).expect("utf-8 body")
    }
}

pub async fn send(client: &mut Client, req: &[u8]) -> Result<(), Error> {
    client.write_all(req).await?;
    client.flush().await?;
    Ok(())
}

/// Read one response head, `None` if the server closed instead.
pub async fn read_header(client: &mut Client) -> Result<Option<String>, Error> {
    let mut scanned = 0;
    let len = poll_fn(|cx| fdk_h1::http11::poll_for_crlfcrlf(cx, client, &mut scanned)).await?;

    Ok(len.map(|len| {
        let head = String::from_utf8_lossy(&client.buffered()[..len]).into_owned();
        client.consume(len);
        head
    }))
}

/// Read one complete response, following its framing.
pub async fn read_response(client: &mut Client) -> Result<TestResponse, Error> {
    let head = read_header(client)
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "No response"))?;

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");

    let headers: Vec<(String, String)> = lines
        .filter(|l| !l.is_empty())
        .map(|l| {
            let mut kv = l.splitn(2, ':');
            let k = kv.next().unwrap_or_default().trim().to_string();
            let v = kv.next().unwrap_or_default().trim().to_string();
            (k, v)
        })
        .collect();

    let mut res = TestResponse {
        head,
        status,
        headers,
        body: vec![],
    };

    if let Some(len) = res.header("content-length") {
        let len: usize = len.parse().expect("content-length");
        let mut body = vec![0; len];
        client.read_exact(&mut body).await?;
        res.body = body;
    } else if res.header("transfer-encoding") == Some("chunked") {
        res.body = read_chunked(client).await?;
    } else {
        client.read_to_end(&mut res.body).await?;
    }

    Ok(res)
}

async fn read_chunked(client: &mut Client) -> Result<Vec<u8>, Error> {
    let mut body = vec![];

    loop {
        let line = read_line(client).await?;
        let size = usize::from_str_radix(line.trim(), 16).expect("chunk size");

        if size == 0 {
            assert_eq!(read_line(client).await?, "");
            return Ok(body);
        }

        let mut chunk = vec![0; size];
        client.read_exact(&mut chunk).await?;
        body.extend_from_slice(&chunk);

        assert_eq!(read_line(client).await?, "");
    }
}

async fn read_line(client: &mut Client) -> Result<String, Error> {
    let mut line = vec![];
    let mut byte = [0; 1];

    loop {
        client.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }

    assert_eq!(line.pop(), Some(b'\r'));

    Ok(String::from_utf8(line).expect("utf-8 line"))
}

/// True once the server closed its end.
pub async fn is_closed(client: &mut Client) -> Result<bool, Error> {
    let mut buf = [0; 1];
    Ok(client.read(&mut buf).await? == 0)
}

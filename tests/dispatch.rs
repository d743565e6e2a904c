use chrono::Utc;
use fdk_h1::{Body, Error, FnResponse, HandlerError, InvokeContext, Reply};
use std::time::{Duration, Instant};

mod common;

fn hello_json(_ctx: InvokeContext, mut body: Body) -> Result<Reply, HandlerError> {
    Ok(Reply::pending(async move {
        let data = body.read_all().await?;
        let v: serde_json::Value = serde_json::from_slice(&data)?;
        let name = v["name"].as_str().unwrap_or("World");
        Ok(format!("Hello {}", name).into())
    }))
}

/// Pin down the closure signature.
fn handler<F>(f: F) -> F
where
    F: Fn(InvokeContext, Body) -> Result<Reply, HandlerError> + Send + Sync + 'static,
{
    f
}

fn deadline_in(secs: i64) -> String {
    (Utc::now() + chrono::Duration::seconds(secs)).to_rfc3339()
}

fn call(body: &str, extra: &[(&str, &str)]) -> Vec<u8> {
    let mut req = format!(
        "POST /call HTTP/1.1\r\nfn-call-id: 01TEST\r\ncontent-type: application/json\r\n\
         content-length: {}\r\n",
        body.len()
    );
    for (k, v) in extra {
        req.push_str(&format!("{}: {}\r\n", k, v));
    }
    req.push_str("\r\n");
    req.push_str(body);
    req.into_bytes()
}

#[async_std::test]
async fn hello_john() -> Result<(), Error> {
    let (mut client, _) = common::serve(hello_json)?;

    common::send(&mut client, &call(r#"{"name":"John"}"#, &[])).await?;

    let res = common::read_response(&mut client).await?;
    assert_eq!(res.status, 200);
    assert_eq!(res.header("fn-http-status"), Some("200"));
    assert_eq!(res.header("content-type"), Some("text/plain"));
    assert_eq!(res.header("fn-fdk-runtime"), Some("rust"));
    assert!(res.header("fn-fdk-version").unwrap().starts_with("fdk-rust/"));
    assert_eq!(res.body_str(), "Hello John");

    Ok(())
}

#[async_std::test]
async fn handler_status_is_encapsulated() -> Result<(), Error> {
    let (mut client, _) = common::serve(handler(|_ctx, _body| {
        Ok(FnResponse::new("nope")
            .with_status(404)
            .with_header("X-Reason", "missing")
            .into())
    }))?;

    common::send(&mut client, &call("", &[])).await?;

    let res = common::read_response(&mut client).await?;
    assert_eq!(res.status, 200);
    assert_eq!(res.header("fn-http-status"), Some("404"));
    assert_eq!(res.header("fn-http-h-x-reason"), Some("missing"));
    assert_eq!(res.body_str(), "nope");

    Ok(())
}

#[async_std::test]
async fn handler_error_is_502() -> Result<(), Error> {
    let (mut client, _) = common::serve(handler(|_ctx, _body| {
        Err("something broke".into())
    }))?;

    common::send(&mut client, &call("", &[])).await?;

    let res = common::read_response(&mut client).await?;
    assert_eq!(res.status, 502);
    assert_eq!(res.header("fn-http-status"), Some("502"));
    assert!(res.body_str().contains("something broke"));

    Ok(())
}

#[async_std::test]
async fn async_handler_error_is_502() -> Result<(), Error> {
    let (mut client, _) = common::serve(handler(|_ctx, _body| {
        Ok(Reply::pending(async { Err("later".into()) }))
    }))?;

    common::send(&mut client, &call("", &[])).await?;

    let res = common::read_response(&mut client).await?;
    assert_eq!(res.status, 502);
    assert!(res.body_str().contains("later"));

    Ok(())
}

#[async_std::test]
async fn handler_panic_is_502() -> Result<(), Error> {
    let (mut client, _) = common::serve(handler(|_ctx, _body| {
        panic!("handler exploded")
    }))?;

    common::send(&mut client, &call("", &[])).await?;

    let res = common::read_response(&mut client).await?;
    assert_eq!(res.status, 502);
    assert!(res.body_str().contains("handler exploded"));

    // the connection survives.
    common::send(&mut client, &call("", &[])).await?;
    assert_eq!(common::read_response(&mut client).await?.status, 502);

    Ok(())
}

#[async_std::test]
async fn slow_handler_is_504() -> Result<(), Error> {
    let (mut client, _) = common::serve(handler(|_ctx, _body| {
        Ok(Reply::pending(async {
            async_std::task::sleep(Duration::from_secs(10)).await;
            Ok("too late".into())
        }))
    }))?;

    let deadline = deadline_in(2);
    common::send(&mut client, &call("", &[("fn-deadline", &deadline)])).await?;

    let res = common::read_response(&mut client).await?;
    assert_eq!(res.status, 504);
    assert_eq!(res.header("fn-http-status"), Some("504"));
    assert!(res.body_str().contains("timed out"));

    Ok(())
}

#[async_std::test]
async fn blocking_handler_is_504() -> Result<(), Error> {
    let (mut client, _) = common::serve(handler(|_ctx, _body| {
        Ok(Reply::blocking(|| {
            std::thread::sleep(Duration::from_secs(4));
            Ok("too late")
        }))
    }))?;

    let deadline = deadline_in(2);
    common::send(&mut client, &call("", &[("fn-deadline", &deadline)])).await?;

    let res = common::read_response(&mut client).await?;
    assert_eq!(res.status, 504);

    Ok(())
}

#[async_std::test]
async fn sync_handler_is_504() -> Result<(), Error> {
    let (mut client, _) = common::serve(handler(|_ctx, _body| {
        std::thread::sleep(Duration::from_secs(4));
        Ok("too late".into())
    }))?;

    let deadline = deadline_in(2);
    let started = Instant::now();
    common::send(&mut client, &call("", &[("fn-deadline", &deadline)])).await?;

    let res = common::read_response(&mut client).await?;
    assert_eq!(res.status, 504);
    assert_eq!(res.header("fn-http-status"), Some("504"));
    assert!(started.elapsed() < Duration::from_secs(3));

    Ok(())
}

#[async_std::test]
async fn fast_handler_within_deadline() -> Result<(), Error> {
    let (mut client, _) = common::serve(handler(|_ctx, _body| {
        Ok(Reply::pending(async {
            async_std::task::sleep(Duration::from_millis(200)).await;
            Ok("in time".into())
        }))
    }))?;

    let deadline = deadline_in(5);
    common::send(&mut client, &call("", &[("fn-deadline", &deadline)])).await?;

    let res = common::read_response(&mut client).await?;
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "in time");

    Ok(())
}

#[async_std::test]
async fn missing_deadline_defaults_to_thirty_seconds() -> Result<(), Error> {
    let (mut client, _) = common::serve(handler(|ctx, _body| {
        let window = ctx.deadline().window().as_secs();
        Ok(window.to_string().into())
    }))?;

    common::send(&mut client, &call("", &[])).await?;

    let res = common::read_response(&mut client).await?;
    let window: u64 = res.body_str().parse().unwrap();
    assert!(window >= 28 && window <= 30, "window: {}", window);

    Ok(())
}

#[async_std::test]
async fn bad_deadline_is_500_without_invoking() -> Result<(), Error> {
    let (mut client, _) = common::serve(handler(|_ctx, _body| {
        panic!("must not be invoked")
    }))?;

    common::send(&mut client, &call("{}", &[("fn-deadline", "soon")])).await?;

    let res = common::read_response(&mut client).await?;
    assert_eq!(res.status, 200);
    assert_eq!(res.header("fn-http-status"), Some("500"));
    assert!(res.body_str().contains("deadline"));

    // unread body was drained, the connection is still usable.
    common::send(&mut client, &call("", &[("fn-deadline", "soon")])).await?;
    assert_eq!(common::read_response(&mut client).await?.header("fn-http-status"), Some("500"));

    Ok(())
}

#[async_std::test]
async fn context_headers_and_content_type() -> Result<(), Error> {
    let (mut client, _) = common::serve(handler(|ctx, _body| {
        assert_eq!(ctx.call_id(), "01TEST");
        assert!(ctx.is_gateway());
        assert_eq!(ctx.method(), "PUT");
        assert_eq!(ctx.request_url(), "http://example.com/r/app/fn?x=1");
        assert_eq!(ctx.http_headers().first("accept"), Some("text/html"));
        assert_eq!(ctx.headers().first("fn-call-id"), Some("01TEST"));

        ctx.set_response_header("Content-Type", "application/json");
        ctx.add_response_header("x-multi", vec!["a", "b"]);

        Ok(Reply::Value(br#"{"ok":true}"#.to_vec()))
    }))?;

    let extra = [
        ("fn-intent", "httprequest"),
        ("fn-http-method", "PUT"),
        ("fn-http-request-url", "http://example.com/r/app/fn?x=1"),
        ("fn-http-h-accept", "text/html"),
    ];
    common::send(&mut client, &call("", &extra)).await?;

    let res = common::read_response(&mut client).await?;
    assert_eq!(res.status, 200);
    assert_eq!(res.header("content-type"), Some("application/json"));
    assert_eq!(res.header_all("fn-http-h-x-multi"), vec!["a", "b"]);
    assert_eq!(res.body_str(), r#"{"ok":true}"#);

    Ok(())
}

#[async_std::test]
async fn response_content_type_overrides_context() -> Result<(), Error> {
    let (mut client, _) = common::serve(handler(|ctx, _body| {
        ctx.set_response_header("content-type", "application/json");
        Ok(FnResponse::new("<p>hi</p>")
            .with_content_type("text/html")
            .into())
    }))?;

    common::send(&mut client, &call("", &[])).await?;

    let res = common::read_response(&mut client).await?;
    assert_eq!(res.header("content-type"), Some("text/html"));

    Ok(())
}

#[async_std::test]
async fn malformed_request_never_reaches_handler() -> Result<(), Error> {
    let (mut client, join) = common::serve(handler(|_ctx, _body| {
        panic!("must not be invoked")
    }))?;

    common::send(&mut client, b"POST /call HTTP/1.1\r\nbroken header\r\n\r\n").await?;

    assert!(common::read_header(&mut client).await?.is_none());
    assert!(join.await.is_err());

    Ok(())
}

#[async_std::test]
async fn idle_close_ends_connection() -> Result<(), Error> {
    let (mut client, join) = common::serve(hello_json)?;

    common::send(&mut client, &call(r#"{"name":"A"}"#, &[])).await?;
    assert_eq!(common::read_response(&mut client).await?.body_str(), "Hello A");

    drop(client);
    join.await?;

    Ok(())
}

#[async_std::test]
async fn idle_connection_is_closed() -> Result<(), Error> {
    let config = common::config_with(&[("FDK_IDLE_TIMEOUT", "1")]);
    let (mut client, join) = common::serve_with(config, hello_json)?;

    common::send(&mut client, &call(r#"{"name":"B"}"#, &[])).await?;
    assert_eq!(common::read_response(&mut client).await?.body_str(), "Hello B");

    let started = Instant::now();
    assert!(common::is_closed(&mut client).await?);
    assert!(started.elapsed() < Duration::from_secs(3));

    join.await?;

    Ok(())
}

#[async_std::test]
async fn slow_head_is_not_idle() -> Result<(), Error> {
    let config = common::config_with(&[("FDK_IDLE_TIMEOUT", "1")]);
    let (mut client, _) = common::serve_with(config, hello_json)?;

    // first bytes arrive in time, the rest after the idle timeout.
    let req = call(r#"{"name":"C"}"#, &[]);
    common::send(&mut client, &req[..10]).await?;
    async_std::task::sleep(Duration::from_millis(1500)).await;
    common::send(&mut client, &req[10..]).await?;

    assert_eq!(common::read_response(&mut client).await?.body_str(), "Hello C");

    Ok(())
}

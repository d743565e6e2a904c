//! Runs one handler per request and turns the outcome into a wire response.

use crate::body::Body;
use crate::config::Config;
use crate::context::InvokeContext;
use crate::deadline::DeadlineGuard;
use crate::error::HandlerError;
use crate::handler::{panic_error, Handler, Reply};
use crate::header_set::HeaderSet;
use crate::headers::*;
use crate::server::{self, ResponseBody};
use crate::{AsyncRead, AsyncWrite, Error};
use chrono::Utc;
use futures_util::future::FutureExt;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Content type of a response that does not name one.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Sent in `fn-fdk-runtime`.
pub const RUNTIME: &str = "rust";

/// Drives connections, invoking the handler for each request.
pub struct Dispatcher<H> {
    handler: Arc<H>,
    config: Arc<Config>,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(config: Config, handler: H) -> Self {
        Dispatcher {
            handler: Arc::new(handler),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Serve requests on `io` one at a time until the peer goes away.
    ///
    /// A peer closing between requests ends the connection normally, as does
    /// sitting idle past [`Config::idle_timeout`]. A malformed request closes
    /// the connection without a response and is returned as the error.
    pub async fn serve_connection<S>(&self, io: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = server::handshake(io);

        // one invocation at a time per connection.
        let mut guard = DeadlineGuard::new();

        loop {
            if conn.is_closed() {
                break;
            }

            if let Some(idle) = self.config.idle_timeout() {
                if async_std::future::timeout(idle, conn.wait_for_request())
                    .await
                    .is_err()
                {
                    debug!("Closing connection idle for {:?}", idle);
                    conn.close().await;
                    break;
                }
            }

            let next = match conn.accept().await {
                Some(v) => v,
                None => break,
            };

            let (req, body) = match next {
                Ok(v) => v,
                Err(e) => {
                    if e.is_eof() {
                        debug!("Peer closed mid-request: {}", e);
                    } else {
                        warn!("Dropping connection on bad request: {}", e);
                    }
                    conn.close().await;
                    return Err(e);
                }
            };

            let res = self.dispatch(&mut guard, req, body).await;

            conn.send_response(res).await?;
        }

        trace!("Connection done");

        Ok(())
    }

    /// Build the context, invoke the handler under its deadline and build
    /// the wire response. Never fails, every failure becomes a response.
    pub async fn dispatch(
        &self,
        guard: &mut DeadlineGuard,
        req: http::Request<()>,
        body: Body,
    ) -> http::Response<ResponseBody> {
        let accepted_at = Utc::now();
        let (parts, _) = req.into_parts();

        let (ctx, outcome) = match InvokeContext::from_request(&parts, &self.config, accepted_at) {
            Ok(ctx) => {
                let outcome = self.invoke(guard, ctx.clone(), body).await;
                (ctx, outcome)
            }
            Err(e) => {
                warn!("Failed to build context for {} {}: {}", parts.method, parts.uri, e);
                (InvokeContext::empty(&self.config, accepted_at), Err(e))
            }
        };

        match outcome {
            Ok(reply) => {
                debug!("Call {:?} handled", ctx.call_id());
                build_response(&ctx, reply)
            }
            Err(e) => {
                if e.is_timeout() {
                    warn!("Call {:?}: {}", ctx.call_id(), e);
                } else {
                    error!("Call {:?} failed: {}", ctx.call_id(), e);
                }
                error_response(&e)
            }
        }
    }

    async fn invoke(
        &self,
        guard: &mut DeadlineGuard,
        ctx: InvokeContext,
        body: Body,
    ) -> Result<Reply, Error> {
        let deadline = *ctx.deadline();
        let handler = self.handler.clone();

        let call = async move {
            // user code may block its thread.
            let called = async_std::task::spawn_blocking(move || {
                match catch_unwind(AssertUnwindSafe(|| handler.call(ctx, body))) {
                    Ok(r) => r,
                    Err(p) => Err(panic_error(p)),
                }
            });

            let reply = called.await?;

            match AssertUnwindSafe(reply.resolve()).catch_unwind().await {
                Ok(r) => r,
                Err(p) => Err(panic_error(p)),
            }
        };

        let ret: Result<Reply, HandlerError> = guard.run(&deadline, call).await?;

        ret.map_err(Error::Handler)
    }
}

/// Status code a failure is reported with.
///
/// A deadline expiry is `504`, a failing handler `502`. Anything else went
/// wrong before the handler ran and is `500`.
pub fn error_status(err: &Error) -> u16 {
    match err {
        Error::Timeout(_) => 504,
        Error::Handler(_) => 502,
        _ => 500,
    }
}

/// The wire response reporting `err`.
pub fn error_response(err: &Error) -> http::Response<ResponseBody> {
    let mut headers = HeaderSet::new();
    headers.insert(CONTENT_TYPE, DEFAULT_CONTENT_TYPE);

    wire_response(error_status(err), headers, err.to_string().into())
}

/// Wrap what the handler returned into a wire response.
///
/// Headers set on the context come first. A complete response replaces
/// context headers of the same name.
fn build_response(ctx: &InvokeContext, reply: Reply) -> http::Response<ResponseBody> {
    let mut headers = ctx.response_headers();

    let (status, body) = match reply {
        Reply::Value(v) => (200, ResponseBody::Bytes(v)),
        Reply::Response(r) => {
            let (status, own, body) = r.into_parts();
            for (name, values) in own.iter() {
                headers.insert(name, values);
            }
            (status, body)
        }
        Reply::Pending(_) => {
            return error_response(&Error::User("Handler reply was not resolved".into()));
        }
    };

    wire_response(status, headers, body)
}

/// Encapsulate the application response for the wire.
fn wire_response(status: u16, mut headers: HeaderSet, body: ResponseBody) -> http::Response<ResponseBody> {
    let content_type = headers
        .remove(CONTENT_TYPE)
        .and_then(|v| v.into_iter().next())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

    let mut wire = encapsulate(&headers, Some(status), Some(&content_type));
    wire.insert(FN_FDK_VERSION, fdk_version());
    wire.insert(FN_FDK_RUNTIME, RUNTIME);

    let mut res = http::Response::new(body);
    *res.status_mut() = enforced_status(status);
    *res.headers_mut() = wire.to_http();

    res
}

/// The wire only carries `200`, `502` and `504`. Every other application
/// status goes out as `200`.
pub fn enforced_status(status: u16) -> http::StatusCode {
    match status {
        502 => http::StatusCode::BAD_GATEWAY,
        504 => http::StatusCode::GATEWAY_TIMEOUT,
        _ => http::StatusCode::OK,
    }
}

impl<H> Clone for Dispatcher<H> {
    fn clone(&self) -> Self {
        Dispatcher {
            handler: self.handler.clone(),
            config: self.config.clone(),
        }
    }
}

impl<H> fmt::Debug for Dispatcher<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dispatcher({})", self.config.listener())
    }
}

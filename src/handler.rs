//! The seam between the dispatcher and user code.

use crate::body::Body;
use crate::context::InvokeContext;
use crate::error::HandlerError;
use crate::header_set::{HeaderSet, IntoValues};
use crate::headers::CONTENT_TYPE;
use crate::server::ResponseBody;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// User function invoked once per request.
///
/// Any `Fn(InvokeContext, Body) -> Result<Reply, HandlerError>` closure is a
/// handler. `call` runs on the blocking thread pool and may block; a
/// [`Reply::Pending`] it returns is awaited on the connection's task.
pub trait Handler: Send + Sync + 'static {
    /// Handle one invocation.
    fn call(&self, ctx: InvokeContext, body: Body) -> Result<Reply, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(InvokeContext, Body) -> Result<Reply, HandlerError> + Send + Sync + 'static,
{
    fn call(&self, ctx: InvokeContext, body: Body) -> Result<Reply, HandlerError> {
        (self)(ctx, body)
    }
}

/// What a handler gives back.
pub enum Reply {
    /// Raw data, wrapped in a `200 text/plain` response unless the context
    /// already set a content type.
    Value(Vec<u8>),
    /// A complete response used as is.
    Response(FnResponse),
    /// Result still being computed. The dispatcher awaits it under the
    /// deadline.
    Pending(BoxFuture<'static, Result<Reply, HandlerError>>),
}

impl Reply {
    /// Reply with the outcome of an async computation.
    pub fn pending<F>(fut: F) -> Self
    where
        F: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        Reply::Pending(Box::pin(fut))
    }

    /// Run synchronous, possibly slow, user code on the blocking thread pool
    /// from within a pending reply.
    ///
    /// When the deadline passes first the thread keeps running to completion
    /// in the background and its result is thrown away.
    pub fn blocking<F, R>(f: F) -> Self
    where
        F: FnOnce() -> Result<R, HandlerError> + Send + 'static,
        R: Into<Reply> + Send + 'static,
    {
        Reply::pending(async move {
            async_std::task::spawn_blocking(move || match catch_unwind(AssertUnwindSafe(f)) {
                Ok(r) => r.map(Into::into),
                Err(p) => Err(panic_error(p)),
            })
            .await
        })
    }

    /// Await until the reply is no longer pending.
    pub(crate) async fn resolve(self) -> Result<Reply, HandlerError> {
        let mut reply = self;
        loop {
            match reply {
                Reply::Pending(fut) => reply = fut.await?,
                r => return Ok(r),
            }
        }
    }
}

pub(crate) fn panic_error(p: Box<dyn std::any::Any + Send>) -> HandlerError {
    let msg = if let Some(s) = p.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    };
    msg.into()
}

impl From<Vec<u8>> for Reply {
    fn from(v: Vec<u8>) -> Self {
        Reply::Value(v)
    }
}

impl From<String> for Reply {
    fn from(v: String) -> Self {
        Reply::Value(v.into_bytes())
    }
}

impl From<&str> for Reply {
    fn from(v: &str) -> Self {
        Reply::Value(v.as_bytes().to_vec())
    }
}

impl From<FnResponse> for Reply {
    fn from(v: FnResponse) -> Self {
        Reply::Response(v)
    }
}

/// A complete response built by the handler.
///
/// `status` is the application status. It travels in `fn-http-status`, the
/// wire status is decided by the dispatcher.
pub struct FnResponse {
    status: u16,
    headers: HeaderSet,
    body: ResponseBody,
}

impl FnResponse {
    /// A `200` response with the given body.
    pub fn new<B: Into<ResponseBody>>(body: B) -> Self {
        FnResponse {
            status: 200,
            headers: HeaderSet::new(),
            body: body.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Merge a header value into the response headers.
    pub fn with_header<V: IntoValues>(mut self, name: &str, value: V) -> Self {
        self.headers.merge(name, value);
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.headers.insert(CONTENT_TYPE, content_type);
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderSet {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderSet {
        &mut self.headers
    }

    pub(crate) fn into_parts(self) -> (u16, HeaderSet, ResponseBody) {
        (self.status, self.headers, self.body)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Value(v) => write!(f, "Value({})", v.len()),
            Reply::Response(r) => write!(f, "Response({:?})", r),
            Reply::Pending(_) => write!(f, "Pending"),
        }
    }
}

impl fmt::Debug for FnResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

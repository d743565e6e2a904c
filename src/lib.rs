#![warn(missing_debug_implementations)]
#![warn(clippy::all)]

//! Hot function invocation bridge speaking HTTP/1.1 over a unix socket.
//!
//! A function platform starts the worker process with `FN_LISTENER` naming a
//! unix socket path. The worker listens there and the platform sends one HTTP
//! request per call. Each request runs the user [`Handler`] exactly once,
//! under the call's deadline, and the outcome goes back as the response.
//!
//! ## Wire format
//!
//! The connection to the platform is a control channel, not the end user's
//! HTTP exchange. Application headers are carried as `fn-http-h-<name>`, the
//! application status in `fn-http-status`. The status of the wire response
//! itself is one of:
//!
//! * `200` the handler ran, whatever status it chose.
//! * `502` the handler failed.
//! * `504` the handler did not finish before `fn-deadline`.
//!
//! ## In scope
//!
//! * `Content-Length` and `Transfer-Encoding: chunked` request bodies.
//! * Keep-alive, one request at a time per connection.
//! * Streaming response bodies, chunked to HTTP/1.1 peers.
//!
//! ## Out of scope
//!
//! * HTTP/2 and TLS.
//! * Concurrent requests on one connection, pipelined requests are served in turn.
//! * Routing. A process serves exactly one function.
//!
//! # Example
//!
//! ```rust, no_run
//! use fdk_h1::{Config, InvokeContext, Body, Reply, HandlerError};
//!
//! fn hello(_ctx: InvokeContext, mut body: Body) -> Result<Reply, HandlerError> {
//!     Ok(Reply::pending(async move {
//!         let name = body.read_to_string().await?;
//!         Ok(format!("Hello {}", name).into())
//!     }))
//! }
//!
//! #[async_std::main]
//! async fn main() -> Result<(), fdk_h1::Error> {
//!     let config = Config::from_env()?;
//!     fdk_h1::run(config, hello).await
//! }
//! ```

#[macro_use]
extern crate log;

mod body;
mod error;

#[doc(hidden)]
pub mod buf_reader;

#[doc(hidden)]
pub mod http11;

pub(crate) use futures_io::{AsyncRead, AsyncWrite};

pub mod config;
pub mod context;
pub mod deadline;
pub mod dispatch;
pub mod handler;
pub mod header_set;
pub mod headers;
pub mod listener;
pub mod server;

pub use body::Body;
pub use config::Config;
pub use context::{InvokeContext, TracingContext};
pub use deadline::{Deadline, DeadlineGuard};
pub use dispatch::Dispatcher;
pub use error::{Error, HandlerError};
pub use handler::{FnResponse, Handler, Reply};
pub use header_set::HeaderSet;
pub use listener::{run, Listener};
pub use server::ResponseBody;

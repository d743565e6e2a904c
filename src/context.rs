//! Per-invocation context handed to the handler.

use crate::config::Config;
use crate::deadline::Deadline;
use crate::header_set::{HeaderSet, IntoValues};
use crate::headers::*;
use crate::Error;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

/// Everything known about one call, plus the response headers the handler
/// accumulates while it runs.
///
/// Cloning is cheap enough and clones share the response headers.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    app_id: Option<String>,
    app_name: Option<String>,
    fn_id: Option<String>,
    fn_name: Option<String>,
    call_id: String,
    deadline: Deadline,
    method: String,
    request_url: String,
    content_type: Option<String>,
    headers: HeaderSet,
    http_headers: HeaderSet,
    is_gateway: bool,
    tracing: TracingContext,
    response_headers: Arc<Mutex<HeaderSet>>,
}

impl InvokeContext {
    /// Build the context of a request accepted at `accepted_at`.
    ///
    /// Fails when `fn-deadline` is present but not a valid timestamp.
    pub fn from_request(
        req: &http::request::Parts,
        config: &Config,
        accepted_at: DateTime<Utc>,
    ) -> Result<Self, Error> {
        let wire = HeaderSet::from_http(&req.headers);

        let deadline = match wire.first(FN_DEADLINE) {
            Some(d) => Deadline::parse(d)?,
            None => Deadline::default_from(accepted_at),
        };

        let is_gateway = wire.first(FN_INTENT) == Some(INTENT_HTTP_REQUEST);

        let ctx = InvokeContext {
            call_id: wire.first(FN_CALL_ID).unwrap_or_default().to_string(),
            deadline,
            method: wire
                .first(FN_HTTP_METHOD)
                .map(str::to_string)
                .unwrap_or_else(|| req.method.to_string()),
            request_url: wire
                .first(FN_HTTP_REQUEST_URL)
                .map(str::to_string)
                .unwrap_or_else(|| req.uri.to_string()),
            content_type: wire.first(CONTENT_TYPE).map(str::to_string),
            headers: decapsulate(&wire, true),
            http_headers: decapsulate(&wire, false),
            is_gateway,
            tracing: TracingContext::from_headers(&wire, config),
            ..InvokeContext::empty(config, accepted_at)
        };

        debug!(
            "Context for call {:?}: deadline {}, gateway: {}",
            ctx.call_id, ctx.deadline, ctx.is_gateway
        );

        Ok(ctx)
    }

    /// A context with nothing but the process identity and a default
    /// deadline. Used when a request's own context can not be built.
    pub fn empty(config: &Config, accepted_at: DateTime<Utc>) -> Self {
        InvokeContext {
            app_id: config.app_id().map(str::to_string),
            app_name: config.app_name().map(str::to_string),
            fn_id: config.fn_id().map(str::to_string),
            fn_name: config.fn_name().map(str::to_string),
            call_id: String::new(),
            deadline: Deadline::default_from(accepted_at),
            method: String::new(),
            request_url: String::new(),
            content_type: None,
            headers: HeaderSet::new(),
            http_headers: HeaderSet::new(),
            is_gateway: false,
            tracing: TracingContext::disabled(config),
            response_headers: Arc::new(Mutex::new(HeaderSet::new())),
        }
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    pub fn fn_id(&self) -> Option<&str> {
        self.fn_id.as_deref()
    }

    pub fn fn_name(&self) -> Option<&str> {
        self.fn_name.as_deref()
    }

    /// Opaque call identifier from `fn-call-id`, empty if none was sent.
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Method of the original request, as seen by the gateway.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// URL of the original request, as seen by the gateway.
    pub fn request_url(&self) -> &str {
        &self.request_url
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Request headers with the encapsulated ones unwrapped. Plain wire
    /// headers show through unless an unwrapped one has the same name.
    pub fn headers(&self) -> &HeaderSet {
        &self.headers
    }

    /// Only the headers of the original HTTP request.
    pub fn http_headers(&self) -> &HeaderSet {
        &self.http_headers
    }

    /// Whether the call was relayed by the HTTP gateway.
    pub fn is_gateway(&self) -> bool {
        self.is_gateway
    }

    pub fn tracing_context(&self) -> &TracingContext {
        &self.tracing
    }

    /// Replace a response header.
    pub fn set_response_header<V: IntoValues>(&self, name: &str, value: V) {
        self.lock_response_headers().insert(name, value);
    }

    /// Merge a value into a response header.
    pub fn add_response_header<V: IntoValues>(&self, name: &str, value: V) {
        self.lock_response_headers().merge(name, value);
    }

    /// Merge every header of `headers` into the response headers.
    pub fn set_response_headers(&self, headers: &HeaderSet) {
        self.lock_response_headers().merge_all(headers);
    }

    /// Snapshot of the response headers set so far.
    pub fn response_headers(&self) -> HeaderSet {
        self.lock_response_headers().clone()
    }

    fn lock_response_headers(&self) -> MutexGuard<'_, HeaderSet> {
        self.response_headers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }
}

/// Zipkin B3 propagation state of a call.
///
/// Empty, and never sampled, unless tracing is enabled for the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingContext {
    enabled: bool,
    collector_url: Option<String>,
    trace_id: Option<String>,
    span_id: Option<String>,
    parent_span_id: Option<String>,
    sampled: bool,
    flags: Option<String>,
    service_name: String,
}

impl TracingContext {
    fn from_headers(wire: &HeaderSet, config: &Config) -> Self {
        if !config.tracing_enabled() {
            return TracingContext::disabled(config);
        }

        let owned = |name| wire.first(name).map(str::to_string);

        let sampled = match wire.first(X_B3_SAMPLED).map(str::trim) {
            None => true,
            Some("1") => true,
            Some("0") => false,
            Some(v) if v.eq_ignore_ascii_case("true") => true,
            Some(v) if v.eq_ignore_ascii_case("false") => false,
            Some(v) => {
                debug!("Unknown {} value: {:?}", X_B3_SAMPLED, v);
                true
            }
        };

        TracingContext {
            enabled: true,
            collector_url: config.trace_collector_url().map(str::to_string),
            trace_id: Some(owned(X_B3_TRACEID).unwrap_or_else(generate_id)),
            span_id: Some(owned(X_B3_SPANID).unwrap_or_else(generate_id)),
            parent_span_id: owned(X_B3_PARENTSPANID),
            sampled,
            flags: owned(X_B3_FLAGS),
            service_name: service_name(config),
        }
    }

    fn disabled(config: &Config) -> Self {
        TracingContext {
            enabled: false,
            collector_url: config.trace_collector_url().map(str::to_string),
            trace_id: None,
            span_id: None,
            parent_span_id: None,
            sampled: false,
            flags: None,
            service_name: service_name(config),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn collector_url(&self) -> Option<&str> {
        self.collector_url.as_deref()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn span_id(&self) -> Option<&str> {
        self.span_id.as_deref()
    }

    pub fn parent_span_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    pub fn flags(&self) -> Option<&str> {
        self.flags.as_deref()
    }

    /// `<app>::<fn>`, lowercased.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

fn service_name(config: &Config) -> String {
    format!(
        "{}::{}",
        config.app_name().unwrap_or("none"),
        config.fn_name().unwrap_or("none")
    )
    .to_lowercase()
}

/// Random 64 bit id as 16 hex digits.
fn generate_id() -> String {
    format!("{:016x}", fastrand::u64(..))
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(tracing: &str) -> Config {
        Config::from_vars(vec![
            ("FN_LISTENER", "unix:/tmp/ctx.sock"),
            ("FN_APP_NAME", "MyApp"),
            ("FN_FN_NAME", "Hello"),
            ("OCI_TRACING_ENABLED", tracing),
        ])
        .unwrap()
    }

    fn parts(headers: &[(&'static str, &'static str)]) -> http::request::Parts {
        let mut bld = http::Request::post("/call");
        for (k, v) in headers {
            bld = bld.header(*k, *v);
        }
        bld.body(()).unwrap().into_parts().0
    }

    #[test]
    fn gateway_request() {
        let p = parts(&[
            ("fn-call-id", "01ABC"),
            ("fn-intent", "httprequest"),
            ("fn-http-method", "GET"),
            ("fn-http-request-url", "/r/app/hello?q=1"),
            ("fn-http-h-accept", "text/html"),
            ("fn-http-h-host", "example.com"),
            ("host", "localhost"),
            ("content-type", "application/json"),
        ]);

        let ctx = InvokeContext::from_request(&p, &config("0"), Utc::now()).unwrap();

        assert_eq!(ctx.call_id(), "01ABC");
        assert!(ctx.is_gateway());
        assert_eq!(ctx.method(), "GET");
        assert_eq!(ctx.request_url(), "/r/app/hello?q=1");
        assert_eq!(ctx.content_type(), Some("application/json"));
        assert_eq!(ctx.headers().first("host"), Some("example.com"));
        assert_eq!(ctx.headers().first("fn-call-id"), Some("01ABC"));
        assert_eq!(ctx.http_headers().first("accept"), Some("text/html"));
        assert!(!ctx.http_headers().contains("fn-call-id"));
    }

    #[test]
    fn falls_back_to_request_line() {
        let ctx = InvokeContext::from_request(&parts(&[]), &config("0"), Utc::now()).unwrap();

        assert_eq!(ctx.call_id(), "");
        assert!(!ctx.is_gateway());
        assert_eq!(ctx.method(), "POST");
        assert_eq!(ctx.request_url(), "/call");
    }

    #[test]
    fn missing_deadline_is_thirty_seconds() {
        let now = Utc::now();
        let ctx = InvokeContext::from_request(&parts(&[]), &config("0"), now).unwrap();
        assert_eq!(ctx.deadline().window_at(now).as_secs(), 30);
    }

    #[test]
    fn bad_deadline_fails() {
        let p = parts(&[("fn-deadline", "not a date")]);
        let r = InvokeContext::from_request(&p, &config("0"), Utc::now());
        assert!(matches!(r, Err(Error::Deadline(_))));
    }

    #[test]
    fn response_headers_shared_by_clones() {
        let ctx = InvokeContext::empty(&config("0"), Utc::now());
        let other = ctx.clone();

        other.add_response_header("x-a", "1");
        ctx.add_response_header("X-A", "2");
        ctx.set_response_header("x-b", "only");

        let h = ctx.response_headers();
        assert_eq!(h.get_all("x-a"), &["1", "2"]);
        assert_eq!(h.first("x-b"), Some("only"));
    }

    #[test]
    fn tracing_disabled_is_empty() {
        let p = parts(&[("x-b3-traceid", "abc")]);
        let ctx = InvokeContext::from_request(&p, &config("0"), Utc::now()).unwrap();
        let t = ctx.tracing_context();

        assert!(!t.is_enabled());
        assert!(!t.is_sampled());
        assert_eq!(t.trace_id(), None);
        assert_eq!(t.service_name(), "myapp::hello");
    }

    #[test]
    fn tracing_enabled_generates_ids() {
        let p = parts(&[("x-b3-spanid", "00000000000000aa"), ("x-b3-sampled", "0")]);
        let ctx = InvokeContext::from_request(&p, &config("1"), Utc::now()).unwrap();
        let t = ctx.tracing_context();

        assert!(t.is_enabled());
        assert_eq!(t.trace_id().map(str::len), Some(16));
        assert_eq!(t.span_id(), Some("00000000000000aa"));
        assert_eq!(t.parent_span_id(), None);
        assert!(!t.is_sampled());
    }
}

//! Reserved wire headers, and the codec that carries application headers
//! through them.
//!
//! Application headers travel under `fn-http-h-<name>` so that they can not
//! collide with the headers the platform owns. The true application status
//! travels in `fn-http-status`.

use crate::header_set::HeaderSet;

/// Prefix of an encapsulated application header.
pub const FN_HTTP_PREFIX: &str = "fn-http-h-";
/// True application status code.
pub const FN_HTTP_STATUS: &str = "fn-http-status";
/// Absolute ISO-8601 deadline of the call.
pub const FN_DEADLINE: &str = "fn-deadline";
/// Opaque call identifier.
pub const FN_CALL_ID: &str = "fn-call-id";
/// Method as seen by the platform gateway.
pub const FN_HTTP_METHOD: &str = "fn-http-method";
/// Request URL as seen by the platform gateway.
pub const FN_HTTP_REQUEST_URL: &str = "fn-http-request-url";
/// Set by the gateway when relaying an HTTP request.
pub const FN_INTENT: &str = "fn-intent";
/// `fn-intent` value of a gateway-relayed HTTP request.
pub const INTENT_HTTP_REQUEST: &str = "httprequest";
/// SDK identity, never encapsulated.
pub const FN_FDK_VERSION: &str = "fn-fdk-version";
/// Runtime identity.
pub const FN_FDK_RUNTIME: &str = "fn-fdk-runtime";

pub const CONTENT_TYPE: &str = "content-type";

pub const X_B3_TRACEID: &str = "x-b3-traceid";
pub const X_B3_SPANID: &str = "x-b3-spanid";
pub const X_B3_PARENTSPANID: &str = "x-b3-parentspanid";
pub const X_B3_SAMPLED: &str = "x-b3-sampled";
pub const X_B3_FLAGS: &str = "x-b3-flags";

/// Value sent in `fn-fdk-version`.
pub fn fdk_version() -> String {
    format!("fdk-rust/{}", env!("CARGO_PKG_VERSION"))
}

/// Map application headers onto the wire.
///
/// Every header except `content-type` and `fn-fdk-version` is merged under
/// `fn-http-h-<name>`. A name that already carries the prefix is merged under
/// itself. `status` goes in `fn-http-status` and `content_type`, when given,
/// replaces any `content-type` from `headers`.
pub fn encapsulate(headers: &HeaderSet, status: Option<u16>, content_type: Option<&str>) -> HeaderSet {
    let mut wire = HeaderSet::new();

    for (name, values) in headers.iter() {
        if name == CONTENT_TYPE || name == FN_FDK_VERSION {
            wire.insert(name, values);
        } else if name.starts_with(FN_HTTP_PREFIX) {
            wire.merge(name, values);
        } else {
            wire.merge(&format!("{}{}", FN_HTTP_PREFIX, name), values);
        }
    }

    if let Some(status) = status {
        wire.insert(FN_HTTP_STATUS, status.to_string());
    }

    if let Some(content_type) = content_type {
        wire.insert(CONTENT_TYPE, content_type);
    }

    wire
}

/// Recover application headers from the wire.
///
/// Prefixed headers are stripped of the prefix and merged under the bare
/// name. With `merge`, unprefixed headers are copied through unless the bare
/// name already came from a prefixed one. Without `merge` they are dropped.
pub fn decapsulate(wire: &HeaderSet, merge: bool) -> HeaderSet {
    let mut headers = HeaderSet::new();

    for (name, values) in wire.iter() {
        if let Some(bare) = name.strip_prefix(FN_HTTP_PREFIX) {
            headers.merge(bare, values);
        }
    }

    if merge {
        for (name, values) in wire.iter() {
            if !name.starts_with(FN_HTTP_PREFIX) && !headers.contains(name) {
                headers.insert(name, values);
            }
        }
    }

    headers
}

//! Response status classification.
//!
//! `http::StatusCode` already gives us the numeric code and canonical reason
//! phrase, falling back to `"<unknown status code>"` for codes it doesn't
//! recognize; [`reason_phrase`] patches that fallback to `http_<code>`
//! instead. What `StatusCode` doesn't give us is which headers a status
//! forbids on the wire, which this module derives once so the response
//! writer doesn't have to special-case status codes itself.

use http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderName, StatusCode};

/// The five classes a status code can fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Informational,
    Successful,
    Redirection,
    ClientError,
    ServerError,
    Invalid,
}

/// Classifies a status code by its leading digit.
pub fn class(status: StatusCode) -> StatusClass {
    match status.as_u16() / 100 {
        1 => StatusClass::Informational,
        2 => StatusClass::Successful,
        3 => StatusClass::Redirection,
        4 => StatusClass::ClientError,
        5 => StatusClass::ServerError,
        _ => StatusClass::Invalid,
    }
}

/// Whether a response with this status is permitted to carry a body.
///
/// False for informational responses, `204 No Content`, and `304 Not Modified`.
pub fn body_allowed(status: StatusCode) -> bool {
    !matches!(class(status), StatusClass::Informational) && status != StatusCode::NO_CONTENT && status != StatusCode::NOT_MODIFIED
}

/// Headers that must not appear on a response with this status.
///
/// `Content-Length` and `Transfer-Encoding` are suppressed whenever the body
/// is disallowed; `304 Not Modified` additionally suppresses `Content-Type`
/// since a 304 carries no representation at all.
pub fn suppressed_headers(status: StatusCode) -> &'static [HeaderName] {
    if body_allowed(status) {
        return &[];
    }

    if status == StatusCode::NOT_MODIFIED {
        static NOT_MODIFIED_SUPPRESSED: [HeaderName; 3] = [CONTENT_LENGTH, TRANSFER_ENCODING, CONTENT_TYPE];
        return &NOT_MODIFIED_SUPPRESSED;
    }

    static DEFAULT_SUPPRESSED: [HeaderName; 2] = [CONTENT_LENGTH, TRANSFER_ENCODING];
    &DEFAULT_SUPPRESSED
}

/// The reason phrase to emit on the status line.
///
/// Falls back to `http_<code>` for codes `http::StatusCode` doesn't know a
/// canonical reason for.
pub fn reason_phrase(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => reason.to_string(),
        None => format!("http_{}", status.as_u16()),
    }
}

//! Response status classification.
//!
//! [`classify`] is a pure function of the status code; `None` means no
//! response was obtained at all.

use phonehome_core::PhoneHomeError;

use crate::http::{headers, HttpResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    NoContent,
    /// Client-side problem; resending the same request will fail again.
    NoRetry,
    /// Transient failure; safe to resend later.
    Retry,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success | Outcome::NoContent)
    }
}

pub fn classify(status: Option<u16>) -> Outcome {
    match status {
        None => Outcome::Retry,
        Some(204) => Outcome::NoContent,
        Some(200..=299) => Outcome::Success,
        Some(400..=499) => Outcome::NoRetry,
        Some(500..=599) => Outcome::Retry,
        Some(_) => Outcome::Retry,
    }
}

/// Short diagnostic text for a status code.
pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No content available",
        400 => "Bad request",
        401 => "Unauthorized",
        404 => "Not found",
        409 => "Conflict",
        411 => "Missing required length content",
        413 => "Request entity too large",
        500 => "Internal server error",
        503 => "Service unavailable",
        _ => "Unknown",
    }
}

/// `true` when the response carries the out-of-band "stop retrying" signal.
pub fn stop_requested(response: &HttpResponse) -> bool {
    response
        .headers
        .get(headers::STOP_RETRY)
        .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// Converts a response into `Ok(status)` or the matching error.
///
/// The stop signal wins over any status, including success.
pub fn check_response(response: &HttpResponse, context: &str) -> Result<u16, PhoneHomeError> {
    if stop_requested(response) {
        return Err(PhoneHomeError::StopRetrying(format!(
            "{context}: {} {}",
            response.status,
            server_message(response)
        )));
    }
    match classify(Some(response.status)) {
        Outcome::Success | Outcome::NoContent => Ok(response.status),
        _ if response.status == 401 => Err(PhoneHomeError::Authentication(format!(
            "{context}: {}",
            server_message(response)
        ))),
        outcome => Err(PhoneHomeError::Protocol {
            status: response.status,
            message: format!("{context}: {}", server_message(response)),
            retry: outcome == Outcome::Retry,
        }),
    }
}

/// Server-provided body text, else the reason phrase, else the status table.
pub fn server_message(response: &HttpResponse) -> String {
    let body = response.body_text();
    if !body.is_empty() && body.len() <= 512 {
        return body;
    }
    if !response.reason.is_empty() {
        return response.reason.clone();
    }
    status_text(response.status).to_string()
}

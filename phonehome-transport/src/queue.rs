//! Remote named-queue operations of the queue-service protocol.
//!
//! Every call is signed the same way as a message send (see
//! [`crate::dts`]). Paths are rooted at the virtual path:
//!
//! ```text
//! <vpath>/queue/<name>                    create message, create/delete queue
//! <vpath>/queue/<name>[/<filter>]/pop     pop
//! <vpath>/queue/<name>[/<filter>]/longpoll
//! <vpath>/queue/<name>/message/<id>       payload, read, delete
//! <vpath>/queue/<name>/message/<id>/resume
//! <vpath>/queue/<name>/config             queue configuration
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};

use phonehome_core::{PhoneHomeError, PropertyStore, Result};

use crate::classify::{check_response, classify, Outcome};
use crate::dts::{DtsProtocol, DTS_TIME};
use crate::http::{headers, HttpResponse, Method, ResponseHeaders};

/// Result of a queue call that the server accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueResponse {
    pub status: u16,
    pub outcome: Outcome,
    pub headers: ResponseHeaders,
    pub body: Vec<u8>,
}

impl QueueResponse {
    fn from_response(response: HttpResponse) -> Self {
        Self {
            status: response.status,
            outcome: classify(Some(response.status)),
            headers: response.headers,
            body: response.body,
        }
    }

    /// `true` for 204: nothing queued.
    pub fn is_empty(&self) -> bool {
        self.outcome == Outcome::NoContent
    }

    /// Message id: the last segment of the `Location` header.
    pub fn message_id(&self) -> Option<&str> {
        self.headers
            .get(headers::LOCATION)
            .and_then(|loc| loc.trim_end_matches('/').rsplit('/').next())
            .filter(|id| !id.is_empty())
    }

    /// Byte offset the server asks an interrupted upload to restart from.
    pub fn resume_from(&self) -> Option<usize> {
        self.headers
            .get(headers::RESUME_FROM)
            .and_then(|v| v.parse().ok())
    }

    /// Server clock, from the queue-service time header or `Date`.
    ///
    /// An unparsable time header falls through to `Date`.
    pub fn server_time(&self) -> Option<DateTime<Utc>> {
        self.headers
            .get(DTS_TIME)
            .and_then(parse_server_time)
            .or_else(|| self.headers.get(headers::DATE).and_then(parse_server_time))
    }
}

/// Format of the queue-service time header, less its zone:
/// `2008 Jul 22 12:05:00 GMT`.
const DTS_TIME_FORMAT: &str = "%Y %b %d %H:%M:%S";

/// Parses `yyyy MMM dd HH:mm:ss GMT` or an RFC 2822 date.
pub fn parse_server_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let bare = value
        .strip_suffix("GMT")
        .or_else(|| value.strip_suffix("UTC"))
        .map(str::trim_end);
    if let Some(bare) = bare {
        if let Ok(naive) = NaiveDateTime::parse_from_str(bare, DTS_TIME_FORMAT) {
            return Some(naive.and_utc());
        }
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn filtered(base: String, filter: Option<&str>, leaf: &str) -> String {
    match filter {
        Some(filter) => format!("{base}/{filter}/{leaf}"),
        None => format!("{base}/{leaf}"),
    }
}

impl DtsProtocol {
    fn queue_path(props: &PropertyStore, name: &str) -> String {
        format!("{}/queue/{name}", Self::vpath(props))
    }

    fn queue_call(
        &self,
        props: &PropertyStore,
        method: Method,
        path: &str,
        extra_headers: &[(&str, String)],
        body: Option<&[u8]>,
        context: &str,
    ) -> Result<QueueResponse> {
        let response = self.signed_request(props, method, path, extra_headers, body)?;
        check_response(&response, context)?;
        Ok(QueueResponse::from_response(response))
    }

    /// Announces a message of `declared_len` bytes; the payload follows
    /// through [`DtsProtocol::add_payload`]. 202 means accepted for upload.
    pub fn create_message(
        &self,
        props: &PropertyStore,
        name: &str,
        declared_len: usize,
    ) -> Result<QueueResponse> {
        let path = Self::queue_path(props, name);
        self.queue_call(
            props,
            Method::Post,
            &path,
            &[(headers::MESSAGE_LENGTH, declared_len.to_string())],
            None,
            "create message",
        )
    }

    /// Uploads `data[resume_from..]` into a created message.
    pub fn add_payload(
        &self,
        props: &PropertyStore,
        name: &str,
        id: &str,
        resume_from: usize,
        data: &[u8],
    ) -> Result<QueueResponse> {
        let remaining = data.get(resume_from..).ok_or_else(|| {
            PhoneHomeError::InvalidRequest(format!(
                "resume offset {resume_from} is past the end of a {} byte payload",
                data.len()
            ))
        })?;
        let path = format!("{}/message/{id}", Self::queue_path(props, name));
        self.queue_call(
            props,
            Method::Post,
            &path,
            &[(headers::RESUME_FROM, resume_from.to_string())],
            Some(remaining),
            "add payload",
        )
    }

    /// Offset at which an interrupted upload should continue.
    pub fn resume_offset(&self, props: &PropertyStore, name: &str, id: &str) -> Result<usize> {
        let path = format!("{}/message/{id}/resume", Self::queue_path(props, name));
        let response = self.queue_call(props, Method::Head, &path, &[], None, "resume offset")?;
        Ok(response.resume_from().unwrap_or(0))
    }

    /// Two-phase upload: create, then upload, resuming once after a
    /// transport failure.
    pub fn upload(&self, props: &PropertyStore, name: &str, data: &[u8]) -> Result<String> {
        let created = self.create_message(props, name, data.len())?;
        let id = created
            .message_id()
            .ok_or_else(|| PhoneHomeError::Protocol {
                status: created.status,
                message: "create message: no message location returned".into(),
                retry: false,
            })?
            .to_string();

        match self.add_payload(props, name, &id, 0, data) {
            Ok(_) => Ok(id),
            Err(err @ PhoneHomeError::Transport(_)) => {
                tracing::warn!("upload of message {id} interrupted ({err}); resuming");
                let offset = self.resume_offset(props, name, &id)?;
                self.add_payload(props, name, &id, offset, data)?;
                Ok(id)
            }
            Err(err) => Err(err),
        }
    }

    /// Takes the next message; [`QueueResponse::is_empty`] on 204.
    pub fn pop(
        &self,
        props: &PropertyStore,
        name: &str,
        filter: Option<&str>,
    ) -> Result<QueueResponse> {
        let path = filtered(Self::queue_path(props, name), filter, "pop");
        self.queue_call(props, Method::Post, &path, &[], None, "pop")
    }

    pub fn read(&self, props: &PropertyStore, name: &str, id: &str) -> Result<QueueResponse> {
        let path = format!("{}/message/{id}", Self::queue_path(props, name));
        self.queue_call(props, Method::Get, &path, &[], None, "read")
    }

    /// Long poll: the server holds the call until the queue is non-empty
    /// (200) or its window expires (204).
    pub fn poll(
        &self,
        props: &PropertyStore,
        name: &str,
        filter: Option<&str>,
    ) -> Result<QueueResponse> {
        let path = filtered(Self::queue_path(props, name), filter, "longpoll");
        self.queue_call(props, Method::Head, &path, &[], None, "poll")
    }

    pub fn delete_message(
        &self,
        props: &PropertyStore,
        name: &str,
        id: &str,
    ) -> Result<QueueResponse> {
        let path = format!("{}/message/{id}", Self::queue_path(props, name));
        self.queue_call(props, Method::Delete, &path, &[], None, "delete message")
    }

    /// Pops the server's clock queue; see [`QueueResponse::server_time`].
    pub fn get_time(&self, props: &PropertyStore) -> Result<QueueResponse> {
        let path = format!("{}/queue/time/pop", Self::vpath(props));
        self.queue_call(props, Method::Post, &path, &[], None, "get time")
    }

    // -----------------------------------------------------------------------
    // Administrative
    // -----------------------------------------------------------------------

    pub fn create_queue(
        &self,
        props: &PropertyStore,
        name: &str,
        settings: &[(&str, String)],
    ) -> Result<QueueResponse> {
        let path = Self::queue_path(props, name);
        self.queue_call(props, Method::Put, &path, settings, None, "create queue")
    }

    pub fn modify_queue(
        &self,
        props: &PropertyStore,
        name: &str,
        settings: &[(&str, String)],
    ) -> Result<QueueResponse> {
        let path = format!("{}/config", Self::queue_path(props, name));
        self.queue_call(props, Method::Get, &path, settings, None, "modify queue")
    }

    pub fn delete_queue(&self, props: &PropertyStore, name: &str) -> Result<QueueResponse> {
        let path = Self::queue_path(props, name);
        self.queue_call(props, Method::Delete, &path, &[], None, "delete queue")
    }
}

//! Telemetry message bodies.
//!
//! Every message shares a common header (site, host, system and product
//! identity plus a fresh message UUID and UTC timestamp) followed by a
//! kind-specific element, all written through [`DynBuffer`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::buffer::DynBuffer;
use crate::error::{PhoneHomeError, Result};
use crate::host::{self, HostIdentity};
use crate::props::{defaults, keys, PropertyStore};
use crate::types::{Message, MessageKind};

pub const SCHEMA_VERSION_2_1: &str = "2.1";
pub const CLIENT_NAME: &str = "phonehome";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ANONYMOUS_USER: &str = "anonymous";

/// Escaped bytes of a fault summary kept in the message.
pub const SUMMARY_BUDGET: usize = 1024;
/// Escaped bytes of a raw event payload kept in the message.
pub const PAYLOAD_BUDGET: usize = 64 * 1024;

const NA: &str = "NA";

// ---------------------------------------------------------------------------
// Fault events
// ---------------------------------------------------------------------------

/// A diagnosed fault to report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultEvent {
    pub uuid: String,
    /// Knowledge-article style code, e.g. `SUN4V-8001-8H`.
    pub code: String,
    #[serde(default = "default_severity")]
    pub severity: String,
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_action: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
    /// Marks a follow-up to a previously reported fault.
    #[serde(default)]
    pub update: bool,
}

fn default_severity() -> String {
    "Major".to_string()
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds message bodies for one host identity.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    identity: HostIdentity,
    schema: String,
    user: String,
    registered_system_id: Option<String>,
    now: DateTime<Utc>,
}

impl MessageBuilder {
    pub fn new(identity: HostIdentity, props: &PropertyStore) -> Self {
        Self {
            identity,
            schema: props
                .get_or(keys::SCHEMA_VERSION, defaults::SCHEMA_VERSION)
                .to_string(),
            user: props
                .get_or(keys::REG_USER_ID, ANONYMOUS_USER)
                .to_string(),
            registered_system_id: props.get(keys::REG_SYSTEM_ID).map(str::to_string),
            now: Utc::now(),
        }
    }

    /// Fixes the timestamp used for message and event times.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    fn uses_schema_2_1(&self) -> bool {
        self.schema == SCHEMA_VERSION_2_1
    }

    fn timestamp(&self) -> String {
        self.now.format("%Y-%m-%dT%H:%M:%S").to_string()
    }

    /// Writes the common header; returns the message time string.
    fn start(&self, buf: &mut DynBuffer) -> Result<String> {
        let time = self.timestamp();
        let id = &self.identity;
        let message_uuid = uuid::Uuid::new_v4().to_string();
        let xsd = if self.uses_schema_2_1() {
            "message_21.xsd"
        } else {
            "message_20.xsd"
        };

        buf.append_str("<?xml version='1.0' encoding='UTF-8'?>\n")?;
        buf.append_str("<message xmlns:xsi='http://www.w3.org/2001/XMLSchema-instance'\n")?;
        buf.append_fmt(format_args!("    xsi:noNamespaceSchemaLocation='{xsd}'>\n"))?;
        buf.xml_nv(1, "site-id", &id.site_id)?;
        buf.xml_nv(1, "host-id", &id.host_id)?;
        buf.xml_nv_token(1, "message-uuid", &message_uuid)?;
        buf.xml_anv(1, "timezone", "UTC", "message-time", &time)?;
        buf.xml_nv_token(1, "system-id", &id.system_id)?;
        if self.uses_schema_2_1() {
            buf.xml_nv(1, "system-name", &id.host_id)?;
            buf.xml_nv(1, "system-version", &host::system_version())?;
        }
        buf.xml_nv_token(1, "asset-id", &id.asset_id)?;
        buf.xml_nv_token(1, "product-id", &id.product_id)?;
        buf.xml_nv(1, "product-name", &id.product_name)?;
        if self.uses_schema_2_1() {
            buf.xml_nv(1, "schema-version", &self.schema)?;
            buf.xml_nv(1, "client-name", CLIENT_NAME)?;
            buf.xml_nv(1, "client-version", CLIENT_VERSION)?;
        }
        Ok(time)
    }

    fn finish(&self, mut buf: DynBuffer, kind: MessageKind) -> Result<Message> {
        buf.xml_end(0, "message")?;
        Ok(Message::new(kind, buf.into_vec()))
    }

    pub fn activate(&self) -> Result<Message> {
        let mut buf = DynBuffer::with_capacity(2048)?;
        let user = self.user.as_str();
        self.start(&mut buf)?;
        buf.xml_elem(1, "monitoring-activation")?;
        buf.xml_elem(2, "activation-user")?;
        for (name, value) in [
            ("company", NA),
            ("email", NA),
            ("first-name", user),
            ("last-name", user),
            ("organization", NA),
            ("phone", NA),
        ] {
            buf.xml_nv(3, name, value)?;
        }
        buf.xml_end(2, "activation-user")?;
        buf.xml_elem(2, "site-address")?;
        for name in ["line", "company", "city", "state", "postal-code", "country"] {
            buf.xml_nv(3, name, NA)?;
        }
        buf.xml_end(2, "site-address")?;
        buf.xml_elem(2, "contact")?;
        for name in ["company", "email", "first-name", "last-name", "phone"] {
            buf.xml_nv(3, name, NA)?;
        }
        buf.xml_end(2, "contact")?;
        buf.xml_end(1, "monitoring-activation")?;
        self.finish(buf, MessageKind::Activate)
    }

    pub fn deactivate(&self) -> Result<Message> {
        let mut buf = DynBuffer::with_capacity(1024)?;
        self.start(&mut buf)?;
        buf.xml_nv(1, "monitoring-deactivation", "")?;
        self.finish(buf, MessageKind::Deactivate)
    }

    pub fn heartbeat(&self) -> Result<Message> {
        let mut buf = DynBuffer::with_capacity(1024)?;
        let time = self.start(&mut buf)?;
        buf.xml_elem(1, "heartbeat")?;
        buf.xml_anv(2, "timezone", "UTC", "time", &time)?;
        buf.xml_end(1, "heartbeat")?;
        self.finish(buf, MessageKind::Heartbeat)
    }

    /// Inventory snapshot of the client itself.
    pub fn audit(&self) -> Result<Message> {
        let mut buf = DynBuffer::with_capacity(1024)?;
        let time = self.start(&mut buf)?;
        buf.xml_elem(1, "audit")?;
        buf.xml_anv(2, "timezone", "UTC", "audit-time", &time)?;
        buf.xml_nv(2, "system-name", &self.identity.host_id)?;
        buf.xml_nv(2, "system-version", &host::system_version())?;
        buf.xml_nv(2, "architecture", std::env::consts::ARCH)?;
        buf.xml_nv(2, "client-name", CLIENT_NAME)?;
        buf.xml_nv(2, "client-version", CLIENT_VERSION)?;
        buf.xml_end(1, "audit")?;
        self.finish(buf, MessageKind::Audit)
    }

    /// End-to-end test event that asks the service to mail `email`.
    pub fn test(&self, email: &str) -> Result<Message> {
        if email.trim().is_empty() {
            return Err(PhoneHomeError::Configuration(
                "test message requires an email address".into(),
            ));
        }
        let mut buf = DynBuffer::with_capacity(1280)?;
        let time = self.start(&mut buf)?;
        buf.xml_elem(1, "event")?;
        buf.xml_elem(2, "primary-event-information")?;
        buf.xml_nv(3, "message-id", "TESTCREATE")?;
        buf.xml_nv(3, "event-uuid", &uuid::Uuid::new_v4().to_string())?;
        buf.xml_anv(3, "timezone", "UTC", "event-time", &time)?;
        buf.xml_nv(3, "severity", "Minor")?;
        buf.xml_elem(3, "component")?;
        buf.xml_nv(4, "uncategorized", "")?;
        buf.xml_end(3, "component")?;
        buf.xml_nv(3, "summary", &format!("mailto:{}", email.trim()))?;
        buf.xml_nv(
            3,
            "description",
            "Test Message Used for Testing End to End Connection",
        )?;
        buf.xml_nv(3, "required-action", "None")?;
        buf.xml_end(2, "primary-event-information")?;
        buf.xml_end(1, "event")?;
        self.finish(buf, MessageKind::Test)
    }

    /// Activation status query for `method` (e.g. `status`, `validate`).
    pub fn status(&self, method: &str) -> Result<Message> {
        let mut buf = DynBuffer::with_capacity(1024)?;
        let serial = self
            .registered_system_id
            .as_deref()
            .unwrap_or(&self.identity.system_id);
        self.start(&mut buf)?;
        buf.xml_elem(1, "asr-status")?;
        buf.xml_nv(2, "soa_username", &self.user)?;
        buf.xml_nv(2, "method", method)?;
        buf.xml_elem(2, "device")?;
        buf.xml_nv(3, "serial-number", serial)?;
        buf.xml_nv(3, "host-name", &self.identity.host_id)?;
        buf.xml_end(2, "device")?;
        buf.xml_end(1, "asr-status")?;
        self.finish(buf, MessageKind::Status)
    }

    /// Announces a planned online/maintenance transition.
    pub fn state_change(&self, online: bool, maintenance: bool) -> Result<Message> {
        let mut buf = DynBuffer::with_capacity(1024)?;
        self.start(&mut buf)?;
        buf.xml_elem(1, "state-change")?;
        buf.xml_nb(2, "online", online)?;
        buf.xml_nb(2, "maintenance", maintenance)?;
        buf.xml_end(1, "state-change")?;
        self.finish(buf, MessageKind::StateChange)
    }

    pub fn fault(&self, event: &FaultEvent) -> Result<Message> {
        let mut buf = DynBuffer::with_capacity(2048)?;
        let time = self.start(&mut buf)?;
        buf.xml_elem(1, "event")?;
        buf.xml_elem(2, "primary-event-information")?;
        buf.xml_nv(3, "message-id", &event.code)?;
        buf.xml_nv_token(3, "event-uuid", &event.uuid)?;
        buf.xml_anv(3, "timezone", "UTC", "event-time", &time)?;
        buf.xml_nv(3, "severity", &event.severity)?;
        buf.xml_elem(3, "component")?;
        match event.component.as_deref() {
            Some(component) => buf.xml_nv(4, "fru", component)?,
            None => buf.xml_nv(4, "uncategorized", "")?,
        }
        buf.xml_end(3, "component")?;

        buf.append_str("            <summary>")?;
        buf.append_xml_bounded(&event.summary, SUMMARY_BUDGET)?;
        buf.append_str("</summary>\n")?;
        buf.xml_nv(3, "description", &event.description)?;
        buf.xml_nv(
            3,
            "required-action",
            event.required_action.as_deref().unwrap_or("None"),
        )?;
        buf.xml_end(2, "primary-event-information")?;

        if let Some(payload) = event.payload.as_deref() {
            buf.append_str("        <payload>")?;
            let written = buf.append_xml_bounded(payload, PAYLOAD_BUDGET)?;
            if written < payload.len() {
                tracing::debug!(uuid = %event.uuid, "fault payload truncated to {written} bytes");
            }
            buf.append_str("</payload>\n")?;
        }
        buf.xml_end(1, "event")?;

        let kind = if event.update {
            MessageKind::EventUpdate
        } else {
            MessageKind::Fault
        };
        self.finish(buf, kind)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

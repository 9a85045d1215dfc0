//! Service-tag XML fragments sent with a queue-service registration.

use crate::buffer::DynBuffer;
use crate::error::Result;
use crate::host::HostIdentity;

/// Product URN reported for the telemetry agent itself (audit messages).
pub const AGENT_PRODUCT_ID: &str = "urn:uuid:phonehome-agent";

/// `$<user>`, the per-user domain a registration lands in.
pub fn domain_name(user: &str) -> String {
    format!("${user}")
}

/// Agent fragment identifying the registering client.
pub fn agent_xml(identity: &HostIdentity) -> Result<String> {
    let mut buf = DynBuffer::with_capacity(256)?;
    buf.xml_elem(0, "agent")?;
    buf.xml_nv(1, "agent_urn", &format!("urn:st:{}", identity.asset_id))?;
    buf.xml_nv(1, "agent_version", crate::message::CLIENT_VERSION)?;
    buf.xml_nv(1, "registration_client_urn", &identity.asset_id)?;
    buf.xml_nv(1, "system_id", &identity.system_id)?;
    buf.xml_end(0, "agent")?;
    Ok(into_string(buf))
}

/// Service-tag fragment describing the registered product instance.
pub fn service_tag_xml(identity: &HostIdentity, user: &str) -> Result<String> {
    let mut buf = DynBuffer::with_capacity(512)?;
    buf.xml_elem(0, "service_tag")?;
    buf.xml_nv(1, "instance_urn", &format!("urn:st:{}", identity.asset_id))?;
    buf.xml_nv(1, "product_name", &identity.product_name)?;
    buf.xml_nv(1, "product_urn", &identity.product_id)?;
    buf.xml_nv(1, "product_parent_urn", &identity.product_id)?;
    buf.xml_nv(1, "container", "global")?;
    buf.xml_nv(1, "source", crate::message::CLIENT_NAME)?;
    buf.xml_nv(1, "user", user)?;
    buf.xml_nv(1, "domain_name", &domain_name(user))?;
    buf.xml_end(0, "service_tag")?;
    Ok(into_string(buf))
}

fn into_string(buf: DynBuffer) -> String {
    String::from_utf8_lossy(buf.as_bytes()).into_owned()
}

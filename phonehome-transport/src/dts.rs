//! Queue-service protocol ("DTS").
//!
//! Registration is a form POST to `<dest-url><vpath>/registry` authorized
//! with the plaintext account credential. Every later call is signed:
//!
//! ```text
//! Authorization: Sun-DTS-signed <client-id>\n\t<base64 signature>
//! signature = sign("<METHOD>|<path>|<query or null>|<Date>" || body[..cap])
//! ```
//!
//! Messages are POSTed to `<vpath>/queue/<name>`; the queue operations
//! live in [`crate::queue`].

use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use phonehome_core::props::{defaults, keys, PropertyStore};
use phonehome_core::stag::{self, AGENT_PRODUCT_ID};
use phonehome_core::{
    Credential, DynBuffer, HostIdentity, KeyMaterial, Message, MessageKind, PhoneHomeError,
    ProtocolKind, QueueCategory, RegistrationRecord, Result,
};

use crate::classify::{check_response, server_message};
use crate::http::{headers, Form, HttpResponse, Method, TransportClient};
use crate::protocol::{client_id, signer_from_props, Registration, RegistrationProtocol, SendReceipt};

pub const SOA_AUTH_SCHEME: &str = "Sun-SOA-auth";
pub const SIGNED_SCHEME: &str = "Sun-DTS-signed";

pub const CLIENT_REG_ID: &str = "X-Sun-client-reg-id";
pub const EVENT_TYPE: &str = "X-Sun-event-type";
pub const TELEMETRY_SOURCE: &str = "X-Sun-telemetry-source";
pub const PRODUCT: &str = "X-Sun-product";
pub const SOA_USERNAME: &str = "X-Sun-SOA-username";
pub const CLIENT_CWP_PID: &str = "X-Sun-client-cwp-pid";
pub const DTS_TIME: &str = "X-Sun-DTS-time";

pub const PUB_KEY_FIELD: &str = "X-Sun-pub-key";
pub const STAG_URN_FIELD: &str = "X-Sun-service-tag-urn";
pub const STAG_XML_FIELD: &str = "X-Sun-service-tag-xml";
pub const AGENT_URN_FIELD: &str = "X-Sun-service-tag-agent-urn";
pub const AGENT_XML_FIELD: &str = "X-Sun-service-tag-agent-xml";

const TELEMETRY_SOURCE_VALUE: &str = "FMA";
const REGISTRY: &str = "registry";

/// RFC 1123 date, always GMT.
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// The string that is signed ahead of the body for every signed request.
pub fn canonical_string(method: Method, path: &str, query: Option<&str>, date: &str) -> String {
    format!("{method}|{path}|{}|{date}", query.unwrap_or("null"))
}

/// Name of the queue that receives messages of `category`.
pub fn queue_name(props: &PropertyStore, category: QueueCategory) -> &str {
    let (key, default) = match category {
        QueueCategory::Activation => (keys::DTS_QUEUE_ACTIVATION, "asr-activation"),
        QueueCategory::Audit => (keys::DTS_QUEUE_AUDIT, "asr-audit"),
        QueueCategory::Heartbeat => (keys::DTS_QUEUE_HEARTBEAT, "asr-heartbeat"),
        QueueCategory::Event => (keys::DTS_QUEUE_EVENT, "asr-event"),
        QueueCategory::Admin => (keys::DTS_QUEUE_ADMIN, "asr-admin"),
        QueueCategory::Default => (keys::DTS_QUEUE_DEFAULT, "asr-default"),
    };
    props.get_or(key, default)
}

/// Identity reported by a signed `HEAD` against the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authenticated {
    pub user: Option<String>,
    pub client_pid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DtsProtocol {
    client: TransportClient,
}

impl DtsProtocol {
    pub fn new(client: TransportClient) -> Self {
        Self { client }
    }

    pub(crate) fn vpath(props: &PropertyStore) -> &str {
        props
            .get_or(keys::DTS_VIRTUAL_PATH, defaults::DTS_VIRTUAL_PATH)
            .trim_end_matches('/')
    }

    /// Performs a request signed over the canonical string plus `body`.
    ///
    /// `path` starts at the virtual path and is appended to the registered
    /// URL.
    pub(crate) fn signed_request(
        &self,
        props: &PropertyStore,
        method: Method,
        path: &str,
        extra_headers: &[(&str, String)],
        body: Option<&[u8]>,
    ) -> Result<HttpResponse> {
        let client = client_id(props)?;
        let signer = signer_from_props(props)?;
        let date = http_date(Utc::now());
        let canonical = canonical_string(method, path, None, &date);
        tracing::debug!(canonical = %canonical, "signing request");

        let signature = match body {
            Some(data) if !data.is_empty() => {
                signer.sign_with_prefix_base64(canonical.as_bytes(), data, props.signing_cap())?
            }
            _ => signer.sign_base64(canonical.as_bytes())?,
        };

        let url = format!("{}{path}", props.registered_url().trim_end_matches('/'));
        let mut builder = self
            .client
            .request(props, method, &url)
            .header(headers::DATE, date)
            .header(
                headers::AUTHORIZATION,
                format!("{SIGNED_SCHEME} {client}\n\t{signature}"),
            );
        for (name, value) in extra_headers {
            builder = builder.header(*name, value.clone());
        }
        if let Some(data) = body {
            builder = builder.bytes(data);
        }
        self.client.perform(builder.build()?)
    }

    /// Verifies the stored signing identity against the registry.
    pub fn authenticate(&self, props: &PropertyStore) -> Result<Authenticated> {
        let path = format!("{}/{REGISTRY}", Self::vpath(props));
        let response = self.signed_request(props, Method::Head, &path, &[], None)?;
        check_response(&response, "authenticate")?;
        Ok(Authenticated {
            user: response.headers.get(SOA_USERNAME).map(str::to_string),
            client_pid: response.headers.get(CLIENT_CWP_PID).map(str::to_string),
        })
    }
}

impl RegistrationProtocol for DtsProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Dts
    }

    fn register(
        &self,
        props: &PropertyStore,
        identity: &HostIdentity,
        credential: &Credential,
    ) -> Result<Registration> {
        let key_pair = KeyMaterial::generate(props.keylen() as usize)?;
        let dest_url = props
            .get_or(keys::DEST_URL, defaults::DEST_URL)
            .trim_end_matches('/')
            .to_string();
        let url = format!("{dest_url}{}/{REGISTRY}", Self::vpath(props));
        // The urn fields take the bare asset id.
        let instance_urn = identity.asset_id.clone();

        let form = Form::UrlEncoded(vec![
            (PUB_KEY_FIELD.to_string(), key_pair.public_pem.clone()),
            (STAG_URN_FIELD.to_string(), instance_urn.clone()),
            (
                STAG_XML_FIELD.to_string(),
                stag::service_tag_xml(identity, credential.user())?,
            ),
            (AGENT_URN_FIELD.to_string(), instance_urn),
            (AGENT_XML_FIELD.to_string(), stag::agent_xml(identity)?),
        ]);
        let auth = Zeroizing::new(format!(
            "{SOA_AUTH_SCHEME} {} {}",
            credential.user(),
            credential.password()
        ));
        let request = self
            .client
            .request(props, Method::Post, &url)
            .header(headers::AUTHORIZATION, auth.as_str())
            .header(headers::CONNECTION, "Keep-Alive")
            .form(form)
            .build()?;
        let response = self.client.perform(request)?;

        let status = check_response(&response, "registration")?;
        if status != 200 {
            return Err(PhoneHomeError::Protocol {
                status,
                message: format!("registration: {}", server_message(&response)),
                retry: false,
            });
        }
        let client_id = response
            .headers
            .get(CLIENT_REG_ID)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PhoneHomeError::Protocol {
                status,
                message: "no client id returned from phone home server".into(),
                retry: false,
            })?;

        tracing::info!("registered {} at {url}", credential.user());
        let body = response.body_text();
        Ok(Registration {
            record: RegistrationRecord {
                client_id: client_id.to_string(),
                dest_url,
                domain_id: None,
                domain_name: Some(stag::domain_name(credential.user())),
                system_id: identity.system_id.clone(),
                asset_id: identity.asset_id.clone(),
                user_id: credential.user().to_string(),
                message: (!body.is_empty()).then_some(body),
                code: Some("0".to_string()),
            },
            keys: key_pair,
        })
    }

    fn unregister(&self, props: &PropertyStore) -> Result<()> {
        let client = client_id(props)?;
        let signer = signer_from_props(props)?;
        let signature = signer.sign_base64(client.as_bytes())?;
        let url = format!(
            "{}{}/{REGISTRY}",
            props.registered_url().trim_end_matches('/'),
            Self::vpath(props)
        );
        let request = self
            .client
            .request(props, Method::Delete, &url)
            .header(
                headers::AUTHORIZATION,
                format!("{SIGNED_SCHEME} {client}\n\t{signature}"),
            )
            .build()?;
        let response = self.client.perform(request)?;
        let status = check_response(&response, "unregister")?;
        if status != 200 {
            return Err(PhoneHomeError::Protocol {
                status,
                message: format!("unregister: {}", server_message(&response)),
                retry: false,
            });
        }
        tracing::info!("unregistered {client}");
        Ok(())
    }

    fn send(&self, props: &PropertyStore, message: &Message) -> Result<SendReceipt> {
        let limit = props.get_u64(keys::MAX_MESSAGE_SIZE, defaults::MAX_MESSAGE_SIZE);
        if message.len() as u64 > limit {
            return Err(PhoneHomeError::InvalidRequest(format!(
                "message size {} exceeds the limit of {limit} bytes",
                message.len()
            )));
        }

        let queue = queue_name(props, message.kind.queue_category());
        let path = format!("{}/queue/{queue}", Self::vpath(props));
        let extra = [
            (headers::CONTENT_TYPE, "text/xml".to_string()),
            (TELEMETRY_SOURCE, TELEMETRY_SOURCE_VALUE.to_string()),
            (EVENT_TYPE, message.kind.event_type().to_string()),
            (PRODUCT, product_header(props, message.kind)?),
            (headers::MESSAGE_LENGTH, message.len().to_string()),
        ];
        let response =
            self.signed_request(props, Method::Post, &path, &extra, Some(message.data.as_slice()))?;
        let status = check_response(&response, &format!("{} message", message.kind))?;

        tracing::info!(
            "{} bytes sent to {}{path}",
            message.len(),
            props.registered_url()
        );
        Ok(SendReceipt {
            status,
            bytes: message.len(),
            location: response.headers.get(headers::LOCATION).map(str::to_string),
        })
    }
}

/// Audit messages report the agent itself; everything else the host product.
fn product_header(props: &PropertyStore, kind: MessageKind) -> Result<String> {
    if kind == MessageKind::Audit {
        return Ok(AGENT_PRODUCT_ID.to_string());
    }
    let product = props
        .get(keys::PRODUCT_ID)
        .or_else(|| props.get(keys::PRODUCT_NAME))
        .unwrap_or(defaults::PRODUCT_NAME);
    let mut buf = DynBuffer::new();
    buf.append_xml_token(product)?;
    Ok(buf.as_str().unwrap_or_default().to_string())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use chrono::TimeZone;
    use phonehome_core::{DigestAlgorithm, Signer};

    use crate::http::Body;
    use crate::testing::{registered_store, test_keys, ScriptedEngine};

    const URL: &str = "https://transport.example";

    fn protocol() -> (Arc<ScriptedEngine>, DtsProtocol) {
        let engine = Arc::new(ScriptedEngine::new());
        let dts = DtsProtocol::new(TransportClient::new(engine.clone()));
        (engine, dts)
    }

    fn identity() -> HostIdentity {
        HostIdentity {
            host_id: "node1".into(),
            system_id: "SN1".into(),
            site_id: "SN1".into(),
            asset_id: "asset-1".into(),
            product_id: "SUNW,T5220".into(),
            product_name: "T5220".into(),
        }
    }

    fn signature_of(authorization: &str) -> (String, Vec<u8>) {
        let rest = authorization
            .strip_prefix("Sun-DTS-signed ")
            .expect("signed scheme");
        let (client, sig64) = rest.split_once("\n\t").expect("folded header");
        (client.to_string(), BASE64.decode(sig64).expect("base64"))
    }

    #[test]
    fn http_date_is_rfc1123_gmt() {
        let at = Utc.with_ymd_and_hms(2008, 7, 22, 12, 5, 0).unwrap();
        assert_eq!(http_date(at), "Tue, 22 Jul 2008 12:05:00 GMT");
        assert_eq!(
            canonical_string(Method::Post, "/v1/queue/test", None, &http_date(at)),
            "POST|/v1/queue/test|null|Tue, 22 Jul 2008 12:05:00 GMT"
        );
    }

    #[test]
    fn register_returns_client_id_and_fresh_keys() {
        let (engine, dts) = protocol();
        engine.push(Ok(HttpResponse::new(200).with_header("X-Sun-Client-Reg-Id", "client-77")));
        let props = PropertyStore::in_memory([
            (keys::DEST_URL, "https://dest.example/"),
            (keys::KEYLEN, "512"),
        ]);

        let reg = dts
            .register(&props, &identity(), &Credential::new("ops", "secret"))
            .unwrap();
        assert_eq!(reg.record.client_id, "client-77");
        assert_eq!(reg.record.dest_url, "https://dest.example");
        assert_eq!(reg.record.user_id, "ops");
        assert_eq!(reg.record.domain_name.as_deref(), Some("$ops"));
        assert_eq!(reg.keys.bits, 512);
        assert!(reg.keys.public_pem.contains("BEGIN PUBLIC KEY"));

        let sent = engine.requests().remove(0);
        assert_eq!(sent.method, Method::Post);
        assert_eq!(sent.url, "https://dest.example/v1/registry");
        assert_eq!(sent.header("authorization"), Some("Sun-SOA-auth ops secret"));
        let Body::Form(Form::UrlEncoded(fields)) = &sent.body else {
            panic!("expected urlencoded form, got {:?}", sent.body);
        };
        let field = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(field(PUB_KEY_FIELD), reg.keys.public_pem);
        assert_eq!(field(STAG_URN_FIELD), "asset-1");
        assert_eq!(field(AGENT_URN_FIELD), "asset-1");
        assert!(field(STAG_XML_FIELD).contains("<service_tag>"));
        assert!(field(AGENT_XML_FIELD).contains("<agent>"));
    }

    #[test]
    fn register_rejections_are_classified() {
        let (engine, dts) = protocol();
        let props = PropertyStore::in_memory([(keys::KEYLEN, "512")]);

        engine.push_status(401);
        let err = dts
            .register(&props, &identity(), &Credential::new("ops", "wrong"))
            .unwrap_err();
        assert!(matches!(err, PhoneHomeError::Authentication(_)), "got: {err}");

        engine.push(Ok(HttpResponse::new(500).with_body("registry offline")));
        let err = dts
            .register(&props, &identity(), &Credential::new("ops", "secret"))
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(err.to_string().contains("registry offline"));

        engine.push_status(200);
        let err = dts
            .register(&props, &identity(), &Credential::new("ops", "secret"))
            .unwrap_err();
        assert!(err.to_string().contains("no client id"));
    }

    #[test]
    fn send_signs_canonical_string_and_body() {
        let (engine, dts) = protocol();
        engine.push(Ok(HttpResponse::new(201)
            .with_header("Location", "https://transport.example/v1/queue/asr-event/message/9")));
        let props = registered_store(URL);
        let message = Message::new(MessageKind::Fault, b"<message>fault</message>".to_vec());

        let receipt = dts.send(&props, &message).unwrap();
        assert_eq!(receipt.status, 201);
        assert_eq!(receipt.bytes, message.len());
        assert!(receipt.location.unwrap().ends_with("/message/9"));

        let sent = engine.requests().remove(0);
        assert_eq!(sent.url, "https://transport.example/v1/queue/asr-event");
        assert_eq!(sent.header(EVENT_TYPE), Some("fault"));
        assert_eq!(sent.header(TELEMETRY_SOURCE), Some("FMA"));
        assert_eq!(sent.header(PRODUCT), Some("SUNW_T5220"));
        assert_eq!(sent.header(headers::MESSAGE_LENGTH), Some("24"));

        let date = sent.header("date").unwrap();
        let (client, signature) = signature_of(sent.header("authorization").unwrap());
        assert_eq!(client, "client-1");
        let mut signed = canonical_string(Method::Post, "/v1/queue/asr-event", None, date).into_bytes();
        signed.extend_from_slice(&message.data);
        let signer = Signer::from_keys(test_keys(), DigestAlgorithm::Sha1).unwrap();
        signer.verify(&signed, &signature).expect("signature verifies");
    }

    #[test]
    fn audit_reports_agent_product_and_uses_audit_queue() {
        let (engine, dts) = protocol();
        engine.push_status(201);
        let props = registered_store(URL);
        dts.send(&props, &Message::new(MessageKind::Audit, b"<a/>".to_vec()))
            .unwrap();
        let sent = engine.requests().remove(0);
        assert!(sent.url.ends_with("/v1/queue/asr-audit"));
        assert_eq!(sent.header(PRODUCT), Some(AGENT_PRODUCT_ID));
    }

    #[test]
    fn oversized_message_is_refused_locally() {
        let (engine, dts) = protocol();
        let mut props = registered_store(URL);
        props.set(keys::MAX_MESSAGE_SIZE, "8");
        let err = dts
            .send(&props, &Message::new(MessageKind::Fault, vec![b'x'; 9]))
            .unwrap_err();
        assert!(matches!(err, PhoneHomeError::InvalidRequest(_)));
        assert!(engine.requests().is_empty());
    }

    #[test]
    fn send_failures_carry_retry_class() {
        let (engine, dts) = protocol();
        let props = registered_store(URL);
        let message = Message::new(MessageKind::Fault, b"<m/>".to_vec());

        engine.push_status(409);
        let err = dts.send(&props, &message).unwrap_err();
        assert!(!err.is_retryable() && !err.is_fatal());

        engine.push_status(503);
        assert!(dts.send(&props, &message).unwrap_err().is_retryable());

        engine.push_refused();
        assert!(dts.send(&props, &message).unwrap_err().is_retryable());

        engine.push(Ok(HttpResponse::new(400).with_header("X-Sun-stop-retry", "true")));
        assert!(dts.send(&props, &message).unwrap_err().is_fatal());
    }

    #[test]
    fn unregister_signs_client_id_only() {
        let (engine, dts) = protocol();
        engine.push_status(200);
        let props = registered_store(URL);
        dts.unregister(&props).unwrap();

        let sent = engine.requests().remove(0);
        assert_eq!(sent.method, Method::Delete);
        assert_eq!(sent.url, "https://transport.example/v1/registry");
        let (_, signature) = signature_of(sent.header("authorization").unwrap());
        let signer = Signer::from_keys(test_keys(), DigestAlgorithm::Sha1).unwrap();
        signer.verify(b"client-1", &signature).expect("signature verifies");
    }

    #[test]
    fn authenticate_reads_identity_headers() {
        let (engine, dts) = protocol();
        engine.push(Ok(HttpResponse::new(200)
            .with_header("x-sun-soa-username", "ops")
            .with_header("x-sun-client-cwp-pid", "cwp-5")));
        let auth = dts.authenticate(&registered_store(URL)).unwrap();
        assert_eq!(auth.user.as_deref(), Some("ops"));
        assert_eq!(auth.client_pid.as_deref(), Some("cwp-5"));
        assert_eq!(engine.requests()[0].method, Method::Head);
    }

    #[test]
    fn signed_calls_require_registration() {
        let (engine, dts) = protocol();
        let props = PropertyStore::in_memory(Vec::<(String, String)>::new());
        let err = dts
            .send(&props, &Message::new(MessageKind::Heartbeat, b"<h/>".to_vec()))
            .unwrap_err();
        assert!(matches!(err, PhoneHomeError::NotRegistered));
        assert!(engine.requests().is_empty());
    }
}

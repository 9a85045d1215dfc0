//! Form-post protocol ("SCRK").
//!
//! Registration and unregistration are urlencoded POSTs; messages travel
//! as a multipart upload carrying their own detached signature:
//!
//! ```text
//! signature = sign("<client-id>|<message-type>|<signed-at>" || body[..cap])
//! ```

use chrono::Utc;

use phonehome_core::props::{defaults, keys, PropertyStore};
use phonehome_core::{
    stag, Credential, HostIdentity, KeyMaterial, Message, PhoneHomeError, ProtocolKind,
    RegistrationRecord, Result,
};

use crate::classify::{check_response, server_message};
use crate::dts::http_date;
use crate::http::{Form, FormPart, Method, TransportClient};
use crate::protocol::{client_id, signer_from_props, Registration, RegistrationProtocol, SendReceipt};

const REGISTER_PATH: &str = "/scrk/register";
const UNREGISTER_PATH: &str = "/scrk/unregister";
const MESSAGE_PATH: &str = "/scrk/message";

pub const CLIENT_REG_ID: &str = "client-reg-id";
pub const DOMAIN_ID: &str = "domain-id";
pub const DOMAIN_NAME: &str = "domain-name";

#[derive(Debug, Clone)]
pub struct ScrkProtocol {
    client: TransportClient,
}

impl ScrkProtocol {
    pub fn new(client: TransportClient) -> Self {
        Self { client }
    }

    fn post(&self, props: &PropertyStore, url: &str, form: Form) -> Result<crate::http::HttpResponse> {
        let request = self.client.request(props, Method::Post, url).form(form).build()?;
        self.client.perform(request)
    }
}

impl RegistrationProtocol for ScrkProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Scrk
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
        let url = format!("{dest_url}{REGISTER_PATH}");

        let fields = [
            ("username", credential.user()),
            ("password", credential.password()),
            ("public-key", key_pair.public_pem.as_str()),
            ("asset-id", identity.asset_id.as_str()),
            ("system-id", identity.system_id.as_str()),
            ("product-id", identity.product_id.as_str()),
            ("host-name", identity.host_id.as_str()),
        ];
        let form = Form::UrlEncoded(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let response = self.post(props, &url, form)?;
        let status = check_response(&response, "registration")?;
        let body = response.body_text();
        if status != 200 {
            return Err(PhoneHomeError::Protocol {
                status,
                message: format!("registration: {}", server_message(&response)),
                retry: false,
            });
        }

        let client_id = element(&body, CLIENT_REG_ID).ok_or_else(|| PhoneHomeError::Protocol {
            status,
            message: "no client id returned from phone home server".into(),
            retry: false,
        })?;
        tracing::info!("registered {} at {url}", credential.user());

        Ok(Registration {
            record: RegistrationRecord {
                client_id,
                dest_url,
                domain_id: element(&body, DOMAIN_ID),
                domain_name: element(&body, DOMAIN_NAME)
                    .or_else(|| Some(stag::domain_name(credential.user()))),
                system_id: identity.system_id.clone(),
                asset_id: identity.asset_id.clone(),
                user_id: credential.user().to_string(),
                message: None,
                code: Some("0".to_string()),
            },
            keys: key_pair,
        })
    }

    fn unregister(&self, props: &PropertyStore) -> Result<()> {
        let client = client_id(props)?;
        let signature = signer_from_props(props)?.sign_base64(client.as_bytes())?;
        let url = format!(
            "{}{UNREGISTER_PATH}",
            props.registered_url().trim_end_matches('/')
        );
        let form = Form::UrlEncoded(vec![
            (CLIENT_REG_ID.to_string(), client.to_string()),
            ("signature".to_string(), signature),
        ]);
        let response = self.post(props, &url, form)?;
        check_response(&response, "unregister")?;
        tracing::info!("unregistered {client}");
        Ok(())
    }

    fn send(&self, props: &PropertyStore, message: &Message) -> Result<SendReceipt> {
        let client = client_id(props)?;
        let signer = signer_from_props(props)?;
        let message_type = message.kind.event_type();
        let signed_at = http_date(Utc::now());
        let prefix = format!("{client}|{message_type}|{signed_at}");
        let signature =
            signer.sign_with_prefix_base64(prefix.as_bytes(), &message.data, props.signing_cap())?;

        let url = format!("{}{MESSAGE_PATH}", props.registered_url().trim_end_matches('/'));
        let form = Form::Multipart(vec![
            FormPart::text(CLIENT_REG_ID, client),
            FormPart::text("message-type", message_type),
            FormPart::text("signed-at", signed_at),
            FormPart::text("signature", signature),
            FormPart::File {
                name: "message".into(),
                filename: "message.xml".into(),
                content_type: "text/xml".into(),
                data: message.data.clone(),
            },
        ]);
        let response = self.post(props, &url, form)?;
        let status = check_response(&response, &format!("{} message", message.kind))?;
        tracing::info!("{} bytes sent to {url}", message.len());
        Ok(SendReceipt {
            status,
            bytes: message.len(),
            location: None,
        })
    }
}

/// Text of the first `<name>…</name>` element, entity-decoded and trimmed.
fn element(xml: &str, name: &str) -> Option<String> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    let text = xml[start..end]
        .trim()
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    (!text.is_empty()).then_some(text)
}

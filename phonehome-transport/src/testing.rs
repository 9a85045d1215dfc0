//! In-memory [`HttpEngine`] for exercising protocols without a network.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, OnceLock};

use phonehome_core::props::{self, PropertyStore};
use phonehome_core::{KeyMaterial, PhoneHomeError, Result};

use crate::http::{HttpEngine, HttpRequest, HttpResponse};

/// Replays queued responses in order and records every request performed.
///
/// An exhausted script answers with a transport failure, the same as an
/// unreachable server.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    responses: Mutex<VecDeque<Result<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: Result<HttpResponse>) {
        lock(&self.responses).push_back(response);
    }

    pub fn push_status(&self, status: u16) {
        self.push(Ok(HttpResponse::new(status)));
    }

    pub fn push_refused(&self) {
        self.push(Err(PhoneHomeError::Transport(
            "connection refused".to_string(),
        )));
    }

    /// Requests performed so far, oldest first.
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.responses).len()
    }
}

impl HttpEngine for ScriptedEngine {
    fn perform(&self, request: &HttpRequest) -> Result<HttpResponse> {
        lock(&self.requests).push(request.clone());
        lock(&self.responses).pop_front().unwrap_or_else(|| {
            Err(PhoneHomeError::Transport(format!(
                "no scripted response for {} {}",
                request.method, request.url
            )))
        })
    }
}

/// A 512-bit key pair shared by every test in the binary.
pub fn test_keys() -> &'static KeyMaterial {
    static KEYS: OnceLock<KeyMaterial> = OnceLock::new();
    KEYS.get_or_init(|| match KeyMaterial::generate(512) {
        Ok(keys) => keys,
        Err(err) => panic!("test key generation failed: {err}"),
    })
}

/// A store holding a complete registration against `url`.
pub fn registered_store(url: &str) -> PropertyStore {
    let keys = test_keys();
    PropertyStore::in_memory([
        (props::keys::REG_CLIENT_ID, "client-1"),
        (props::keys::REG_URL, url),
        (props::keys::REG_MSG_KEY, keys.private_pem.as_str()),
        (props::keys::REG_PUB_KEY, keys.public_pem.as_str()),
        (props::keys::REG_SYSTEM_ID, "SN1"),
        (props::keys::REG_ASSET_ID, "asset-1"),
        (props::keys::SYSTEM_ID, "SN1"),
        (props::keys::ASSET_ID, "asset-1"),
        (props::keys::PRODUCT_ID, "SUNW,T5220"),
        (props::keys::KEYLEN, "512"),
    ])
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

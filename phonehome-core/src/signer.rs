//! Request signing and client key material.
//!
//! Signatures are RSA PKCS#1 v1.5 over a digest of the signed bytes. For
//! prefixed signing the digest is fed `prefix` and then at most `body_cap`
//! bytes of the body, so large bodies are never concatenated in memory and
//! content past the cap is not covered by the signature.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{PhoneHomeError, Result};

/// Smallest modulus accepted for new keys.
pub const MIN_KEY_BITS: usize = 512;

// ---------------------------------------------------------------------------
// Digest selection
// ---------------------------------------------------------------------------

/// Digest applied before the RSA operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DigestAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl FromStr for DigestAlgorithm {
    type Err = PhoneHomeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(DigestAlgorithm::Sha1),
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            other => Err(PhoneHomeError::Configuration(format!(
                "unsupported signature digest '{other}'"
            ))),
        }
    }
}

impl DigestAlgorithm {
    fn digest(self, prefix: &[u8], body: &[u8]) -> (Pkcs1v15Sign, Vec<u8>) {
        match self {
            DigestAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                hasher.update(prefix);
                hasher.update(body);
                (Pkcs1v15Sign::new::<Sha1>(), hasher.finalize().to_vec())
            }
            DigestAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(prefix);
                hasher.update(body);
                (Pkcs1v15Sign::new::<Sha256>(), hasher.finalize().to_vec())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// KeyMaterial
// ---------------------------------------------------------------------------

/// A client signing identity in PEM form.
#[derive(Clone)]
pub struct KeyMaterial {
    /// SubjectPublicKeyInfo PEM (`BEGIN PUBLIC KEY`).
    pub public_pem: String,
    /// PKCS#1 PEM (`BEGIN RSA PRIVATE KEY`), wiped on drop.
    pub private_pem: Zeroizing<String>,
    pub bits: usize,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bits", &self.bits)
            .field("fingerprint", &fingerprint(&self.public_pem))
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Generates a fresh RSA key pair of `bits` length.
    pub fn generate(bits: usize) -> Result<Self> {
        if bits < MIN_KEY_BITS {
            return Err(PhoneHomeError::Configuration(format!(
                "key length {bits} is below the minimum of {MIN_KEY_BITS}"
            )));
        }
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| PhoneHomeError::Crypto(format!("key generation failed: {e}")))?;
        let public = RsaPublicKey::from(&private);

        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| PhoneHomeError::Crypto(format!("public key encoding failed: {e}")))?;
        let private_pem = private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| PhoneHomeError::Crypto(format!("private key encoding failed: {e}")))?;

        tracing::debug!(bits, "generated client key pair");
        Ok(Self {
            public_pem,
            private_pem: Zeroizing::new(private_pem.to_string()),
            bits,
        })
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_pem)
    }
}

/// Hex SHA-256 of a public key PEM, for display.
pub fn fingerprint(public_pem: &str) -> String {
    hex::encode(Sha256::digest(public_pem.trim().as_bytes()))
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

/// A parsed private key ready to sign.
pub struct Signer {
    key: RsaPrivateKey,
    digest: DigestAlgorithm,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Parses a PKCS#1 or PKCS#8 private key PEM.
    pub fn from_pem(private_pem: &str, digest: DigestAlgorithm) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs1_pem(private_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(private_pem))
            .map_err(|e| PhoneHomeError::Crypto(format!("invalid private key: {e}")))?;
        Ok(Self { key, digest })
    }

    pub fn from_keys(keys: &KeyMaterial, digest: DigestAlgorithm) -> Result<Self> {
        Self::from_pem(&keys.private_pem, digest)
    }

    /// Signature over `bytes`.
    pub fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.sign_parts(b"", bytes)
    }

    /// Signature over `prefix || body[..min(body.len(), body_cap)]`.
    pub fn sign_with_prefix(&self, prefix: &[u8], body: &[u8], body_cap: usize) -> Result<Vec<u8>> {
        let signed_len = body.len().min(body_cap);
        if signed_len < body.len() {
            tracing::debug!(
                body_len = body.len(),
                body_cap,
                "body exceeds signing cap; signing truncated prefix"
            );
        }
        self.sign_parts(prefix, &body[..signed_len])
    }

    pub fn sign_base64(&self, bytes: &[u8]) -> Result<String> {
        self.sign(bytes).map(|sig| BASE64.encode(sig))
    }

    pub fn sign_with_prefix_base64(
        &self,
        prefix: &[u8],
        body: &[u8],
        body_cap: usize,
    ) -> Result<String> {
        self.sign_with_prefix(prefix, body, body_cap)
            .map(|sig| BASE64.encode(sig))
    }

    /// Checks `signature` over `bytes` against the public half of this key.
    pub fn verify(&self, bytes: &[u8], signature: &[u8]) -> Result<()> {
        let (scheme, hashed) = self.digest.digest(b"", bytes);
        RsaPublicKey::from(&self.key)
            .verify(scheme, &hashed, signature)
            .map_err(|e| PhoneHomeError::Crypto(format!("signature mismatch: {e}")))
    }

    fn sign_parts(&self, prefix: &[u8], body: &[u8]) -> Result<Vec<u8>> {
        let (scheme, hashed) = self.digest.digest(prefix, body);
        self.key
            .sign(scheme, &hashed)
            .map_err(|e| PhoneHomeError::Crypto(format!("signing failed: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

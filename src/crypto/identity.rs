// Node identity: long-lived ECDSA P-256 keypair.
//
// The node id is the SHA-256 hex digest of the compressed public key; it is
// the stable identity peers key their records on. Signed requests cover a
// canonical-JSON payload (sorted keys, no whitespace) so that both sides
// serialize the exact same bytes.

use std::collections::BTreeMap;
use std::path::Path;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::crypto::hash::sha256_hex;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed key file: {0}")]
    Malformed(&'static str),
    #[error("key material rejected")]
    Crypto,
}

#[derive(Serialize, Deserialize)]
struct StoredNodeKey {
    private_key: String,
    public_key: String,
}

pub struct NodeIdentity {
    signing_key: SigningKey,
    pub public_key_hex: String,
    pub node_id: String,
}

impl NodeIdentity {
    /// Load the keypair from disk, generating and persisting a fresh one on
    /// first start. The key file is chmod 0600 on unix.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if let Ok(raw) = std::fs::read_to_string(path) {
            let stored: StoredNodeKey =
                serde_json::from_str(&raw).map_err(|_| IdentityError::Malformed("bad json"))?;
            let sk_bytes =
                hex::decode(&stored.private_key).map_err(|_| IdentityError::Malformed("bad hex"))?;
            let signing_key =
                SigningKey::from_slice(&sk_bytes).map_err(|_| IdentityError::Crypto)?;
            return Ok(Self::from_signing_key(signing_key));
        }

        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let identity = Self::from_signing_key(signing_key);
        identity.persist(path)?;
        Ok(identity)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let compressed = verifying_key.to_encoded_point(true);
        let public_key_hex = hex::encode(compressed.as_bytes());
        let node_id = sha256_hex(compressed.as_bytes());
        NodeIdentity {
            signing_key,
            public_key_hex,
            node_id,
        }
    }

    fn persist(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = StoredNodeKey {
            private_key: hex::encode(self.signing_key.to_bytes()),
            public_key: self.public_key_hex.clone(),
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&stored).unwrap_or_default())?;
        std::fs::rename(&tmp, path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(path) {
                let mut perms = meta.permissions();
                perms.set_mode(0o600);
                let _ = std::fs::set_permissions(path, perms);
            }
        }
        Ok(())
    }

    /// Sign raw payload bytes, returning the 64-byte r||s signature as hex.
    pub fn sign(&self, payload: &[u8]) -> String {
        let signature: Signature = self.signing_key.sign(payload);
        hex::encode(signature.to_bytes())
    }
}

/// Verify an r||s hex signature over `payload` against a compressed-point
/// public key. Any malformed input simply fails verification.
pub fn verify_signature(public_key_hex: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(pk_bytes) = hex::decode(public_key_hex) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(&pk_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    verifying_key.verify(payload, &signature).is_ok()
}

/// The node id a given public key implies.
pub fn node_id_for(public_key_hex: &str) -> Option<String> {
    let bytes = hex::decode(public_key_hex).ok()?;
    Some(sha256_hex(&bytes))
}

/// Canonical JSON: object keys sorted, no extraneous whitespace.
/// `serde_json::Map` is key-ordered, so a compact serialization of a
/// `Value` built through it is already canonical.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Build the payload every signed request covers: the raw body string, the
/// timestamp, the nonce, and any extra `x-denaro-*` bound values.
pub fn signed_payload(
    body: &str,
    timestamp: i64,
    nonce: &str,
    extras: &BTreeMap<String, Value>,
) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("body".to_string(), Value::String(body.to_string()));
    map.insert("timestamp".to_string(), Value::from(timestamp));
    map.insert("nonce".to_string(), Value::String(nonce.to_string()));
    for (k, v) in extras {
        map.insert(k.clone(), v.clone());
    }
    Value::Object(map)
}

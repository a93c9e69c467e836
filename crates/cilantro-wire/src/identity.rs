//! Node identity keys.
//!
//! Each node has a long-term Ed25519 signing key pair. Its X25519 encryption
//! key pair is derived deterministically from the signing key, and any peer's
//! verifying key maps to that peer's encryption public key through the
//! Edwards-to-Montgomery conversion. Peers can therefore be addressed (and
//! authenticated) by verifying key alone.

use crate::error::{WireError, WireResult};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use std::sync::{Arc, RwLock};
use x25519_dalek::{PublicKey as EncryptionPublicKey, StaticSecret};
use zeroize::Zeroizing;

/// A node's signing and encryption key pairs.
pub struct NodeKeys {
    signing: SigningKey,
    encryption_secret: StaticSecret,
    encryption_public: EncryptionPublicKey,
}

impl NodeKeys {
    /// Derive all keys from an Ed25519 signing key.
    pub fn from_signing_key(signing: SigningKey) -> Self {
        let encryption_secret = StaticSecret::from(signing.to_scalar_bytes());
        let encryption_public = EncryptionPublicKey::from(&encryption_secret);
        Self {
            signing,
            encryption_secret,
            encryption_public,
        }
    }

    /// Derive all keys from a hex-encoded 32-byte seed.
    pub fn from_seed_hex(seed_hex: &str) -> WireResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(seed_hex.trim())
                .map_err(|e| WireError::SecurityConfig(format!("invalid signing key hex: {e}")))?,
        );
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            WireError::SecurityConfig(format!(
                "signing key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed)))
    }

    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Hex-encoded verifying key, the node's network identity.
    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    /// Hex-encoded signing seed.
    pub fn seed_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing.to_bytes()))
    }

    pub fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption_secret
    }

    pub fn encryption_public(&self) -> &EncryptionPublicKey {
        &self.encryption_public
    }

    /// Hex of the encryption public key; names the node's certs directory.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.encryption_public.as_bytes())
    }

    /// X25519 shared secret with a remote encryption key.
    pub fn diffie_hellman(&self, remote: &EncryptionPublicKey) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.encryption_secret.diffie_hellman(remote).to_bytes())
    }
}

impl fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeys")
            .field("verifying_key", &self.verifying_key_hex())
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Convert a hex verifying key into the peer's encryption public key.
pub fn verifying_key_to_encryption_pubkey(vk_hex: &str) -> WireResult<EncryptionPublicKey> {
    let bytes: [u8; 32] = decode_key_hex(vk_hex, "verifying key")?;
    let vk = VerifyingKey::from_bytes(&bytes)
        .map_err(|e| WireError::SecurityConfig(format!("invalid verifying key {vk_hex}: {e}")))?;
    Ok(EncryptionPublicKey::from(vk.to_montgomery().to_bytes()))
}

/// Parse a hex encryption public key.
pub fn parse_encryption_pubkey(hex_key: &str) -> WireResult<EncryptionPublicKey> {
    let bytes: [u8; 32] = decode_key_hex(hex_key, "encryption public key")?;
    Ok(EncryptionPublicKey::from(bytes))
}

fn decode_key_hex(value: &str, what: &str) -> WireResult<[u8; 32]> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| WireError::SecurityConfig(format!("invalid {what} hex: {e}")))?;
    bytes.as_slice().try_into().map_err(|_| {
        WireError::SecurityConfig(format!("{what} must be 32 bytes, got {}", bytes.len()))
    })
}

/// Source of the node's identity keys.
pub trait IdentityProvider: Send + Sync {
    /// The node's keys, or [`WireError::SecurityConfig`] if not yet set up.
    fn node_keys(&self) -> WireResult<Arc<NodeKeys>>;

    fn verifying_key_to_encryption_pubkey(&self, vk_hex: &str) -> WireResult<EncryptionPublicKey> {
        verifying_key_to_encryption_pubkey(vk_hex)
    }
}

/// Process-wide holder for the node's keys. Starts empty; secure sockets
/// refuse to connect or bind until [`KeyRing::initialize`] is called.
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: RwLock<Option<Arc<NodeKeys>>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(keys: NodeKeys) -> Self {
        Self {
            keys: RwLock::new(Some(Arc::new(keys))),
        }
    }

    /// Install the node's keys, replacing any previous identity.
    pub fn initialize(&self, keys: NodeKeys) -> Arc<NodeKeys> {
        let keys = Arc::new(keys);
        let mut slot = self.keys.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::clone(&keys));
        keys
    }

    pub fn is_initialized(&self) -> bool {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl IdentityProvider for KeyRing {
    fn node_keys(&self) -> WireResult<Arc<NodeKeys>> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                WireError::SecurityConfig("node identity keys have not been initialized".into())
            })
    }
}

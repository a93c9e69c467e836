//! File-based authorization of peer encryption keys.
//!
//! A secure bind only accepts peers whose encryption public key is listed in
//! the security domain's key directory:
//!
//! ```text
//! {certs_dir}/{fingerprint}/authorized_keys/{pubkey}.key   domain "*"
//! {certs_dir}/{fingerprint}/{domain}/{pubkey}.key          other domains
//! ```
//!
//! `fingerprint` is the hex encryption public key of the local node, so
//! several nodes can share one `certs_dir`.

use crate::error::{WireError, WireResult};
use crate::identity::{verifying_key_to_encryption_pubkey, NodeKeys};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use x25519_dalek::PublicKey as EncryptionPublicKey;

/// The catch-all security domain.
pub const DEFAULT_DOMAIN: &str = "*";

const DEFAULT_DOMAIN_DIR: &str = "authorized_keys";
const KEY_FILE_EXT: &str = "key";

/// Decides whether a peer key may connect under a security domain.
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, pubkey: &EncryptionPublicKey, domain: &str) -> bool;
}

/// Per-node, per-domain authorized-keys directory tree.
#[derive(Debug, Clone)]
pub struct AuthStore {
    base_dir: PathBuf,
}

impl AuthStore {
    /// Prepare the node's key directories and authorize the node's own key
    /// in the default domain. With `reset`, previously authorized keys are
    /// removed first.
    pub fn open(certs_dir: &Path, keys: &NodeKeys, reset: bool) -> WireResult<Self> {
        let store = Self {
            base_dir: certs_dir.join(keys.fingerprint()),
        };
        if reset && store.base_dir.exists() {
            info!(dir = %store.base_dir.display(), "Resetting authorized keys");
            std::fs::remove_dir_all(&store.base_dir)?;
        }
        std::fs::create_dir_all(store.domain_dir(DEFAULT_DOMAIN)?)?;
        store.authorize(keys.encryption_public(), DEFAULT_DOMAIN)?;
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding the keys of `domain`.
    pub fn domain_dir(&self, domain: &str) -> WireResult<PathBuf> {
        if domain == DEFAULT_DOMAIN {
            return Ok(self.base_dir.join(DEFAULT_DOMAIN_DIR));
        }
        if domain.is_empty()
            || domain == "."
            || domain.contains("..")
            || domain.contains('/')
            || domain.contains('\\')
        {
            return Err(WireError::SecurityConfig(format!(
                "invalid security domain '{domain}'"
            )));
        }
        Ok(self.base_dir.join(domain))
    }

    fn key_file(&self, pubkey: &EncryptionPublicKey, domain: &str) -> WireResult<PathBuf> {
        Ok(self
            .domain_dir(domain)?
            .join(format!("{}.{KEY_FILE_EXT}", hex::encode(pubkey.as_bytes()))))
    }

    /// Authorize a key. Re-authorizing overwrites the existing entry.
    pub fn authorize(&self, pubkey: &EncryptionPublicKey, domain: &str) -> WireResult<()> {
        let path = self.key_file(pubkey, domain)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = format!(
            "#   ****  Generated on {} by cilantro  ****\n\
             #   Cilantro authorized public key\n\
             public-key = \"{}\"\n",
            chrono::Utc::now().to_rfc3339(),
            hex::encode(pubkey.as_bytes())
        );
        std::fs::write(&path, contents)?;
        debug!(domain, path = %path.display(), "Authorized public key");
        Ok(())
    }

    /// Authorize the encryption key derived from a verifying key.
    pub fn authorize_vk(&self, vk_hex: &str, domain: &str) -> WireResult<()> {
        self.authorize(&verifying_key_to_encryption_pubkey(vk_hex)?, domain)
    }

    /// Revoke a key. Revoking an absent key is a no-op.
    pub fn revoke(&self, pubkey: &EncryptionPublicKey, domain: &str) -> WireResult<()> {
        let path = self.key_file(pubkey, domain)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(domain, path = %path.display(), "Revoked public key");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn revoke_vk(&self, vk_hex: &str, domain: &str) -> WireResult<()> {
        self.revoke(&verifying_key_to_encryption_pubkey(vk_hex)?, domain)
    }

    /// Hex keys authorized in `domain`, sorted.
    pub fn list(&self, domain: &str) -> WireResult<Vec<String>> {
        let dir = self.domain_dir(domain)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(KEY_FILE_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

impl Authorizer for AuthStore {
    fn is_authorized(&self, pubkey: &EncryptionPublicKey, domain: &str) -> bool {
        self.key_file(pubkey, domain)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }
}

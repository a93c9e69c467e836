//! Secure channel upgrade.
//!
//! A socket marked secure configures authenticated encryption before it
//! connects or binds:
//!
//! - **connect**: the server's expected encryption key is derived from the
//!   remote verifying key; the client proves possession of its own key.
//! - **bind**: the server accepts only clients whose encryption key is
//!   authorized in the socket's security domain.
//!
//! The exchange is a static-static X25519 agreement. Both sides contribute a
//! random nonce, derive session keys with HMAC-SHA256 and confirm them with
//! tags compared in constant time. Afterwards each record body is sealed with
//! AES-256-GCM using per-direction keys and counters.

use crate::auth::Authorizer;
use crate::error::{WireError, WireResult};
use crate::identity::{parse_encryption_pubkey, IdentityProvider, NodeKeys};
use crate::message::{read_handshake, write_handshake, HandshakeMessage};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};
use x25519_dalek::PublicKey as EncryptionPublicKey;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const KDF_LABEL: &[u8] = b"cilantro-secure-v1";
const NONCE_LEN: usize = 32;

fn hmac(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key size");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn tags_match(expected: &[u8], received_hex: &str) -> bool {
    match hex::decode(received_hex) {
        Ok(received) => subtle::ConstantTimeEq::ct_eq(expected, received.as_slice()).into(),
        Err(_) => false,
    }
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Settings for a secure connect.
#[derive(Clone)]
pub struct ClientSecurity {
    keys: Arc<NodeKeys>,
    server_key: EncryptionPublicKey,
    domain: String,
}

impl ClientSecurity {
    pub fn server_key(&self) -> &EncryptionPublicKey {
        &self.server_key
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Debug for ClientSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecurity")
            .field("server_key", &hex::encode(self.server_key.as_bytes()))
            .field("domain", &self.domain)
            .finish()
    }
}

/// Settings for a secure bind.
#[derive(Clone)]
pub struct ServerSecurity {
    keys: Arc<NodeKeys>,
    domain: String,
    authorizer: Arc<dyn Authorizer>,
}

impl ServerSecurity {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Debug for ServerSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSecurity")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Builds the security settings a secure socket applies before connecting
/// or binding.
pub struct SecureChannel;

impl SecureChannel {
    /// Client-side settings for reaching the peer identified by `server_vk`.
    pub fn for_connect(
        identity: &dyn IdentityProvider,
        server_vk: &str,
        domain: &str,
    ) -> WireResult<ClientSecurity> {
        let keys = identity.node_keys()?;
        if server_vk.is_empty() {
            return Err(WireError::SecurityConfig(
                "secure connect requires the server's verifying key".into(),
            ));
        }
        let server_key = identity.verifying_key_to_encryption_pubkey(server_vk)?;
        Ok(ClientSecurity {
            keys,
            server_key,
            domain: domain.to_string(),
        })
    }

    /// Server-side settings accepting clients authorized in `domain`.
    pub fn for_bind(
        identity: &dyn IdentityProvider,
        authorizer: Option<Arc<dyn Authorizer>>,
        domain: &str,
    ) -> WireResult<ServerSecurity> {
        let keys = identity.node_keys()?;
        let authorizer = authorizer.ok_or_else(|| {
            WireError::SecurityConfig("secure bind requires an authorization store".into())
        })?;
        Ok(ServerSecurity {
            keys,
            domain: domain.to_string(),
            authorizer,
        })
    }
}

struct SessionKeys {
    client_to_server: Zeroizing<[u8; 32]>,
    server_to_client: Zeroizing<[u8; 32]>,
    server_confirm: [u8; 32],
    client_confirm: [u8; 32],
}

fn derive_session(
    shared: &[u8; 32],
    domain: &str,
    client_key: &EncryptionPublicKey,
    server_key: &EncryptionPublicKey,
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> SessionKeys {
    let prk = Zeroizing::new(hmac(
        shared,
        &[
            KDF_LABEL,
            domain.as_bytes(),
            client_key.as_bytes(),
            server_key.as_bytes(),
            client_nonce,
            server_nonce,
        ],
    ));
    SessionKeys {
        client_to_server: Zeroizing::new(hmac(&prk[..], &[b"c2s"])),
        server_to_client: Zeroizing::new(hmac(&prk[..], &[b"s2c"])),
        server_confirm: hmac(&prk[..], &[b"server-confirm"]),
        client_confirm: hmac(&prk[..], &[b"client-confirm"]),
    }
}

/// Encrypts outbound record bodies.
pub struct Sealer {
    cipher: Aes256Gcm,
    counter: u64,
}

/// Decrypts inbound record bodies.
pub struct Opener {
    cipher: Aes256Gcm,
    counter: u64,
}

fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn new_cipher(key: &[u8; 32]) -> WireResult<Aes256Gcm> {
    <Aes256Gcm as KeyInit>::new_from_slice(key)
        .map_err(|e| WireError::Handshake(format!("invalid session key: {e}")))
}

impl Sealer {
    pub fn seal(&mut self, plaintext: &[u8]) -> WireResult<Vec<u8>> {
        let nonce = counter_nonce(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| WireError::Framing("send counter exhausted".into()))?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| WireError::Framing("encryption failed".into()))
    }
}

impl Opener {
    pub fn open(&mut self, ciphertext: &[u8]) -> WireResult<Vec<u8>> {
        let nonce = counter_nonce(self.counter);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| WireError::Framing("record failed authentication".into()))?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| WireError::Framing("receive counter exhausted".into()))?;
        Ok(plaintext)
    }
}

/// Run the client side of the secure exchange.
pub async fn client_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    security: &ClientSecurity,
) -> WireResult<(Sealer, Opener)>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let client_key = *security.keys.encryption_public();
    let client_nonce = random_nonce();
    write_handshake(
        writer,
        &HandshakeMessage::Hello {
            public_key: hex::encode(client_key.as_bytes()),
            domain: security.domain.clone(),
            nonce: hex::encode(client_nonce),
        },
    )
    .await?;

    let (server_nonce, auth_tag) = match read_handshake(reader).await? {
        HandshakeMessage::Welcome { nonce, auth_tag } => (nonce, auth_tag),
        HandshakeMessage::Error { code, message } => {
            return Err(WireError::Handshake(format!(
                "server rejected secure channel ({code}): {message}"
            )));
        }
        other => {
            return Err(WireError::Handshake(format!(
                "unexpected reply to hello: {other:?}"
            )));
        }
    };
    let server_nonce = hex::decode(&server_nonce)
        .map_err(|e| WireError::Handshake(format!("invalid server nonce: {e}")))?;

    let shared = security.keys.diffie_hellman(&security.server_key);
    let session = derive_session(
        &shared,
        &security.domain,
        &client_key,
        &security.server_key,
        &client_nonce,
        &server_nonce,
    );
    if !tags_match(&session.server_confirm, &auth_tag) {
        return Err(WireError::Handshake(
            "server failed key confirmation (unexpected server identity)".into(),
        ));
    }

    write_handshake(
        writer,
        &HandshakeMessage::Initiate {
            auth_tag: hex::encode(session.client_confirm),
        },
    )
    .await?;

    debug!(domain = %security.domain, "Secure channel established (client)");
    Ok((
        Sealer {
            cipher: new_cipher(&session.client_to_server)?,
            counter: 0,
        },
        Opener {
            cipher: new_cipher(&session.server_to_client)?,
            counter: 0,
        },
    ))
}

/// Run the server side of the secure exchange. Returns the session halves and
/// the authenticated client key.
pub async fn server_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    security: &ServerSecurity,
) -> WireResult<(Sealer, Opener, EncryptionPublicKey)>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let (client_key_hex, domain, client_nonce) = match read_handshake(reader).await? {
        HandshakeMessage::Hello {
            public_key,
            domain,
            nonce,
        } => (public_key, domain, nonce),
        other => {
            reject(writer, 401, "secure channel required: send hello first").await?;
            return Err(WireError::Handshake(format!(
                "expected hello, got {other:?}"
            )));
        }
    };

    if domain != security.domain {
        reject(writer, 403, "security domain mismatch").await?;
        return Err(WireError::Handshake(format!(
            "client asked for domain '{domain}', socket serves '{}'",
            security.domain
        )));
    }

    let client_key = parse_encryption_pubkey(&client_key_hex)?;
    if !security.authorizer.is_authorized(&client_key, &security.domain) {
        warn!(
            domain = %security.domain,
            key = %client_key_hex,
            "Rejected unauthorized peer"
        );
        reject(writer, 403, "public key not authorized").await?;
        return Err(WireError::Handshake(format!(
            "key {client_key_hex} is not authorized in domain '{}'",
            security.domain
        )));
    }

    let client_nonce = hex::decode(&client_nonce)
        .map_err(|e| WireError::Handshake(format!("invalid client nonce: {e}")))?;
    let server_nonce = random_nonce();
    let server_key = *security.keys.encryption_public();
    let shared = security.keys.diffie_hellman(&client_key);
    let session = derive_session(
        &shared,
        &security.domain,
        &client_key,
        &server_key,
        &client_nonce,
        &server_nonce,
    );

    write_handshake(
        writer,
        &HandshakeMessage::Welcome {
            nonce: hex::encode(server_nonce),
            auth_tag: hex::encode(session.server_confirm),
        },
    )
    .await?;

    match read_handshake(reader).await? {
        HandshakeMessage::Initiate { auth_tag } if tags_match(&session.client_confirm, &auth_tag) => {}
        HandshakeMessage::Initiate { .. } => {
            return Err(WireError::Handshake(
                "client failed key confirmation".into(),
            ));
        }
        other => {
            return Err(WireError::Handshake(format!(
                "expected initiate, got {other:?}"
            )));
        }
    }

    debug!(domain = %security.domain, "Secure channel established (server)");
    Ok((
        Sealer {
            cipher: new_cipher(&session.server_to_client)?,
            counter: 0,
        },
        Opener {
            cipher: new_cipher(&session.client_to_server)?,
            counter: 0,
        },
        client_key,
    ))
}

async fn reject<W>(writer: &mut W, code: i32, message: &str) -> WireResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_handshake(
        writer,
        &HandshakeMessage::Error {
            code,
            message: message.to_string(),
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthStore, DEFAULT_DOMAIN};
    use crate::identity::KeyRing;

    struct AllowList(Vec<[u8; 32]>);

    impl Authorizer for AllowList {
        fn is_authorized(&self, pubkey: &EncryptionPublicKey, _domain: &str) -> bool {
            self.0.contains(pubkey.as_bytes())
        }
    }

    #[test]
    fn test_hmac_matches_rfc4231_vector() {
        // RFC 4231 test case 2, split across parts.
        let tag = hmac(b"Jefe", &[b"what do ya want ".as_slice(), b"for nothing?".as_slice()]);
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    fn ring() -> KeyRing {
        KeyRing::with_keys(NodeKeys::generate())
    }

    #[test]
    fn test_requires_initialized_keys() {
        let empty = KeyRing::new();
        let peer = NodeKeys::generate();
        assert!(matches!(
            SecureChannel::for_connect(&empty, &peer.verifying_key_hex(), DEFAULT_DOMAIN),
            Err(WireError::SecurityConfig(_))
        ));
        assert!(matches!(
            SecureChannel::for_bind(&empty, Some(Arc::new(AllowList(vec![]))), DEFAULT_DOMAIN),
            Err(WireError::SecurityConfig(_))
        ));
    }

    #[test]
    fn test_connect_requires_server_vk() {
        assert!(matches!(
            SecureChannel::for_connect(&ring(), "", DEFAULT_DOMAIN),
            Err(WireError::SecurityConfig(_))
        ));
    }

    #[test]
    fn test_bind_requires_authorizer() {
        assert!(matches!(
            SecureChannel::for_bind(&ring(), None, DEFAULT_DOMAIN),
            Err(WireError::SecurityConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_authorized_handshake_and_sealing() {
        let server_ring = ring();
        let client_ring = ring();
        let server_keys = server_ring.node_keys().unwrap();
        let client_keys = client_ring.node_keys().unwrap();

        let client_sec = SecureChannel::for_connect(
            &client_ring,
            &server_keys.verifying_key_hex(),
            "delegates",
        )
        .unwrap();
        let server_sec = SecureChannel::for_bind(
            &server_ring,
            Some(Arc::new(AllowList(vec![*client_keys.encryption_public().as_bytes()]))),
            "delegates",
        )
        .unwrap();

        let (client_io, server_io) = tokio::io::duplex(4096);
        let (mut cr, mut cw) = tokio::io::split(client_io);
        let (mut sr, mut sw) = tokio::io::split(server_io);

        let server = tokio::spawn(async move {
            server_handshake(&mut sr, &mut sw, &server_sec).await
        });
        let (mut c_seal, mut c_open) = client_handshake(&mut cr, &mut cw, &client_sec)
            .await
            .unwrap();
        let (mut s_seal, mut s_open, peer_key) = server.await.unwrap().unwrap();
        assert_eq!(peer_key.as_bytes(), client_keys.encryption_public().as_bytes());

        let sealed = c_seal.seal(b"block 42").unwrap();
        assert_ne!(sealed.as_slice(), b"block 42");
        assert_eq!(s_open.open(&sealed).unwrap(), b"block 42");

        let reply = s_seal.seal(b"ack").unwrap();
        assert_eq!(c_open.open(&reply).unwrap(), b"ack");
    }

    #[tokio::test]
    async fn test_tampered_record_rejected() {
        let key = [7u8; 32];
        let mut sealer = Sealer {
            cipher: new_cipher(&key).unwrap(),
            counter: 0,
        };
        let mut opener = Opener {
            cipher: new_cipher(&key).unwrap(),
            counter: 0,
        };
        let mut sealed = sealer.seal(b"payload").unwrap();
        sealed[0] ^= 0xff;
        assert!(matches!(opener.open(&sealed), Err(WireError::Framing(_))));
    }

    #[tokio::test]
    async fn test_unauthorized_client_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server_ring = ring();
        let server_keys = server_ring.node_keys().unwrap();
        let store = AuthStore::open(dir.path(), &server_keys, false).unwrap();

        let client_ring = ring();
        let client_sec = SecureChannel::for_connect(
            &client_ring,
            &server_keys.verifying_key_hex(),
            DEFAULT_DOMAIN,
        )
        .unwrap();
        let server_sec =
            SecureChannel::for_bind(&server_ring, Some(Arc::new(store)), DEFAULT_DOMAIN).unwrap();

        let (client_io, server_io) = tokio::io::duplex(4096);
        let (mut cr, mut cw) = tokio::io::split(client_io);
        let (mut sr, mut sw) = tokio::io::split(server_io);

        let server = tokio::spawn(async move {
            server_handshake(&mut sr, &mut sw, &server_sec).await
        });
        let client = client_handshake(&mut cr, &mut cw, &client_sec).await;
        match client {
            Err(WireError::Handshake(msg)) => assert!(msg.contains("403"), "got: {msg}"),
            Err(other) => panic!("Expected handshake error, got {other:?}"),
            Ok(_) => panic!("Expected handshake error, got a session"),
        }
        assert!(matches!(
            server.await.unwrap(),
            Err(WireError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_server_identity_detected() {
        let server_ring = ring();
        let impostor_target = NodeKeys::generate();
        let client_ring = ring();
        let client_keys = client_ring.node_keys().unwrap();

        // Client expects a different server than the one answering.
        let client_sec = SecureChannel::for_connect(
            &client_ring,
            &impostor_target.verifying_key_hex(),
            DEFAULT_DOMAIN,
        )
        .unwrap();
        let server_sec = SecureChannel::for_bind(
            &server_ring,
            Some(Arc::new(AllowList(vec![*client_keys.encryption_public().as_bytes()]))),
            DEFAULT_DOMAIN,
        )
        .unwrap();

        let (client_io, server_io) = tokio::io::duplex(4096);
        let (mut cr, mut cw) = tokio::io::split(client_io);
        let (mut sr, mut sw) = tokio::io::split(server_io);

        let server = tokio::spawn(async move {
            server_handshake(&mut sr, &mut sw, &server_sec).await
        });
        let client = client_handshake(&mut cr, &mut cw, &client_sec).await;
        assert!(matches!(client, Err(WireError::Handshake(_))));
        drop(cw);
        drop(cr);
        assert!(server.await.unwrap().is_err());
    }
}

//! Signed-then-encrypted message envelopes.
//!
//! Every frame that crosses the relay is first signed with the sender's
//! secp256k1 key (ECDSA over the claim set), then sealed for the recipient
//! with ECIES: an ephemeral ECDH agreement, HKDF-SHA256 and
//! ChaCha20-Poly1305. The relay operator sees queue names but never the
//! claims, and cannot move a signed claim set into another session.
//!
//! Token layout (all parts base64url without padding):
//!
//! ```text
//! ephemeral-public-key . nonce . ciphertext
//! ```
//!
//! The plaintext inside the ciphertext is `claims . signature`.

use crate::relay::error::{RelayError, RelayResult};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use k256::ecdh::EphemeralSecret;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use k256::{PublicKey, SecretKey};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;
const KEY_INFO: &[u8] = b"gatekeeper-relay envelope v1";
/// How far `issuedAt` may sit from the local clock, in either direction.
const MAX_CLOCK_SKEW_SECS: u64 = 600;

/// A cloud's secp256k1 key pair, used both for signing and for receiving
/// sealed envelopes.
#[derive(Clone)]
pub struct RelayKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl RelayKeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut rand::thread_rng());
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Load a key pair from a PKCS#8 PEM private key.
    pub fn from_pem(pem: &str) -> RelayResult<Self> {
        let secret = SecretKey::from_pkcs8_pem(pem)
            .map_err(|e| RelayError::Crypto(format!("invalid private key: {e}")))?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    /// Read a PKCS#8 PEM private key from disk.
    pub fn load(path: &Path) -> RelayResult<Self> {
        let pem = Zeroizing::new(std::fs::read_to_string(path)?);
        Self::from_pem(&pem)
    }

    /// Encode the private key as PKCS#8 PEM.
    pub fn to_pem(&self) -> RelayResult<Zeroizing<String>> {
        self.secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| RelayError::Crypto(format!("private key encoding failed: {e}")))
    }

    /// Write the private key to disk as PKCS#8 PEM.
    pub fn save(&self, path: &Path) -> RelayResult<()> {
        let pem = self.to_pem()?;
        std::fs::write(path, pem.as_bytes())?;
        Ok(())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Base64 of the SubjectPublicKeyInfo DER, as published in advertisements.
    pub fn public_key_base64(&self) -> RelayResult<String> {
        encode_public_key(&self.public)
    }
}

impl fmt::Debug for RelayKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayKeyPair")
            .field("public", &public_key_fingerprint(&self.public))
            .finish_non_exhaustive()
    }
}

/// Encode a public key as base64 SubjectPublicKeyInfo DER.
pub fn encode_public_key(key: &PublicKey) -> RelayResult<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| RelayError::Crypto(format!("public key encoding failed: {e}")))?;
    Ok(STANDARD.encode(der.as_bytes()))
}

/// Resolve a peer public key from PEM, base64 SPKI DER or base64 SEC1.
pub fn parse_public_key(encoded: &str) -> RelayResult<PublicKey> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(RelayError::Crypto("public key is empty".to_string()));
    }

    if encoded.starts_with("-----BEGIN") {
        return PublicKey::from_public_key_pem(encoded)
            .map_err(|e| RelayError::Crypto(format!("invalid PEM public key: {e}")));
    }

    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| RelayError::Crypto(format!("public key is not base64: {e}")))?;

    PublicKey::from_public_key_der(&bytes)
        .or_else(|_| PublicKey::from_sec1_bytes(&bytes))
        .map_err(|_| RelayError::Crypto("unparseable public key".to_string()))
}

/// Short hex fingerprint of a public key, for logs.
pub fn public_key_fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.to_encoded_point(true).as_bytes());
    hex::encode(&digest[..8])
}

/// Claims recovered from a decoded message token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub message_type: String,
    pub session_id: String,
    /// JSON text, or base64 for raw byte payloads.
    pub payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SessionClaims {
    session_id: String,
    issued_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MessageClaims {
    message_type: String,
    session_id: String,
    payload: String,
    issued_at: u64,
}

/// Signs and seals outbound envelopes, opens and verifies inbound ones.
#[derive(Debug, Clone)]
pub struct MessageCryptographer {
    keys: Arc<RelayKeyPair>,
}

impl MessageCryptographer {
    pub fn new(keys: Arc<RelayKeyPair>) -> Self {
        Self { keys }
    }

    pub fn key_pair(&self) -> &RelayKeyPair {
        &self.keys
    }

    /// Sign a session id and seal it for the recipient.
    pub fn encode_session_id(&self, session_id: &str, recipient: &PublicKey) -> RelayResult<String> {
        if session_id.is_empty() {
            return Err(RelayError::Crypto("session id is empty".to_string()));
        }

        let claims = SessionClaims {
            session_id: session_id.to_string(),
            issued_at: unix_now(),
        };
        self.sign_and_seal(&claims, recipient)
    }

    /// Open a sealed session id and check the sender's signature.
    pub fn decode_session_id(&self, token: &str, sender: &PublicKey) -> RelayResult<String> {
        let claims: SessionClaims = self.open_and_verify(token, sender)?;
        check_issued_at(claims.issued_at, unix_now())?;
        if claims.session_id.is_empty() {
            return Err(RelayError::Authentication(
                "token carries an empty session id".to_string(),
            ));
        }
        Ok(claims.session_id)
    }

    /// Sign and seal a message whose payload is serialized as JSON.
    pub fn encode_message<T: Serialize + ?Sized>(
        &self,
        message_type: &str,
        session_id: &str,
        payload: &T,
        recipient: &PublicKey,
    ) -> RelayResult<String> {
        let json = serde_json::to_string(payload)
            .map_err(|e| RelayError::Crypto(format!("payload serialization failed: {e}")))?;
        self.encode_claims(message_type, session_id, json, recipient)
    }

    /// Sign and seal a message whose payload is raw bytes (sent as base64).
    pub fn encode_bytes(
        &self,
        message_type: &str,
        session_id: &str,
        payload: &[u8],
        recipient: &PublicKey,
    ) -> RelayResult<String> {
        self.encode_claims(message_type, session_id, STANDARD.encode(payload), recipient)
    }

    /// Open a message token, verify the sender's signature and extract the claims.
    pub fn decode_message(&self, token: &str, sender: &PublicKey) -> RelayResult<DecodedMessage> {
        let claims: MessageClaims = self.open_and_verify(token, sender)?;
        check_issued_at(claims.issued_at, unix_now())?;
        Ok(DecodedMessage {
            message_type: claims.message_type,
            session_id: claims.session_id,
            payload: claims.payload,
        })
    }

    fn encode_claims(
        &self,
        message_type: &str,
        session_id: &str,
        payload: String,
        recipient: &PublicKey,
    ) -> RelayResult<String> {
        if message_type.is_empty() {
            return Err(RelayError::Crypto("message type is empty".to_string()));
        }
        if session_id.is_empty() {
            return Err(RelayError::Crypto("session id is empty".to_string()));
        }

        let claims = MessageClaims {
            message_type: message_type.to_string(),
            session_id: session_id.to_string(),
            payload,
            issued_at: unix_now(),
        };
        self.sign_and_seal(&claims, recipient)
    }

    fn sign_and_seal<T: Serialize>(&self, claims: &T, recipient: &PublicKey) -> RelayResult<String> {
        let claims = serde_json::to_vec(claims)
            .map_err(|e| RelayError::Crypto(format!("claim serialization failed: {e}")))?;

        let signing_key = SigningKey::from(&self.keys.secret);
        let signature: Signature = signing_key.sign(&claims);

        let signed = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&claims),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        );

        seal(signed.as_bytes(), recipient)
    }

    fn open_and_verify<T: DeserializeOwned>(&self, token: &str, sender: &PublicKey) -> RelayResult<T> {
        if token.trim().is_empty() {
            return Err(RelayError::Validation("message token is empty".to_string()));
        }

        let signed = open(token, &self.keys.secret)?;
        let signed = std::str::from_utf8(&signed)
            .map_err(|_| RelayError::Authentication("signed content is not UTF-8".to_string()))?;

        let (claims_part, signature_part) = signed
            .split_once('.')
            .ok_or_else(|| RelayError::Authentication("signed content is malformed".to_string()))?;

        let claims = decode_part(claims_part)?;
        let signature = Signature::from_slice(&decode_part(signature_part)?)
            .map_err(|_| RelayError::Authentication("malformed signature".to_string()))?;

        VerifyingKey::from(sender)
            .verify(&claims, &signature)
            .map_err(|_| RelayError::Authentication("signature verification failed".to_string()))?;

        serde_json::from_slice(&claims)
            .map_err(|e| RelayError::Authentication(format!("malformed claims: {e}")))
    }
}

fn seal(plaintext: &[u8], recipient: &PublicKey) -> RelayResult<String> {
    let ephemeral = EphemeralSecret::random(&mut rand::thread_rng());
    let ephemeral_public = ephemeral.public_key().to_encoded_point(true);
    let shared = ephemeral.diffie_hellman(recipient);

    let key = derive_key(shared.raw_secret_bytes(), ephemeral_public.as_bytes())?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| RelayError::Crypto(format!("encryption failed: {e}")))?;

    Ok(format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(ephemeral_public.as_bytes()),
        URL_SAFE_NO_PAD.encode(nonce),
        URL_SAFE_NO_PAD.encode(ciphertext)
    ))
}

fn open(token: &str, secret: &SecretKey) -> RelayResult<Vec<u8>> {
    let mut parts = token.trim().split('.');
    let (Some(ephemeral), Some(nonce), Some(ciphertext), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RelayError::Authentication("malformed envelope".to_string()));
    };

    let ephemeral_bytes = decode_part(ephemeral)?;
    let ephemeral_public = PublicKey::from_sec1_bytes(&ephemeral_bytes)
        .map_err(|_| RelayError::Authentication("invalid ephemeral key".to_string()))?;

    let nonce = decode_part(nonce)?;
    if nonce.len() != NONCE_LEN {
        return Err(RelayError::Authentication("invalid nonce length".to_string()));
    }

    let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral_public.as_affine());
    let key = derive_key(shared.raw_secret_bytes(), &ephemeral_bytes)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));

    let ciphertext = decode_part(ciphertext)?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| RelayError::Authentication("decryption failed".to_string()))
}

fn derive_key(shared_secret: &[u8], salt: &[u8]) -> RelayResult<Zeroizing<[u8; 32]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(KEY_INFO, &mut key[..])
        .map_err(|e| RelayError::Crypto(format!("key derivation failed: {e}")))?;
    Ok(key)
}

fn decode_part(part: &str) -> RelayResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| RelayError::Authentication("envelope part is not base64url".to_string()))
}

fn check_issued_at(issued_at: u64, now: u64) -> RelayResult<()> {
    if issued_at.abs_diff(now) > MAX_CLOCK_SKEW_SECS {
        return Err(RelayError::Authentication(format!(
            "token issued at {issued_at} is outside the accepted window (now {now})"
        )));
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::message::MessageType;
    use proptest::prelude::*;
    use serde_json::Value;

    fn pair() -> (MessageCryptographer, MessageCryptographer) {
        (
            MessageCryptographer::new(Arc::new(RelayKeyPair::generate())),
            MessageCryptographer::new(Arc::new(RelayKeyPair::generate())),
        )
    }

    #[test]
    fn test_message_roundtrip() {
        let (alice, bob) = pair();
        let payload = serde_json::json!({ "requestedService": "temperature" });

        let token = alice
            .encode_message("gsd_poll", "session-1", &payload, bob.key_pair().public_key())
            .unwrap();
        let decoded = bob.decode_message(&token, alice.key_pair().public_key()).unwrap();

        assert_eq!(decoded.message_type, "gsd_poll");
        assert_eq!(decoded.session_id, "session-1");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&decoded.payload).unwrap(),
            payload
        );
    }

    #[test]
    fn test_bytes_payload_is_base64() {
        let (alice, bob) = pair();
        let token = alice
            .encode_bytes("raw", "s", &[0, 1, 2, 255], bob.key_pair().public_key())
            .unwrap();
        let decoded = bob.decode_message(&token, alice.key_pair().public_key()).unwrap();
        assert_eq!(STANDARD.decode(decoded.payload).unwrap(), vec![0, 1, 2, 255]);
    }

    #[test]
    fn test_session_id_roundtrip() {
        let (alice, bob) = pair();
        let token = alice
            .encode_session_id("abc-123", bob.key_pair().public_key())
            .unwrap();
        let session_id = bob
            .decode_session_id(&token, alice.key_pair().public_key())
            .unwrap();
        assert_eq!(session_id, "abc-123");
    }

    #[test]
    fn test_wrong_sender_key_fails_authentication() {
        let (alice, bob) = pair();
        let mallory = RelayKeyPair::generate();

        let token = alice
            .encode_message("ack", "s", &"", bob.key_pair().public_key())
            .unwrap();
        let err = bob.decode_message(&token, mallory.public_key()).unwrap_err();
        assert!(matches!(err, RelayError::Authentication(_)));
    }

    #[test]
    fn test_wrong_recipient_fails_authentication() {
        let (alice, bob) = pair();
        let eve = MessageCryptographer::new(Arc::new(RelayKeyPair::generate()));

        let token = alice
            .encode_message("ack", "s", &"", bob.key_pair().public_key())
            .unwrap();
        let err = eve.decode_message(&token, alice.key_pair().public_key()).unwrap_err();
        assert!(matches!(err, RelayError::Authentication(_)));
    }

    #[test]
    fn test_tampered_token_fails_authentication() {
        let (alice, bob) = pair();
        let token = alice
            .encode_message("ack", "s", &"", bob.key_pair().public_key())
            .unwrap();

        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        let mut ciphertext = URL_SAFE_NO_PAD.decode(&parts[2]).unwrap();
        ciphertext[0] ^= 0x01;
        parts[2] = URL_SAFE_NO_PAD.encode(ciphertext);

        let err = bob
            .decode_message(&parts.join("."), alice.key_pair().public_key())
            .unwrap_err();
        assert!(matches!(err, RelayError::Authentication(_)));
    }

    #[test]
    fn test_empty_inputs() {
        let (alice, bob) = pair();

        let err = bob.decode_message("  ", alice.key_pair().public_key()).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        let err = alice
            .encode_session_id("", bob.key_pair().public_key())
            .unwrap_err();
        assert!(matches!(err, RelayError::Crypto(_)));

        let err = alice
            .encode_message("", "s", &"", bob.key_pair().public_key())
            .unwrap_err();
        assert!(matches!(err, RelayError::Crypto(_)));
    }

    #[test]
    fn test_public_key_encodings() {
        let keys = RelayKeyPair::generate();

        let base64 = keys.public_key_base64().unwrap();
        assert_eq!(&parse_public_key(&base64).unwrap(), keys.public_key());

        let pem = keys.public_key().to_public_key_pem(LineEnding::LF).unwrap();
        assert_eq!(&parse_public_key(&pem).unwrap(), keys.public_key());

        let sec1 = STANDARD.encode(keys.public_key().to_encoded_point(true).as_bytes());
        assert_eq!(&parse_public_key(&sec1).unwrap(), keys.public_key());

        assert!(matches!(parse_public_key(""), Err(RelayError::Crypto(_))));
        assert!(matches!(parse_public_key("bm90IGEga2V5"), Err(RelayError::Crypto(_))));
    }

    #[test]
    fn test_private_key_pem_roundtrip() {
        let keys = RelayKeyPair::generate();
        let pem = keys.to_pem().unwrap();
        let restored = RelayKeyPair::from_pem(&pem).unwrap();
        assert_eq!(restored.public_key(), keys.public_key());
    }

    #[test]
    fn test_message_token_is_not_a_session_token() {
        let (alice, bob) = pair();
        let token = alice
            .encode_message("ack", "session-1", &Value::Null, bob.key_pair().public_key())
            .unwrap();
        let err = bob
            .decode_session_id(&token, alice.key_pair().public_key())
            .unwrap_err();
        assert!(err.is_security_event());

        let token = alice
            .encode_session_id("session-1", bob.key_pair().public_key())
            .unwrap();
        let err = bob
            .decode_message(&token, alice.key_pair().public_key())
            .unwrap_err();
        assert!(err.is_security_event());
    }

    #[test]
    fn test_stale_and_future_tokens_are_rejected() {
        let (alice, bob) = pair();
        let now = unix_now();

        for issued_at in [now - 3600, now + 3600] {
            let claims = MessageClaims {
                message_type: "gsd_poll".to_string(),
                session_id: "session-1".to_string(),
                payload: "{}".to_string(),
                issued_at,
            };
            let token = alice.sign_and_seal(&claims, bob.key_pair().public_key()).unwrap();
            let err = bob
                .decode_message(&token, alice.key_pair().public_key())
                .unwrap_err();
            assert!(matches!(err, RelayError::Authentication(_)));
        }

        let claims = SessionClaims {
            session_id: "session-1".to_string(),
            issued_at: now - 3600,
        };
        let token = alice.sign_and_seal(&claims, bob.key_pair().public_key()).unwrap();
        assert!(bob
            .decode_session_id(&token, alice.key_pair().public_key())
            .is_err());
    }

    #[test]
    fn test_issued_at_window() {
        assert!(check_issued_at(1_000, 1_000).is_ok());
        assert!(check_issued_at(1_000 - MAX_CLOCK_SKEW_SECS, 1_000).is_ok());
        assert!(check_issued_at(1_000 + MAX_CLOCK_SKEW_SECS, 1_000).is_ok());
        assert!(check_issued_at(1_000 + MAX_CLOCK_SKEW_SECS + 1, 1_000).is_err());
        assert!(check_issued_at(0, 1_000).is_err());
    }

    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            ".{0,24}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 5, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..5).prop_map(Value::Array),
                prop::collection::btree_map("[a-zA-Z]{1,8}", inner, 0..5)
                    .prop_map(|fields| Value::Object(fields.into_iter().collect())),
            ]
        })
    }

    fn message_kind() -> impl Strategy<Value = MessageType> {
        let mut kinds = MessageType::REQUEST_KINDS.to_vec();
        kinds.push(MessageType::Ack);
        prop::sample::select(kinds)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_every_message_kind_survives_the_envelope(
            kind in message_kind(),
            session_id in "[a-zA-Z0-9-]{1,36}",
            payload in json_value(),
        ) {
            let (alice, bob) = pair();
            let token = alice
                .encode_message(kind.as_str(), &session_id, &payload, bob.key_pair().public_key())
                .unwrap();
            let decoded = bob.decode_message(&token, alice.key_pair().public_key()).unwrap();

            prop_assert_eq!(decoded.message_type.parse::<MessageType>().unwrap(), kind);
            prop_assert_eq!(&decoded.session_id, &session_id);
            prop_assert_eq!(serde_json::from_str::<Value>(&decoded.payload).unwrap(), payload);
        }
    }
}

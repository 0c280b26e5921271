//! SDP authentication and room-password encryption
//!
//! Two independent layers:
//!
//! - **Signed SDP envelopes**: ECDSA P-384 over SHA-384, with the
//!   signer's public key embedded as a JWK so the receiver can verify
//!   without prior key exchange. The verifier binds the SDP to the
//!   embedded key, not to a known identity; identity pinning is a
//!   higher-layer concern.
//! - **Room password envelope**: SHA-256 key derivation plus AES-256-CBC
//!   with a fresh IV per call. Unused by the signaling core itself;
//!   provided for the room layer on top.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use p384::ecdsa::signature::{Signer, Verifier};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use p384::elliptic_curve::JwkEcKey;
use p384::PublicKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Bad envelope: {0}")]
    BadEnvelope(String),
    #[error("Signature verification failed")]
    Unverified,
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Signed SDP envelope as carried in the wire `sdp` field
#[derive(Debug, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub sdp: String,
    /// base64 of the raw `r || s` ECDSA signature over UTF-8(`sdp`)
    pub signature: String,
    /// Signer's public key as a JWK
    pub key: JwkEcKey,
}

/// Outcome of a successful envelope verification
#[derive(Debug, Clone)]
pub struct VerifiedSdp {
    pub sdp: String,
    /// The key the envelope verified against; callers pin this to the peer.
    pub key: VerifyingKey,
}

/// Sign an SDP and wrap it with the signature and public key
pub fn sign_sdp(signing_key: &SigningKey, sdp: &str) -> Result<String, CryptoError> {
    let signature: Signature = signing_key.sign(sdp.as_bytes());
    let envelope = SignedEnvelope {
        sdp: sdp.to_string(),
        signature: BASE64.encode(signature.to_bytes()),
        key: PublicKey::from(signing_key.verifying_key()).to_jwk(),
    };
    serde_json::to_string(&envelope).map_err(|e| CryptoError::BadEnvelope(e.to_string()))
}

/// Verify a signed envelope and recover the SDP and the embedded key.
///
/// Returns [`CryptoError::BadEnvelope`] when the envelope does not parse
/// and [`CryptoError::Unverified`] when the signature check fails. Both
/// are non-fatal to callers: the offending frame is dropped.
pub fn verify_sdp(envelope: &str) -> Result<VerifiedSdp, CryptoError> {
    let envelope: SignedEnvelope =
        serde_json::from_str(envelope).map_err(|e| CryptoError::BadEnvelope(e.to_string()))?;
    let public = PublicKey::from_jwk(&envelope.key)
        .map_err(|e| CryptoError::BadEnvelope(e.to_string()))?;
    let key = VerifyingKey::from(public);
    let raw = BASE64
        .decode(&envelope.signature)
        .map_err(|e| CryptoError::BadEnvelope(e.to_string()))?;
    let signature =
        Signature::from_slice(&raw).map_err(|e| CryptoError::BadEnvelope(e.to_string()))?;
    key.verify(envelope.sdp.as_bytes(), &signature)
        .map_err(|_| CryptoError::Unverified)?;
    Ok(VerifiedSdp {
        sdp: envelope.sdp,
        key,
    })
}

/// Symmetric room key derived from a password
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey([u8; 32]);

impl RoomKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("RoomKey(..)")
    }
}

/// Derive the room key: SHA-256 over `"<password>:<ns>"`
pub fn derive_room_key(password: &str, ns: &str) -> RoomKey {
    let digest = Sha256::digest(format!("{password}:{ns}").as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    RoomKey(key)
}

/// Ciphertext envelope produced by [`encrypt`]
#[derive(Debug, Serialize, Deserialize)]
struct CipherEnvelope {
    c: String,
    iv: Vec<u8>,
}

/// AES-256-CBC encrypt with a fresh random IV.
///
/// Returns a JSON envelope `{c: base64(ciphertext), iv: [16 bytes]}`.
pub fn encrypt(key: &RoomKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext =
        Aes256CbcEnc::new(&key.0.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let envelope = CipherEnvelope {
        c: BASE64.encode(ciphertext),
        iv: iv.to_vec(),
    };
    serde_json::to_string(&envelope).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Exact inverse of [`encrypt`]
pub fn decrypt(key: &RoomKey, envelope: &str) -> Result<Vec<u8>, CryptoError> {
    let envelope: CipherEnvelope =
        serde_json::from_str(envelope).map_err(|e| CryptoError::BadEnvelope(e.to_string()))?;
    let ciphertext = BASE64
        .decode(&envelope.c)
        .map_err(|e| CryptoError::BadEnvelope(e.to_string()))?;
    if envelope.iv.len() != 16 {
        return Err(CryptoError::BadEnvelope("iv must be 16 bytes".into()));
    }
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&envelope.iv);
    Aes256CbcDec::new(&key.0.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn test_key() -> SigningKey {
        SigningKey::random(&mut OsRng)
    }

    #[test]
    fn sign_verify_round_trip() {
        let key = test_key();
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n";
        let envelope = sign_sdp(&key, sdp).unwrap();
        let verified = verify_sdp(&envelope).unwrap();
        assert_eq!(verified.sdp, sdp);
        assert_eq!(&verified.key, key.verifying_key());
    }

    #[test]
    fn tampered_signature_fails() {
        let envelope = sign_sdp(&test_key(), "v=0 original").unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&envelope).unwrap();
        let mut raw = BASE64
            .decode(value["signature"].as_str().unwrap())
            .unwrap();
        raw[0] ^= 0x01;
        value["signature"] = serde_json::Value::String(BASE64.encode(raw));
        let result = verify_sdp(&value.to_string());
        assert!(matches!(result, Err(CryptoError::Unverified)));
    }

    #[test]
    fn tampered_sdp_fails() {
        let envelope = sign_sdp(&test_key(), "v=0 original").unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&envelope).unwrap();
        value["sdp"] = serde_json::Value::String("v=0 Original".into());
        let result = verify_sdp(&value.to_string());
        assert!(matches!(result, Err(CryptoError::Unverified)));
    }

    #[test]
    fn garbage_envelope_is_bad() {
        assert!(matches!(
            verify_sdp("not json at all"),
            Err(CryptoError::BadEnvelope(_))
        ));
    }

    #[test]
    fn signature_is_over_the_embedded_key() {
        // Swapping in a different (valid) key must fail verification.
        let envelope = sign_sdp(&test_key(), "v=0 original").unwrap();
        let other = sign_sdp(&test_key(), "something else").unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&envelope).unwrap();
        let other: serde_json::Value = serde_json::from_str(&other).unwrap();
        value["key"] = other["key"].clone();
        assert!(matches!(
            verify_sdp(&value.to_string()),
            Err(CryptoError::Unverified)
        ));
    }

    #[test]
    fn room_key_is_deterministic() {
        assert_eq!(derive_room_key("hunter2", "lobby"), derive_room_key("hunter2", "lobby"));
        assert_ne!(derive_room_key("hunter2", "lobby"), derive_room_key("hunter2", "other"));
        assert_ne!(derive_room_key("hunter2", "lobby"), derive_room_key("hunter3", "lobby"));
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = derive_room_key("hunter2", "lobby");
        let plaintext = b"attack at dawn";
        let envelope = encrypt(&key, plaintext).unwrap();
        assert_eq!(decrypt(&key, &envelope).unwrap(), plaintext);
    }

    #[test]
    fn encrypt_uses_fresh_ivs() {
        let key = derive_room_key("hunter2", "lobby");
        let a = encrypt(&key, b"same message").unwrap();
        let b = encrypt(&key, b"same message").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let envelope = encrypt(&derive_room_key("hunter2", "lobby"), b"secret").unwrap();
        let wrong = derive_room_key("hunter2", "other");
        assert!(decrypt(&wrong, &envelope).is_err());
    }
}

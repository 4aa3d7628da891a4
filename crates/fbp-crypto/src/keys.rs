// SPDX-License-Identifier: MIT OR Apache-2.0
//! Platform key pair and the hybrid wrap used by phase-2 provisioning.
//!
//! Registration payloads exceed what RSA-OAEP can carry directly, so the
//! wrap is hybrid: a fresh AES-256-GCM key encrypts the payload and the
//! RSA key transports the AES key. Wire layout, before base64:
//!
//! ```text
//! [ rsa_oaep(aes_key) : key_size bytes ][ nonce : 12 bytes ][ gcm ciphertext ]
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use fbp_error::{FleetError, FleetResult};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

/// RSA modulus size for generated platform keys.
const PLATFORM_KEY_BITS: usize = 2048;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// AES-256 key length in bytes.
const AES_KEY_LEN: usize = 32;

/// The platform's asymmetric key pair.
///
/// The public half is handed to devices during phase 1; the private half
/// unwraps phase-2 registration payloads.
pub struct PlatformKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl PlatformKeyPair {
    /// Generate a fresh RSA-2048 key pair.
    pub fn generate() -> FleetResult<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, PLATFORM_KEY_BITS)
            .map_err(|e| FleetError::crypto("keypair generation failed").with_source(e))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Load a key pair from a PKCS#8 PEM private key.
    pub fn from_private_pem(pem: &str) -> FleetResult<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| FleetError::crypto("invalid platform private key").with_source(e))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// PKCS#8 PEM encoding of the private key.
    pub fn private_pem(&self) -> FleetResult<String> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| FleetError::crypto("private key encoding failed").with_source(e))
    }

    /// SPKI PEM encoding of the public key, as returned by phase 1.
    pub fn public_pem(&self) -> FleetResult<String> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| FleetError::crypto("public key encoding failed").with_source(e))
    }

    /// Unwrap a hybrid-wrapped payload.
    ///
    /// Any length, padding, or authentication mismatch yields the same
    /// opaque `CRYPTO_FAILURE`.
    pub fn unwrap_payload(&self, wrapped: &[u8]) -> FleetResult<Vec<u8>> {
        let key_block_len = self.private.size();
        if wrapped.len() <= key_block_len + NONCE_LEN {
            return Err(FleetError::crypto("wrapped payload truncated"));
        }
        let (key_block, rest) = wrapped.split_at(key_block_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let aes_key = self
            .private
            .decrypt(Oaep::new::<Sha256>(), key_block)
            .map_err(|e| FleetError::crypto("payload unwrap failed").with_source(e))?;
        if aes_key.len() != AES_KEY_LEN {
            return Err(FleetError::crypto("payload unwrap failed"));
        }

        let cipher = Aes256Gcm::new_from_slice(&aes_key)
            .map_err(|_| FleetError::crypto("payload unwrap failed"))?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| FleetError::crypto("payload unwrap failed"))
    }
}

/// Hybrid-wrap `plaintext` for the holder of `public_pem`.
///
/// The device side of phase 2; the backplane uses it in tests and in the
/// enrollment simulator.
pub fn wrap_payload(public_pem: &str, plaintext: &[u8]) -> FleetResult<Vec<u8>> {
    let public = RsaPublicKey::from_public_key_pem(public_pem)
        .map_err(|e| FleetError::crypto("invalid wrap public key").with_source(e))?;

    let mut aes_key = [0u8; AES_KEY_LEN];
    OsRng.fill_bytes(&mut aes_key);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key_block = public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &aes_key)
        .map_err(|e| FleetError::crypto("key transport failed").with_source(e))?;

    let cipher = Aes256Gcm::new_from_slice(&aes_key)
        .map_err(|_| FleetError::crypto("key transport failed"))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| FleetError::crypto("payload encryption failed"))?;

    let mut wrapped = key_block;
    wrapped.extend_from_slice(&nonce);
    wrapped.extend_from_slice(&ciphertext);
    Ok(wrapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbp_error::ErrorCode;

    fn keypair() -> PlatformKeyPair {
        PlatformKeyPair::generate().unwrap()
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let kp = keypair();
        let payload = br#"{"device_id":"D1","provisioning_token":"K"}"#;
        let wrapped = wrap_payload(&kp.public_pem().unwrap(), payload).unwrap();
        let unwrapped = kp.unwrap_payload(&wrapped).unwrap();
        assert_eq!(unwrapped, payload);
    }

    #[test]
    fn roundtrip_survives_large_payloads() {
        // Registration payloads comfortably exceed a raw OAEP block.
        let kp = keypair();
        let payload = vec![0x42u8; 4096];
        let wrapped = wrap_payload(&kp.public_pem().unwrap(), &payload).unwrap();
        assert_eq!(kp.unwrap_payload(&wrapped).unwrap(), payload);
    }

    #[test]
    fn truncated_payload_fails_closed() {
        let kp = keypair();
        let err = kp.unwrap_payload(&[0u8; 16]).unwrap_err();
        assert_eq!(err.code, ErrorCode::CryptoFailure);
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let kp = keypair();
        let mut wrapped = wrap_payload(&kp.public_pem().unwrap(), b"payload").unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xff;
        let err = kp.unwrap_payload(&wrapped).unwrap_err();
        assert_eq!(err.code, ErrorCode::CryptoFailure);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let kp_a = keypair();
        let kp_b = keypair();
        let wrapped = wrap_payload(&kp_a.public_pem().unwrap(), b"payload").unwrap();
        let err = kp_b.unwrap_payload(&wrapped).unwrap_err();
        assert_eq!(err.code, ErrorCode::CryptoFailure);
    }

    #[test]
    fn pem_roundtrip() {
        let kp = keypair();
        let pem = kp.private_pem().unwrap();
        let reloaded = PlatformKeyPair::from_private_pem(&pem).unwrap();
        assert_eq!(kp.public_pem().unwrap(), reloaded.public_pem().unwrap());
    }
}

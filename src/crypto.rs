//! Node identity and cryptographic bindings
//!
//! A node is identified by the compressed SEC1 encoding of its long-lived
//! P-256 signing key. Unicast payloads are sealed with AES-256-GCM under a
//! key derived from an ephemeral P-256 key agreement.

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::binary::{from_base64url, to_base64url};
use crate::error::{Error, Result};

/// Compressed SEC1 point size, the encoded identifier length.
pub const IDENTIFIER_SIZE: usize = 33;
/// Uncompressed SEC1 point size, the encoded key-agreement public length.
pub const ECDH_PUBLIC_SIZE: usize = 65;
/// AES-GCM initialization vector length.
pub const IV_SIZE: usize = 16;
/// Fixed-width (r ‖ s) ECDSA signature length.
pub const SIGNATURE_SIZE: usize = 64;
/// Derived symmetric key length.
pub const SHARED_KEY_SIZE: usize = 32;

/// AES-256-GCM with a 16-byte nonce and the default 16-byte tag.
type Cipher = AesGcm<Aes256, U16>;

/// A node identifier: the compressed encoding of a P-256 verifying key.
///
/// Ordering, equality and hashing are defined on the encoded bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier([u8; IDENTIFIER_SIZE]);

impl Identifier {
    /// Parses an encoded identifier, validating that it is a point on the
    /// curve.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != IDENTIFIER_SIZE {
            return Err(Error::Malformed("bad identifier length"));
        }
        VerifyingKey::from_sec1_bytes(bytes).map_err(|_| Error::Malformed("bad identifier point"))?;
        let mut out = [0u8; IDENTIFIER_SIZE];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn from_base64url(s: &str) -> Result<Self> {
        Self::from_bytes(&from_base64url(s)?)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTIFIER_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Verifies a fixed-width signature over `message` under this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let key = VerifyingKey::from_sec1_bytes(&self.0)
            .map_err(|_| Error::Internal("identifier is not a valid key".into()))?;
        let signature =
            Signature::from_slice(signature).map_err(|_| Error::BadSignature)?;
        key.verify(message, &signature).map_err(|_| Error::BadSignature)
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&to_base64url(&self.0))
    }
}

impl std::fmt::Debug for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identifier({})", to_base64url(&self.0))
    }
}

/// Long-lived signing keypair; its public half is the node's identifier.
pub struct SigningPair {
    key: SigningKey,
    id: Identifier,
}

impl SigningPair {
    pub fn generate() -> Self {
        let key = SigningKey::random(&mut OsRng);
        let point = VerifyingKey::from(&key).to_encoded_point(true);
        let mut encoded = [0u8; IDENTIFIER_SIZE];
        encoded.copy_from_slice(point.as_bytes());
        Self { key, id: Identifier(encoded) }
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    /// Signs `message`, producing a fixed-width (r ‖ s) signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.key.sign(message);
        signature.to_bytes().to_vec()
    }
}

/// Ephemeral key-agreement keypair, published in the node's State.
pub struct EcdhPair {
    secret: EphemeralSecret,
    public: [u8; ECDH_PUBLIC_SIZE],
}

impl EcdhPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);
        let mut public = [0u8; ECDH_PUBLIC_SIZE];
        public.copy_from_slice(point.as_bytes());
        Self { secret, public }
    }

    pub fn public(&self) -> &[u8; ECDH_PUBLIC_SIZE] {
        &self.public
    }

    /// Derives the symmetric key shared with `remote_public`:
    /// SHA-256 of the raw agreed secret.
    pub fn agree(&self, remote_public: &[u8]) -> Result<[u8; SHARED_KEY_SIZE]> {
        let remote = PublicKey::from_sec1_bytes(remote_public)
            .map_err(|_| Error::Malformed("bad key agreement public key"))?;
        let shared = self.secret.diffie_hellman(&remote);
        Ok(sha256(shared.raw_secret_bytes()))
    }
}

pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Seals `plaintext`; the 16-byte authentication tag trails the ciphertext.
pub fn encrypt(key: &[u8; SHARED_KEY_SIZE], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Cipher::new(GenericArray::from_slice(key));
    cipher
        .encrypt(GenericArray::from_slice(iv), plaintext)
        .map_err(|_| Error::Internal("encryption failed".into()))
}

/// Opens `ciphertext` (with trailing tag); fails on any tampering.
pub fn decrypt(key: &[u8; SHARED_KEY_SIZE], iv: &[u8; IV_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Cipher::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(iv), ciphertext)
        .map_err(|_| Error::AuthFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_roundtrip() {
        let pair = SigningPair::generate();
        let id = pair.id();
        assert_eq!(id.as_bytes().len(), IDENTIFIER_SIZE);
        let parsed = Identifier::from_bytes(id.as_bytes()).unwrap();
        assert_eq!(parsed, id);
        let displayed = id.to_string();
        assert_eq!(Identifier::from_base64url(&displayed).unwrap(), id);
    }

    #[test]
    fn test_identifier_rejects_junk() {
        assert!(Identifier::from_bytes(&[0u8; IDENTIFIER_SIZE]).is_err());
        assert!(Identifier::from_bytes(&[2u8; 10]).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let pair = SigningPair::generate();
        let signature = pair.sign(b"payload");
        assert_eq!(signature.len(), SIGNATURE_SIZE);
        assert!(pair.id().verify(b"payload", &signature).is_ok());
        assert!(pair.id().verify(b"other", &signature).is_err());

        let other = SigningPair::generate();
        assert!(other.id().verify(b"payload", &signature).is_err());
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let a = EcdhPair::generate();
        let b = EcdhPair::generate();
        let k1 = a.agree(b.public()).unwrap();
        let k2 = b.agree(a.public()).unwrap();
        assert_eq!(k1, k2);

        let c = EcdhPair::generate();
        assert_ne!(a.agree(c.public()).unwrap(), k1);
    }

    #[test]
    fn test_seal_open() {
        let key = sha256(b"key material");
        let iv = generate_iv();
        let sealed = encrypt(&key, &iv, b"secret").unwrap();
        assert_eq!(sealed.len(), 6 + 16);
        assert_eq!(decrypt(&key, &iv, &sealed).unwrap(), b"secret");

        let mut tampered = sealed.clone();
        tampered[0] ^= 0x01;
        assert!(matches!(decrypt(&key, &iv, &tampered), Err(Error::AuthFailed)));
    }
}

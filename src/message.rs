//! Wire envelope and sealed unicast bodies
//!
//! Every frame is a `Message`: an 8-byte big-endian header, optional source
//! and destination identifiers, the body, and a trailing signature over all
//! preceding bytes. Unicast transport bodies are a `CipherBody` sealed
//! against the recipient's advertised key-agreement public key.

use std::cmp::Ordering;

use crate::binary::Reader;
use crate::crypto::{
    self, EcdhPair, Identifier, SigningPair, ECDH_PUBLIC_SIZE, IDENTIFIER_SIZE, IV_SIZE,
};
use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 8;
pub const MAX_BODY_SIZE: usize = u16::MAX as usize;

pub const FLAG_HAS_SOURCE: u8 = 0x01;
pub const FLAG_HAS_DESTINATION: u8 = 0x02;

/// Message lanes multiplexed over the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Dummy = 0x00,

    // Routing
    Hello = 0x01,
    State = 0x02,

    // Signaling
    Signaling = 0x10,
    Provisioning = 0x11,

    // User
    User = 0x80,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Dummy),
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::State),
            0x10 => Some(Self::Signaling),
            0x11 => Some(Self::Provisioning),
            0x80 => Some(Self::User),
            _ => None,
        }
    }
}

/// Serial-number arithmetic comparison of two 32-bit sequence counters:
/// `s1` is newer than `s2` iff `(s1 - s2) mod 2^32 < 2^31` and `s1 != s2`.
pub fn compare_sequence(s1: u32, s2: u32) -> Ordering {
    if s1 == s2 {
        Ordering::Equal
    } else if s1.wrapping_sub(s2) < 0x8000_0000 {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// True iff `s1` is strictly newer than `s2` under serial-number arithmetic.
pub fn sequence_newer(s1: u32, s2: u32) -> bool {
    compare_sequence(s1, s2) == Ordering::Greater
}

#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageType,
    pub sequence: u32,
    pub source: Option<Identifier>,
    pub destination: Option<Identifier>,
    pub body: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Message {
    pub fn new(
        kind: MessageType,
        sequence: u32,
        body: Vec<u8>,
        destination: Option<Identifier>,
    ) -> Self {
        Self { kind, sequence, source: None, destination, body, signature: Vec::new() }
    }

    /// Builds and signs a message in one step.
    pub fn signed(
        kind: MessageType,
        sequence: u32,
        body: Vec<u8>,
        pair: &SigningPair,
        destination: Option<Identifier>,
    ) -> Result<Self> {
        let mut message = Self::new(kind, sequence, body, destination);
        message.sign(pair)?;
        Ok(message)
    }

    /// Sets the source to the signer, clears any previous signature and signs
    /// the serialized representation. Re-encoding afterwards yields the
    /// signed wire bytes.
    pub fn sign(&mut self, pair: &SigningPair) -> Result<()> {
        self.source = Some(pair.id());
        self.signature.clear();
        let unsigned = self.encode()?;
        self.signature = pair.sign(&unsigned);
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.body.len() > MAX_BODY_SIZE {
            return Err(Error::Malformed("message body is too long"));
        }

        let mut flags = 0u8;
        if self.source.is_some() {
            flags |= FLAG_HAS_SOURCE;
        }
        if self.destination.is_some() {
            flags |= FLAG_HAS_DESTINATION;
        }

        let mut out = Vec::with_capacity(
            HEADER_SIZE + 2 * IDENTIFIER_SIZE + self.body.len() + self.signature.len(),
        );
        out.push(self.kind as u8);
        out.push(flags);
        out.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        if let Some(source) = &self.source {
            out.extend_from_slice(source.as_bytes());
        }
        if let Some(destination) = &self.destination {
            out.extend_from_slice(destination.as_bytes());
        }
        out.extend_from_slice(&self.body);
        out.extend_from_slice(&self.signature);
        Ok(out)
    }

    /// Parses a frame and, when a source is present, verifies the trailing
    /// signature over everything that precedes it.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);

        let kind = reader.read_u8()?;
        let kind = MessageType::from_u8(kind).ok_or(Error::Malformed("unknown message type"))?;
        let flags = reader.read_u8()?;
        let length = reader.read_u16()? as usize;
        let sequence = reader.read_u32()?;

        let source = if flags & FLAG_HAS_SOURCE != 0 {
            Some(Identifier::from_bytes(reader.read(IDENTIFIER_SIZE)?)?)
        } else {
            None
        };
        let destination = if flags & FLAG_HAS_DESTINATION != 0 {
            Some(Identifier::from_bytes(reader.read(IDENTIFIER_SIZE)?)?)
        } else {
            None
        };

        let body = reader.read(length)?.to_vec();
        let signed_len = reader.offset();
        let signature = reader.rest().to_vec();

        if let Some(source) = &source {
            if signature.is_empty() {
                return Err(Error::BadSignature);
            }
            source.verify(&bytes[..signed_len], &signature)?;
        }

        Ok(Self { kind, sequence, source, destination, body, signature })
    }
}

/// Ephemeral key-agreement sealed body of a unicast transport message.
#[derive(Clone)]
pub struct CipherBody {
    pub source: [u8; ECDH_PUBLIC_SIZE],
    pub destination: [u8; ECDH_PUBLIC_SIZE],
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
}

impl CipherBody {
    /// Seals `plaintext` for the peer publishing `destination`.
    pub fn encrypt(plaintext: &[u8], local: &EcdhPair, destination: &[u8]) -> Result<Self> {
        if destination.len() != ECDH_PUBLIC_SIZE {
            return Err(Error::Malformed("bad key agreement public key"));
        }
        let key = local.agree(destination)?;
        let iv = crypto::generate_iv();
        let ciphertext = crypto::encrypt(&key, &iv, plaintext)?;

        let mut dest = [0u8; ECDH_PUBLIC_SIZE];
        dest.copy_from_slice(destination);
        Ok(Self { source: *local.public(), destination: dest, iv, ciphertext })
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(body);
        let source = reader.read_array::<ECDH_PUBLIC_SIZE>()?;
        let destination = reader.read_array::<ECDH_PUBLIC_SIZE>()?;
        let iv = reader.read_array::<IV_SIZE>()?;
        let ciphertext = reader.rest().to_vec();
        Ok(Self { source, destination, iv, ciphertext })
    }

    /// Opens the body. Fails with `CryptoKeyMismatch` when the embedded
    /// destination is not the local key-agreement public, and with
    /// `AuthFailed` on tag mismatch.
    pub fn decrypt(&self, local: &EcdhPair) -> Result<Vec<u8>> {
        if &self.destination != local.public() {
            return Err(Error::CryptoKeyMismatch);
        }
        let key = local.agree(&self.source)?;
        crypto::decrypt(&key, &self.iv, &self.ciphertext)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(2 * ECDH_PUBLIC_SIZE + IV_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.source);
        out.extend_from_slice(&self.destination);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

//! Directory signatures
//!
//! A signed directory file ends with a signature section:
//!
//! ```text
//! public_key_len u32 | public key | signature_len u32 | signature | signed_len u32
//! ```
//!
//! `signed_len` counts the leading bytes of the directory file covered by
//! the signature. It never reaches into the signature section itself.
//! Keys and signatures are Ed25519.

use crate::error::{PakError, Result};
use crate::header::DirectoryHeader;
use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;

pub use ed25519_dalek::SigningKey;

/// Size of the signature section written for an Ed25519 key
pub const SIGNATURE_SECTION_SIZE: usize =
    12 + ed25519_dalek::PUBLIC_KEY_LENGTH + ed25519_dalek::SIGNATURE_LENGTH;

/// Outcome of checking a directory signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    /// The directory carries no signature section
    NotSigned,
    /// Signed, but by a different key than the one expected
    WrongKey,
    /// The directory file could not be read
    IoFailure,
    /// Signed by the expected key, but the signature does not verify
    InvalidSignature,
    /// Signed by the expected key and the signed bytes are intact
    ValidSignature,
}

impl SignatureCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, SignatureCheck::ValidSignature)
    }
}

/// Parsed signature section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSignature {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    /// Leading bytes of the directory file covered by `signature`
    pub signed_len: u32,
}

impl ArchiveSignature {
    /// Sign the leading `prefix` bytes of a directory file
    pub fn sign(key: &SigningKey, prefix: &[u8]) -> Result<Self> {
        let signed_len = u32::try_from(prefix.len())
            .map_err(|_| PakError::Signing("directory exceeds 4 GiB".to_string()))?;

        Ok(ArchiveSignature {
            public_key: key.verifying_key().to_bytes().to_vec(),
            signature: key.sign(prefix).to_bytes().to_vec(),
            signed_len,
        })
    }

    /// Serialized size of the section
    pub fn section_len(&self) -> usize {
        12 + self.public_key.len() + self.signature.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.section_len());
        bytes.extend_from_slice(&(self.public_key.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.public_key);
        bytes.extend_from_slice(&(self.signature.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.signature);
        bytes.extend_from_slice(&self.signed_len.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = SectionCursor { bytes, pos: 0 };

        let key_len = cursor.u32()? as usize;
        let public_key = cursor.take(key_len)?.to_vec();
        let sig_len = cursor.u32()? as usize;
        let signature = cursor.take(sig_len)?.to_vec();
        let signed_len = cursor.u32()?;

        if cursor.pos != bytes.len() {
            return Err(PakError::Corrupt(format!(
                "{} trailing bytes after signature section",
                bytes.len() - cursor.pos
            )));
        }

        Ok(ArchiveSignature {
            public_key,
            signature,
            signed_len,
        })
    }

    /// Verify against the raw directory file bytes
    ///
    /// `signature_offset` is where the signature section starts; the
    /// signed range must end at or before it.
    pub fn verify(&self, expected_key: &[u8], file: &[u8], signature_offset: u64) -> SignatureCheck {
        if self.public_key != expected_key {
            return SignatureCheck::WrongKey;
        }

        let signed_len = self.signed_len as u64;
        if signed_len > signature_offset || signed_len > file.len() as u64 {
            return SignatureCheck::InvalidSignature;
        }

        let key_bytes: [u8; 32] = match self.public_key.as_slice().try_into() {
            Ok(bytes) => bytes,
            Err(_) => return SignatureCheck::InvalidSignature,
        };
        let Ok(verifying_key) = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes) else {
            return SignatureCheck::InvalidSignature;
        };
        let Ok(signature) = ed25519_dalek::Signature::from_slice(&self.signature) else {
            return SignatureCheck::InvalidSignature;
        };

        match verifying_key.verify(&file[..signed_len as usize], &signature) {
            Ok(()) => SignatureCheck::ValidSignature,
            Err(_) => SignatureCheck::InvalidSignature,
        }
    }
}

/// Check the signature of a complete directory file image
pub fn check_directory_signature(file: &[u8], expected_key: &[u8]) -> SignatureCheck {
    let header = match DirectoryHeader::from_bytes(file) {
        Ok(header) => header,
        Err(_) => return SignatureCheck::InvalidSignature,
    };

    // Header fields are part of the signed prefix; a header that does not
    // describe this file is tampered even when it claims no signature
    if header.file_len() != file.len() as u64 {
        return SignatureCheck::InvalidSignature;
    }

    if header.signature_section_size == 0 {
        return SignatureCheck::NotSigned;
    }

    let start = header.signature_offset();
    let end = header.file_len();

    match ArchiveSignature::from_bytes(&file[start as usize..end as usize]) {
        Ok(signature) => signature.verify(expected_key, file, start),
        Err(_) => SignatureCheck::InvalidSignature,
    }
}

/// Generate a fresh signing key from the OS random source
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Build a signing key from its 32-byte secret
pub fn signing_key_from_bytes(secret: &[u8]) -> Result<SigningKey> {
    let secret: [u8; 32] = secret.try_into().map_err(|_| {
        PakError::Signing(format!("signing key must be 32 bytes, got {}", secret.len()))
    })?;
    Ok(SigningKey::from_bytes(&secret))
}

struct SectionCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SectionCursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| PakError::Corrupt("truncated signature section".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

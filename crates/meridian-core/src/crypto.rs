//! Cryptographic primitives for Meridian.
//!
//! Provides two things:
//!   1. BLAKE3 hashing: piece digests, hash-list roots
//!   2. Ed25519 identities: handshake challenges, signed hash lists
//!
//! Private key material is wiped from memory when dropped.
//! There is no unsafe code in this module.

use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::wire::CHALLENGE_SIZE;

/// A peer's Ed25519 public key.
pub type PublicKey = [u8; 32];

/// Ed25519 signature bytes.
pub type SignatureBytes = [u8; 64];

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for content that arrives in pieces.
///
/// `finalize` does not consume the hasher, so a running digest can be read
/// at any point and fed further afterwards.
///
/// # Example
/// ```
/// use meridian_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, meridian_core::crypto::hash(b"hello world"));
/// ```
#[derive(Clone)]
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(&self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }

    pub fn reset(&mut self) {
        self.0.reset();
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// First four bytes of a key as hex, for log fields.
pub fn short_hex(key: &[u8]) -> String {
    hex::encode(&key[..4.min(key.len())])
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// A node's long-term Ed25519 identity.
///
/// Generated once per node and stored persistently. The public key is the
/// node's identity on the network; the private key never leaves this struct.
pub struct Identity {
    signing: SigningKey,
    /// Public key, sent in every handshake.
    pub public: PublicKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Reconstruct an identity from stored private key bytes.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&private_bytes))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public = signing.verifying_key().to_bytes();
        Self { signing, public }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.signing.sign(message).to_bytes()
    }

    /// Load the identity stored at `path`, generating and saving a fresh one
    /// if the file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let bytes = Zeroizing::new(
                std::fs::read(path).map_err(|e| CryptoError::KeyFile(path.to_path_buf(), e))?,
            );
            let private: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::KeyFileLength(path.to_path_buf(), bytes.len()))?;
            return Ok(Self::from_private(private));
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CryptoError::KeyFile(path.to_path_buf(), e))?;
        }
        write_private(path, identity.private_bytes().as_slice())
            .map_err(|e| CryptoError::KeyFile(path.to_path_buf(), e))?;

        Ok(identity)
    }
}

/// Create `path` owner-only (0600 on unix) and write `bytes` into it.
/// The mode is set at creation, so the seed is never readable by others.
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

// ── Signatures ────────────────────────────────────────────────────────────────

/// Verify `signature` over `message` against `public_key`.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::BadPublicKey)?;
    let signature: SignatureBytes = signature
        .try_into()
        .map_err(|_| CryptoError::BadSignatureLength(signature.len()))?;
    key.verify(message, &Signature::from_bytes(&signature))
        .map_err(|_| CryptoError::BadSignature)
}

/// Generate a fresh random handshake challenge.
pub fn generate_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("public key is not a valid Ed25519 point")]
    BadPublicKey,

    #[error("signature must be 64 bytes, got {0}")]
    BadSignatureLength(usize),

    #[error("signature does not verify")]
    BadSignature,

    #[error("failed to access key file {0}: {1}")]
    KeyFile(PathBuf, std::io::Error),

    #[error("key file {0} holds {1} bytes, expected 32")]
    KeyFileLength(PathBuf, usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Identity management using Ed25519
//!
//! Key storage is a collaborator concern: callers hand in signing key
//! bytes or let `Identity::generate` draw a fresh key.

use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;

use lao_core::{PublicKey, Signature};

/// Signing capability
pub trait Signer: Send + Sync {
    /// Public key matching the signatures this signer produces
    fn public_key(&self) -> PublicKey;

    /// Sign arbitrary bytes
    fn sign(&self, message: &[u8]) -> Signature;
}

/// Verification capability
pub trait Verifier: Send + Sync {
    fn verify(&self, key: &PublicKey, message: &[u8], signature: &Signature) -> bool;
}

/// Identity keypair for a client
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Create identity from existing signing key bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = PublicKey::from_bytes(signing_key.verifying_key().to_bytes());
        Identity {
            signing_key,
            public_key,
        }
    }

    /// Get the signing key bytes (secret)
    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Signer for Identity {
    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.signing_key.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Stateless Ed25519 verifier
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(&self, key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(key.as_bytes()) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
        verifying_key.verify(message, &sig).is_ok()
    }
}

//! Signed envelope - payload + sender signature + content id + witnesses
//!
//! An envelope is immutable. The witness list is the only part that may
//! grow, and growing it yields a new envelope.

use bytes::Bytes;

use lao_core::{MessageId, ProtocolError, ProtocolResult, PublicKey, Signature};

use crate::{Signer, Verifier};

/// Witness attestation over a message id
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WitnessSignature {
    pub witness: PublicKey,
    pub signature: Signature,
}

impl WitnessSignature {
    /// Sign `message_id` as a witness
    pub fn create(message_id: &MessageId, signer: &dyn Signer) -> Self {
        WitnessSignature {
            witness: signer.public_key(),
            signature: signer.sign(&message_id.digest()),
        }
    }

    /// Check the signature against the raw digest of `message_id`
    pub fn verify(&self, message_id: &MessageId, verifier: &dyn Verifier) -> bool {
        verifier.verify(&self.witness, &message_id.digest(), &self.signature)
    }
}

/// Signed protocol message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedEnvelope {
    sender: PublicKey,
    data: Bytes,
    signature: Signature,
    message_id: MessageId,
    witness_signatures: Vec<WitnessSignature>,
}

impl SignedEnvelope {
    /// Sign `data` and derive its message id
    pub fn seal(data: impl Into<Bytes>, signer: &dyn Signer) -> Self {
        let data = data.into();
        let signature = signer.sign(&data);
        let message_id = MessageId::compute(&data, signature.as_bytes());

        SignedEnvelope {
            sender: signer.public_key(),
            data,
            signature,
            message_id,
            witness_signatures: Vec::new(),
        }
    }

    /// Rebuild a received envelope from its parts. Call `verify` before
    /// trusting it.
    pub fn from_parts(
        sender: PublicKey,
        data: Bytes,
        signature: Signature,
        message_id: MessageId,
        witness_signatures: Vec<WitnessSignature>,
    ) -> Self {
        SignedEnvelope {
            sender,
            data,
            signature,
            message_id,
            witness_signatures,
        }
    }

    /// Check the sender signature, then the carried id
    pub fn verify(&self, verifier: &dyn Verifier) -> ProtocolResult<()> {
        if !verifier.verify(&self.sender, &self.data, &self.signature) {
            return Err(ProtocolError::BadSignature(self.sender));
        }

        let computed = MessageId::compute(&self.data, self.signature.as_bytes());
        if computed != self.message_id {
            return Err(ProtocolError::IdentifierMismatch {
                carried: self.message_id,
                computed,
            });
        }

        Ok(())
    }

    /// Attach a witness signature, returning the enlarged envelope.
    /// Re-adding a witness already present is a no-op.
    pub fn add_witness(
        &self,
        witness: PublicKey,
        signature: Signature,
        verifier: &dyn Verifier,
    ) -> ProtocolResult<Self> {
        let entry = WitnessSignature { witness, signature };
        if !entry.verify(&self.message_id, verifier) {
            return Err(ProtocolError::BadWitnessSignature(witness));
        }

        let mut next = self.clone();
        if !next.witness_signatures.iter().any(|w| w.witness == witness) {
            next.witness_signatures.push(entry);
        }
        Ok(next)
    }

    /// Witness signature of `signer` over this envelope
    pub fn witness(&self, signer: &dyn Signer) -> WitnessSignature {
        WitnessSignature::create(&self.message_id, signer)
    }

    /// Witness keys whose carried signatures verify; unverifiable
    /// entries are skipped
    pub fn verified_witnesses<'a>(
        &'a self,
        verifier: &'a dyn Verifier,
    ) -> impl Iterator<Item = PublicKey> + 'a {
        self.witness_signatures.iter().filter_map(move |w| {
            if w.verify(&self.message_id, verifier) {
                Some(w.witness)
            } else {
                tracing::warn!(
                    witness = %w.witness,
                    message_id = %self.message_id,
                    "Ignoring invalid carried witness signature"
                );
                None
            }
        })
    }

    #[inline]
    pub fn sender(&self) -> &PublicKey {
        &self.sender
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    #[inline]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    #[inline]
    pub fn witness_signatures(&self) -> &[WitnessSignature] {
        &self.witness_signatures
    }
}

//! Envelope in its JSON wire form
//!
//! `{sender, data, signature, message_id, witness_signatures: [{witness, signature}]}`
//! where `data` is the base64url-encoded payload.

use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use lao_core::{MessageId, ProtocolError, PublicKey, Signature, BASE64URL};
use lao_crypto::{SignedEnvelope, WitnessSignature};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireWitnessSignature {
    pub witness: PublicKey,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub sender: PublicKey,
    pub data: String,
    pub signature: Signature,
    pub message_id: MessageId,
    #[serde(default)]
    pub witness_signatures: Vec<WireWitnessSignature>,
}

impl From<&SignedEnvelope> for WireMessage {
    fn from(envelope: &SignedEnvelope) -> Self {
        WireMessage {
            sender: *envelope.sender(),
            data: BASE64URL.encode(envelope.data()),
            signature: *envelope.signature(),
            message_id: envelope.message_id(),
            witness_signatures: envelope
                .witness_signatures()
                .iter()
                .map(|w| WireWitnessSignature {
                    witness: w.witness,
                    signature: w.signature,
                })
                .collect(),
        }
    }
}

impl TryFrom<WireMessage> for SignedEnvelope {
    type Error = ProtocolError;

    /// Structural decoding only; the caller still has to `verify`
    fn try_from(msg: WireMessage) -> Result<Self, Self::Error> {
        let data = BASE64URL
            .decode(&msg.data)
            .map_err(|e| ProtocolError::MalformedData(format!("message data: {e}")))?;

        Ok(SignedEnvelope::from_parts(
            msg.sender,
            Bytes::from(data),
            msg.signature,
            msg.message_id,
            msg.witness_signatures
                .into_iter()
                .map(|w| WitnessSignature {
                    witness: w.witness,
                    signature: w.signature,
                })
                .collect(),
        ))
    }
}

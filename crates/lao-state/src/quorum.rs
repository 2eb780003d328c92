//! Witness quorum policy
//!
//! The organizer is never counted as a witness. With an empty witness set
//! no witness signature is required: the organizer's own signature on the
//! envelope is the single signature that makes a modification
//! authoritative.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Every declared witness must sign
    #[default]
    AllWitnesses,
    /// Strictly more than half of the witnesses
    Majority,
    /// At least this fraction of the witnesses, rounded up, never zero
    Fraction(f64),
}

impl QuorumPolicy {
    /// Witness signatures needed out of `witness_count`
    pub fn required(&self, witness_count: usize) -> usize {
        if witness_count == 0 {
            return 0;
        }
        match *self {
            QuorumPolicy::AllWitnesses => witness_count,
            QuorumPolicy::Majority => witness_count / 2 + 1,
            QuorumPolicy::Fraction(f) => {
                let f = if f.is_finite() { f.clamp(0.0, 1.0) } else { 1.0 };
                let needed = (f * witness_count as f64).ceil() as usize;
                needed.clamp(1, witness_count)
            }
        }
    }

    #[inline]
    pub fn is_met(&self, signed: usize, witness_count: usize) -> bool {
        signed >= self.required(witness_count)
    }
}

impl fmt::Display for QuorumPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumPolicy::AllWitnesses => f.write_str("all"),
            QuorumPolicy::Majority => f.write_str("majority"),
            QuorumPolicy::Fraction(x) => write!(f, "{x}"),
        }
    }
}

impl FromStr for QuorumPolicy {
    type Err = String;

    /// `all`, `majority`, or a fraction in `(0, 1]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all" => Ok(QuorumPolicy::AllWitnesses),
            "majority" => Ok(QuorumPolicy::Majority),
            other => match other.parse::<f64>() {
                Ok(f) if f > 0.0 && f <= 1.0 => Ok(QuorumPolicy::Fraction(f)),
                _ => Err(format!("invalid quorum policy {other:?}")),
            },
        }
    }
}

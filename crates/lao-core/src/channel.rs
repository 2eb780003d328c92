//! Channel addressing
//!
//! A channel is a slash-delimited path rooted at `root`, e.g.
//! `/root/<laoId>/<electionId>`. It is both the pub/sub topic and the
//! namespace entity identifiers are derived in.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ChannelError;

/// First segment of every channel
pub const ROOT_SEGMENT: &str = "root";

/// Immutable, validated channel path
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(String);

impl Channel {
    /// The `/root` channel
    pub fn root() -> Self {
        Channel(format!("/{ROOT_SEGMENT}"))
    }

    /// Parse and validate a channel path
    pub fn parse(path: &str) -> Result<Self, ChannelError> {
        let invalid = |reason| ChannelError::InvalidChannel {
            path: path.to_string(),
            reason,
        };

        if path.is_empty() {
            return Err(invalid("empty path"));
        }
        let rest = path.strip_prefix('/').ok_or_else(|| invalid("missing leading '/'"))?;

        let mut segments = rest.split('/');
        if segments.next() != Some(ROOT_SEGMENT) {
            return Err(invalid("not rooted at 'root'"));
        }
        if segments.any(str::is_empty) {
            return Err(invalid("empty segment"));
        }

        Ok(Channel(path.to_string()))
    }

    /// Channel for an organization: `/root/<laoId>`
    pub fn for_lao(lao_id: &str) -> Result<Self, ChannelError> {
        Channel::root().child(lao_id)
    }

    /// Append a segment
    pub fn child(&self, segment: &str) -> Result<Self, ChannelError> {
        if segment.is_empty() || segment.contains('/') {
            return Err(ChannelError::InvalidChannel {
                path: format!("{}/{}", self.0, segment),
                reason: "invalid segment",
            });
        }
        Ok(Channel(format!("{}/{}", self.0, segment)))
    }

    /// True if `self` equals `other` or lies below it
    pub fn is_sub_channel_of(&self, other: &Channel) -> bool {
        match self.0.strip_prefix(other.0.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Path segments, `root` included
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }

    /// Organization id carried by the second segment
    pub fn lao_id(&self) -> Option<&str> {
        self.segments().nth(1)
    }

    /// Truncate to the organization channel `/root/<laoId>`
    pub fn lao_channel(&self) -> Option<Channel> {
        self.lao_id().map(|id| Channel(format!("/{ROOT_SEGMENT}/{id}")))
    }

    /// Number of segments below `root`
    pub fn depth(&self) -> usize {
        self.segments().count() - 1
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({})", self.0)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Channel {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::parse(s)
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Channel::parse(&s).map_err(serde::de::Error::custom)
    }
}

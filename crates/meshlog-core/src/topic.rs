//! Topics: the logical destination of a client envelope.
//!
//! A topic is encoded as a single kind byte followed by an opaque
//! identifier. Some kinds are reserved for node-internal protocols and
//! bypass fee accounting when replicated.

use bytes::Bytes;
use std::fmt;

use crate::error::{CoreError, Result};

/// Discriminator for the kind of data a topic carries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum TopicKind {
    GroupMessagesV1 = 0,
    WelcomeMessagesV1 = 1,
    IdentityUpdatesV1 = 2,
    KeyPackagesV1 = 3,
    PayerReportsV1 = 4,
    PayerReportAttestationsV1 = 5,
}

impl TopicKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::GroupMessagesV1),
            1 => Some(Self::WelcomeMessagesV1),
            2 => Some(Self::IdentityUpdatesV1),
            3 => Some(Self::KeyPackagesV1),
            4 => Some(Self::PayerReportsV1),
            5 => Some(Self::PayerReportAttestationsV1),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Reserved kinds are produced by nodes themselves, not by paying clients.
    pub const fn is_reserved(self) -> bool {
        matches!(self, Self::PayerReportsV1 | Self::PayerReportAttestationsV1)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::GroupMessagesV1 => "group_messages_v1",
            Self::WelcomeMessagesV1 => "welcome_messages_v1",
            Self::IdentityUpdatesV1 => "identity_updates_v1",
            Self::KeyPackagesV1 => "key_packages_v1",
            Self::PayerReportsV1 => "payer_reports_v1",
            Self::PayerReportAttestationsV1 => "payer_report_attestations_v1",
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed topic: kind plus identifier bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    kind: TopicKind,
    identifier: Bytes,
}

impl Topic {
    pub fn new(kind: TopicKind, identifier: impl Into<Bytes>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
        }
    }

    /// Parse a topic from its wire bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (&kind_byte, identifier) = bytes
            .split_first()
            .ok_or_else(|| CoreError::InvalidTopic("empty topic".into()))?;

        let kind = TopicKind::from_u8(kind_byte)
            .ok_or_else(|| CoreError::InvalidTopic(format!("unknown topic kind {}", kind_byte)))?;

        Ok(Self {
            kind,
            identifier: Bytes::copy_from_slice(identifier),
        })
    }

    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    pub fn is_reserved(&self) -> bool {
        self.kind.is_reserved()
    }

    /// Wire bytes: `[kind] ++ identifier`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.identifier.len());
        out.push(self.kind.as_u8());
        out.extend_from_slice(&self.identifier);
        out
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, hex::encode(&self.identifier))
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_group_topic() {
        let topic = Topic::parse(&[0, 0xde, 0xad]).unwrap();
        assert_eq!(topic.kind(), TopicKind::GroupMessagesV1);
        assert_eq!(topic.identifier(), &[0xde, 0xad]);
        assert!(!topic.is_reserved());
        assert_eq!(topic.to_string(), "group_messages_v1/dead");
        assert_eq!(topic.to_bytes(), vec![0, 0xde, 0xad]);
    }

    #[test]
    fn test_parse_rejects_empty_and_unknown() {
        assert!(matches!(Topic::parse(&[]), Err(CoreError::InvalidTopic(_))));
        assert!(matches!(Topic::parse(b"broken"), Err(CoreError::InvalidTopic(_))));
    }

    #[test]
    fn test_reserved_kinds() {
        assert!(TopicKind::PayerReportsV1.is_reserved());
        assert!(TopicKind::PayerReportAttestationsV1.is_reserved());
        assert!(!TopicKind::KeyPackagesV1.is_reserved());
        assert!(Topic::new(TopicKind::PayerReportsV1, vec![1u8]).is_reserved());
    }
}

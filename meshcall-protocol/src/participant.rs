use serde::{Deserialize, Serialize};

/// Unique identifier for a call participant.
///
/// Identifiers are opaque to the call engine, but totally ordered: whenever two participants need to
/// agree on who initiates a negotiation, the higher-sorting identifier wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for ParticipantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for ParticipantId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ordering_is_lexicographic() {
        let mut ids = vec![
            ParticipantId::from("user-b"),
            ParticipantId::from("user-a"),
            ParticipantId::from("user-c"),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                ParticipantId::from("user-a"),
                ParticipantId::from("user-b"),
                ParticipantId::from("user-c"),
            ]
        );
    }

    #[test]
    fn serializes_transparently() {
        let id = ParticipantId::from("user-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"user-1\"");
    }
}

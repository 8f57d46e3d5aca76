use crate::ParticipantId;
use serde::{Deserialize, Serialize};

/// Name of the pub/sub topic a room is signaled over.
///
/// Topics are derived deterministically from the entity hosting the call, so every intended
/// participant (and nobody else) computes the same string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct RoomTopic(String);

impl RoomTopic {
    /// Voice channel of a team.
    pub fn team(team_id: impl AsRef<str>) -> Self {
        Self(format!("team:{}", team_id.as_ref()))
    }

    /// A scheduled meeting.
    pub fn meeting(meeting_id: impl AsRef<str>) -> Self {
        Self(format!("meeting:{}", meeting_id.as_ref()))
    }

    /// A 1:1 conversation. The pair is sorted, so both sides derive the same topic regardless of who
    /// places the call.
    pub fn conversation(a: &ParticipantId, b: &ParticipantId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("dm:{low}:{high}"))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoomTopic {
    type Err = String;

    /// Parses `team:<id>`, `meeting:<id>` and `dm:<a>:<b>` topics.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("team", id)) if !id.is_empty() => Ok(Self::team(id)),
            Some(("meeting", id)) if !id.is_empty() => Ok(Self::meeting(id)),
            Some(("dm", pair)) => match pair.split_once(':') {
                Some((a, b)) if !a.is_empty() && !b.is_empty() => Ok(Self::conversation(
                    &ParticipantId::from(a),
                    &ParticipantId::from(b),
                )),
                _ => Err(format!("invalid conversation topic `{s}`")),
            },
            _ => Err(format!("unknown room topic `{s}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn conversation_topic_is_symmetric() {
        let alice = ParticipantId::from("alice");
        let bob = ParticipantId::from("bob");
        assert_eq!(
            RoomTopic::conversation(&alice, &bob),
            RoomTopic::conversation(&bob, &alice)
        );
        assert_eq!(RoomTopic::conversation(&bob, &alice).as_str(), "dm:alice:bob");
    }

    #[test]
    fn parse() {
        assert_eq!("team:42".parse::<RoomTopic>(), Ok(RoomTopic::team("42")));
        assert_eq!(
            "meeting:standup".parse::<RoomTopic>(),
            Ok(RoomTopic::meeting("standup"))
        );
        assert_eq!(
            "dm:zoe:adam".parse::<RoomTopic>().map(|t| t.to_string()),
            Ok("dm:adam:zoe".to_string())
        );
        assert!("team:".parse::<RoomTopic>().is_err());
        assert!("dm:alice".parse::<RoomTopic>().is_err());
        assert!("lobby".parse::<RoomTopic>().is_err());
    }
}

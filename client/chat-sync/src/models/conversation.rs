use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{ConversationId, UserId};

/// A match between two users that owns one message thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn includes(&self, user_id: UserId) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    /// Whichever participant is not `local_user`; `None` if `local_user` isn't part of it.
    pub fn other_participant(&self, local_user: UserId) -> Option<UserId> {
        if self.participant_a == local_user {
            Some(self.participant_b)
        } else if self.participant_b == local_user {
            Some(self.participant_a)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_other_participant() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let conversation = Conversation {
            id: 1,
            participant_a: a,
            participant_b: b,
            last_message_at: None,
        };

        assert_eq!(conversation.other_participant(a), Some(b));
        assert_eq!(conversation.other_participant(b), Some(a));
        assert_eq!(conversation.other_participant(Uuid::new_v4()), None);
        assert!(conversation.includes(a));
    }
}

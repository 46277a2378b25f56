use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest accepted group name, in characters
pub const MAX_GROUP_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationKind {
    /// Exactly two participants, stored in ascending id order.
    Private { participants: [Uuid; 2] },
    Group { name: String, creator_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: ConversationKind,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_group(&self) -> bool {
        matches!(self.kind, ConversationKind::Group { .. })
    }

    pub fn group_name(&self) -> Option<&str> {
        match &self.kind {
            ConversationKind::Group { name, .. } => Some(name),
            ConversationKind::Private { .. } => None,
        }
    }

    pub fn creator_id(&self) -> Option<Uuid> {
        match &self.kind {
            ConversationKind::Group { creator_id, .. } => Some(*creator_id),
            ConversationKind::Private { .. } => None,
        }
    }

    /// For a private conversation, the participant that is not `user`.
    pub fn counterpart(&self, user: Uuid) -> Option<Uuid> {
        match &self.kind {
            ConversationKind::Private { participants: [a, b] } if *a == user => Some(*b),
            ConversationKind::Private { participants: [a, b] } if *b == user => Some(*a),
            _ => None,
        }
    }
}

/// Where a send should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SendTarget {
    Conversation(Uuid),
    /// The private conversation between the sender and this user
    User(Uuid),
    /// A group by its unique name
    Group(String),
}

/// Open invitation for a user to join a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInvite {
    pub group_id: Uuid,
    pub group_name: String,
    pub inviter_id: Uuid,
    pub invitee_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// One row of a user's conversation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub latest_seq: i64,
    pub last_read_seq: i64,
    pub unread: i64,
}

impl ConversationSummary {
    pub fn new(conversation: Conversation, latest_seq: i64, last_read_seq: i64) -> Self {
        Self {
            conversation,
            latest_seq,
            last_read_seq,
            unread: (latest_seq - last_read_seq).max(0),
        }
    }
}

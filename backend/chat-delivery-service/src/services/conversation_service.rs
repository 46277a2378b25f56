use crate::error::{AppError, AppResult, Existing, Resource};
use crate::models::conversation::MAX_GROUP_NAME_LEN;
use crate::models::{Conversation, ConversationKind, GroupInvite, SendTarget};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Namespace for deriving private conversation ids from participant pairs.
const PRIVATE_CONVERSATION_NAMESPACE: Uuid =
    Uuid::from_u128(0x6f1c_2a4e_93b7_4d0a_8e52_c1f0_7a3d_9b14);

/// Stable id of the private conversation between two users.
///
/// Pure function of the unordered pair, so both sides resolve the same id
/// without a lookup.
pub fn resolve_private(a: Uuid, b: Uuid) -> Uuid {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut name = [0u8; 32];
    name[..16].copy_from_slice(lo.as_bytes());
    name[16..].copy_from_slice(hi.as_bytes());
    Uuid::new_v5(&PRIVATE_CONVERSATION_NAMESPACE, &name)
}

/// Persistence for conversations, group membership and invites.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Insert the private conversation if it does not exist yet and return
    /// the stored row either way.
    async fn ensure_private(&self, conversation: Conversation) -> AppResult<Conversation>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Conversation>>;

    /// Insert a group with its creator as first member. Fails with
    /// `AlreadyExists` when the name is taken.
    async fn create_group(&self, conversation: Conversation) -> AppResult<Conversation>;

    async fn find_group(&self, name: &str) -> AppResult<Option<Conversation>>;

    /// Returns true when the user was not a member before.
    async fn add_member(&self, group_id: Uuid, user_id: Uuid) -> AppResult<bool>;

    /// Returns true when the user was a member. Refuses to remove the last
    /// member of a group.
    async fn remove_member(&self, group_id: Uuid, user_id: Uuid) -> AppResult<bool>;

    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool>;

    async fn member_count(&self, conversation_id: Uuid) -> AppResult<usize>;

    /// Members ordered by id, strictly after `after`.
    async fn members_page(
        &self,
        conversation_id: Uuid,
        after: Option<Uuid>,
        limit: usize,
    ) -> AppResult<Vec<Uuid>>;

    async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Conversation>>;

    /// Returns false when an invite for (group, invitee) is already open.
    async fn create_invite(&self, invite: GroupInvite) -> AppResult<bool>;

    /// Remove and return the open invite, if any.
    async fn take_invite(&self, group_id: Uuid, invitee_id: Uuid)
        -> AppResult<Option<GroupInvite>>;

    async fn invites_for(&self, invitee_id: Uuid) -> AppResult<Vec<GroupInvite>>;
}

/// Conversation rules on top of a [`ConversationStore`].
#[derive(Clone)]
pub struct ConversationResolver {
    store: Arc<dyn ConversationStore>,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Resolve (creating on first use) the private conversation of two users.
    pub async fn open_private(
        &self,
        a: Uuid,
        b: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Conversation> {
        if a == b {
            return Err(AppError::BadRequest(
                "a private conversation needs two distinct users".into(),
            ));
        }
        let participants = if a <= b { [a, b] } else { [b, a] };
        let conversation = Conversation {
            id: resolve_private(a, b),
            kind: ConversationKind::Private { participants },
            created_at: now,
        };
        self.store.ensure_private(conversation).await
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Conversation> {
        self.store
            .get(id)
            .await?
            .ok_or(AppError::NotFound(Resource::Conversation))
    }

    pub async fn resolve_group(&self, name: &str) -> AppResult<Conversation> {
        self.store
            .find_group(name.trim())
            .await?
            .ok_or(AppError::NotFound(Resource::Group))
    }

    pub async fn create_group(
        &self,
        name: &str,
        creator_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Conversation> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest("group name must not be empty".into()));
        }
        if name.chars().count() > MAX_GROUP_NAME_LEN {
            return Err(AppError::BadRequest(format!(
                "group name exceeds {MAX_GROUP_NAME_LEN} characters"
            )));
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Group {
                name: name.to_string(),
                creator_id,
            },
            created_at: now,
        };
        let group = self.store.create_group(conversation).await?;
        tracing::info!(group_id = %group.id, %creator_id, "group created");
        Ok(group)
    }

    /// Resolve where a message from `sender` should be appended and check the
    /// sender may post there.
    pub async fn resolve_target(
        &self,
        sender: Uuid,
        target: &SendTarget,
        now: DateTime<Utc>,
    ) -> AppResult<Conversation> {
        let conversation = match target {
            SendTarget::User(recipient) => return self.open_private(sender, *recipient, now).await,
            SendTarget::Group(name) => self.resolve_group(name).await?,
            SendTarget::Conversation(id) => self.get(*id).await?,
        };
        self.ensure_participant(&conversation, sender).await?;
        Ok(conversation)
    }

    pub async fn is_participant(&self, conversation: &Conversation, user: Uuid) -> AppResult<bool> {
        match &conversation.kind {
            ConversationKind::Private { participants } => Ok(participants.contains(&user)),
            ConversationKind::Group { .. } => self.store.is_member(conversation.id, user).await,
        }
    }

    pub async fn ensure_participant(&self, conversation: &Conversation, user: Uuid) -> AppResult<()> {
        if self.is_participant(conversation, user).await? {
            Ok(())
        } else {
            Err(AppError::not_member())
        }
    }

    /// Load a conversation the user takes part in.
    pub async fn accessible(&self, conversation_id: Uuid, user: Uuid) -> AppResult<Conversation> {
        let conversation = self.get(conversation_id).await?;
        self.ensure_participant(&conversation, user).await?;
        Ok(conversation)
    }

    pub async fn group(&self, group_id: Uuid) -> AppResult<Conversation> {
        let conversation = self.get(group_id).await?;
        if !conversation.is_group() {
            return Err(AppError::BadRequest(
                "operation only applies to group conversations".into(),
            ));
        }
        Ok(conversation)
    }

    /// Any member may add another user. Adding an existing member is a no-op.
    pub async fn add_member(&self, group_id: Uuid, requester: Uuid, user: Uuid) -> AppResult<bool> {
        let group = self.group(group_id).await?;
        self.ensure_participant(&group, requester).await?;
        let added = self.store.add_member(group.id, user).await?;
        if added {
            tracing::info!(%group_id, user_id = %user, added_by = %requester, "member added");
        }
        Ok(added)
    }

    /// The creator may remove anyone, other members only themselves.
    pub async fn remove_member(
        &self,
        group_id: Uuid,
        requester: Uuid,
        user: Uuid,
    ) -> AppResult<bool> {
        let group = self.group(group_id).await?;
        if requester != user && group.creator_id() != Some(requester) {
            return Err(AppError::PermissionDenied(
                "only the group creator can remove other members".into(),
            ));
        }
        let removed = self.store.remove_member(group.id, user).await?;
        if removed {
            tracing::info!(%group_id, user_id = %user, removed_by = %requester, "member removed");
        }
        Ok(removed)
    }

    pub async fn members_page(
        &self,
        group_id: Uuid,
        requester: Uuid,
        after: Option<Uuid>,
        limit: usize,
    ) -> AppResult<Vec<Uuid>> {
        let group = self.group(group_id).await?;
        self.ensure_participant(&group, requester).await?;
        self.store.members_page(group.id, after, limit).await
    }

    pub async fn invite(
        &self,
        group_id: Uuid,
        inviter: Uuid,
        invitee: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<GroupInvite> {
        let group = self.group(group_id).await?;
        self.ensure_participant(&group, inviter).await?;
        if self.store.is_member(group.id, invitee).await? {
            return Err(AppError::AlreadyExists(Existing::Membership));
        }
        let invite = GroupInvite {
            group_id: group.id,
            group_name: group.group_name().unwrap_or_default().to_string(),
            inviter_id: inviter,
            invitee_id: invitee,
            created_at: now,
        };
        if !self.store.create_invite(invite.clone()).await? {
            return Err(AppError::AlreadyExists(Existing::Invite));
        }
        Ok(invite)
    }

    /// Consume the invite and join the group.
    pub async fn accept_invite(&self, group_id: Uuid, invitee: Uuid) -> AppResult<Conversation> {
        let group = self.group(group_id).await?;
        self.store
            .take_invite(group.id, invitee)
            .await?
            .ok_or(AppError::NotFound(Resource::Invite))?;
        self.store.add_member(group.id, invitee).await?;
        tracing::info!(%group_id, user_id = %invitee, "invite accepted");
        Ok(group)
    }

    pub async fn decline_invite(&self, group_id: Uuid, invitee: Uuid) -> AppResult<()> {
        self.store
            .take_invite(group_id, invitee)
            .await?
            .ok_or(AppError::NotFound(Resource::Invite))?;
        Ok(())
    }

    pub async fn pending_invites(&self, invitee: Uuid) -> AppResult<Vec<GroupInvite>> {
        self.store.invites_for(invitee).await
    }

    pub async fn conversations_for(&self, user: Uuid) -> AppResult<Vec<Conversation>> {
        self.store.conversations_for(user).await
    }
}

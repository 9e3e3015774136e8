//! Target write API.
//!
//! Steps never talk to a target store directly. They ask an
//! [`EntityFactory`] for an [`ImportableEntity`] of a typed [`EntityKind`],
//! set its fields and save it under a source id; saving writes the record and
//! its translation together.

mod entity;
mod memory;
mod sled_store;

pub use entity::{
    EntityConstructor, EntityFactory, EntityRecord, EntityRegistry, ImportServices,
    ImportableEntity, NodeRecord,
};
pub use memory::MemoryTarget;
pub use sled_store::SledTarget;

use serde_json::{Map, Value};

use crate::error::Error;

/// Field map of a target record.
pub type Fields = Map<String, Value>;

/// Kinds of target records the importer can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    UserGroup,
    UserField,
    User,
    UserFollow,
    UserIgnore,
    Node,
    NodePermission,
    ForumWatch,
    ThreadPrefixGroup,
    ThreadPrefix,
    Thread,
    ThreadWatch,
    Post,
    Conversation,
    ConversationMessage,
    ProfilePost,
    ProfilePostComment,
    Poll,
    PollResponse,
    Attachment,
    Reaction,
    ReactionContent,
}

impl EntityKind {
    /// Every kind, in declaration order.
    pub const ALL: [EntityKind; 22] = [
        EntityKind::UserGroup,
        EntityKind::UserField,
        EntityKind::User,
        EntityKind::UserFollow,
        EntityKind::UserIgnore,
        EntityKind::Node,
        EntityKind::NodePermission,
        EntityKind::ForumWatch,
        EntityKind::ThreadPrefixGroup,
        EntityKind::ThreadPrefix,
        EntityKind::Thread,
        EntityKind::ThreadWatch,
        EntityKind::Post,
        EntityKind::Conversation,
        EntityKind::ConversationMessage,
        EntityKind::ProfilePost,
        EntityKind::ProfilePostComment,
        EntityKind::Poll,
        EntityKind::PollResponse,
        EntityKind::Attachment,
        EntityKind::Reaction,
        EntityKind::ReactionContent,
    ];

    /// Entity type used for translations and target storage.
    pub fn content_type(self) -> &'static str {
        match self {
            EntityKind::UserGroup => "user_group",
            EntityKind::UserField => "user_field",
            EntityKind::User => "user",
            EntityKind::UserFollow => "user_follow",
            EntityKind::UserIgnore => "user_ignore",
            EntityKind::Node => "node",
            EntityKind::NodePermission => "node_permission",
            EntityKind::ForumWatch => "forum_watch",
            EntityKind::ThreadPrefixGroup => "thread_prefix_group",
            EntityKind::ThreadPrefix => "thread_prefix",
            EntityKind::Thread => "thread",
            EntityKind::ThreadWatch => "thread_watch",
            EntityKind::Post => "post",
            EntityKind::Conversation => "conversation",
            EntityKind::ConversationMessage => "conversation_message",
            EntityKind::ProfilePost => "profile_post",
            EntityKind::ProfilePostComment => "profile_post_comment",
            EntityKind::Poll => "poll",
            EntityKind::PollResponse => "poll_response",
            EntityKind::Attachment => "attachment",
            EntityKind::Reaction => "reaction",
            EntityKind::ReactionContent => "reaction_content",
        }
    }

    /// Field linking a child record to its parent, for kinds saved as children.
    pub fn parent_field(self) -> Option<&'static str> {
        match self {
            EntityKind::ConversationMessage => Some("conversation_id"),
            EntityKind::ProfilePostComment => Some("profile_post_id"),
            EntityKind::PollResponse => Some("poll_id"),
            _ => None,
        }
    }

    /// Fields a target requires to be present and non-empty.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            EntityKind::UserGroup | EntityKind::Node | EntityKind::ThreadPrefix => &["title"],
            EntityKind::UserField => &["field_id", "field_type"],
            EntityKind::User => &["username"],
            EntityKind::Thread => &["node_id", "title"],
            EntityKind::Post => &["thread_id", "message"],
            EntityKind::Conversation => &["title"],
            EntityKind::ConversationMessage => &["message"],
            EntityKind::ProfilePost => &["profile_user_id", "message"],
            EntityKind::ProfilePostComment => &["message"],
            EntityKind::Poll => &["content_id", "question"],
            EntityKind::PollResponse => &["response"],
            EntityKind::Attachment => &["content_type", "content_id"],
            EntityKind::ReactionContent => &["content_id", "reaction_user_id"],
            EntityKind::UserFollow | EntityKind::UserIgnore => &["user_id"],
            EntityKind::ForumWatch => &["node_id", "user_id"],
            EntityKind::ThreadWatch => &["thread_id", "user_id"],
            EntityKind::NodePermission => &["node_id", "user_group_id"],
            EntityKind::ThreadPrefixGroup | EntityKind::Reaction => &[],
        }
    }

    /// Ids the target reserves for built-in records of this kind.
    ///
    /// User groups 1..=4 are guest, registered, administrator and moderator;
    /// reaction 1 is the stock "Like".
    pub fn reserved_ids(self) -> u64 {
        match self {
            EntityKind::UserGroup => 4,
            EntityKind::Reaction => 1,
            _ => 0,
        }
    }

    /// Whether `fields` satisfy [`required_fields`](Self::required_fields).
    pub fn accepts(self, fields: &Fields) -> bool {
        self.required_fields().iter().all(|name| match fields.get(*name) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(_) => true,
        })
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.content_type())
    }
}

/// Storage behind the write API.
pub trait TargetStore: Send + Sync {
    /// Create a record. `None` when the target rejects it.
    fn create(&self, kind: EntityKind, fields: &Fields) -> Result<Option<u64>, Error>;

    /// Merge `fields` into an existing record.
    fn update(&self, kind: EntityKind, id: u64, fields: &Fields) -> Result<(), Error>;

    /// Read a record.
    fn get(&self, kind: EntityKind, id: u64) -> Result<Option<Fields>, Error>;

    /// First record whose `field` equals `value`, compared case-insensitively for strings.
    fn find_by(&self, kind: EntityKind, field: &str, value: &Value) -> Result<Option<u64>, Error>;

    /// Maximum integer `field` among records whose `where_field` equals `where_value`.
    fn max_where(
        &self,
        kind: EntityKind,
        field: &str,
        where_field: &str,
        where_value: &Value,
    ) -> Result<Option<i64>, Error>;

    /// Number of records of a kind.
    fn count(&self, kind: EntityKind) -> Result<u64, Error>;
}

pub(crate) fn field_matches(fields: &Fields, field: &str, value: &Value) -> bool {
    match (fields.get(field), value) {
        (Some(Value::String(a)), Value::String(b)) => a.eq_ignore_ascii_case(b),
        (Some(a), b) => crate::source::loose_eq(a, b),
        (None, _) => false,
    }
}

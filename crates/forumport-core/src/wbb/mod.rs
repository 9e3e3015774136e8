//! WoltLab Suite / Burning Board step catalog.
//!
//! Source tables are read through the suite prefix (`wcf1_` by default) and
//! the board prefix derived from it (`wbb1_`). Records are written through
//! the typed entity factory, so every step is re-entrant.

mod attachments;
mod forums;
mod likes;
mod social;
mod threads;
mod users;

use serde_json::{Map, Value};

use crate::error::Error;
use crate::idmap::SourceKey;
use crate::job::{Derived, JobContext, Paged, StepCatalog, StepDef};
use crate::source::{SourceRow, SourceTable};
use crate::target::Fields;

pub use attachments::Attachments;
pub use forums::{Forums, NodePermissions, ThreadPrefixes, WatchedForums};
pub use likes::Likes;
pub use social::{Conversations, ProfilePosts};
pub use threads::{Polls, Posts, Threads, WatchedThreads};
pub use users::{FollowedUsers, IgnoredUsers, UserFields, UserGroups, Users};

/// Object type names of the suite's polymorphic tables.
pub mod object_type {
    pub const BOARD: &str = "com.woltlab.wbb.board";
    pub const THREAD: &str = "com.woltlab.wbb.thread";
    pub const POST: &str = "com.woltlab.wbb.post";
    pub const LIKEABLE_POST: &str = "com.woltlab.wbb.likeablePost";
    pub const CONVERSATION_MESSAGE: &str = "com.woltlab.wcf.conversation.message";
    pub const PROFILE_COMMENT: &str = "com.woltlab.wcf.user.profileComment";
}

/// Username used when the source row has none.
pub(crate) const UNKNOWN_USERNAME: &str = "Unknown Account";

/// Step definitions in declaration order.
pub fn step_defs() -> Vec<StepDef> {
    vec![
        StepDef::new("userGroups", "User groups"),
        StepDef::new("userFields", "Custom user fields")
            .provides(&[Derived::FieldMap, Derived::CustomFieldMap]),
        StepDef::new("users", "Users and avatars")
            .depends_on(&["userGroups", "userFields"])
            .reads(&[Derived::FieldMap, Derived::CustomFieldMap]),
        StepDef::new("followedUsers", "Following users").depends_on(&["users"]),
        StepDef::new("ignoredUsers", "Ignored users").depends_on(&["users"]),
        StepDef::new("conversations", "Conversations").depends_on(&["users"]),
        StepDef::new("profilePosts", "Profile posts").depends_on(&["users"]),
        StepDef::new("forums", "Nodes"),
        StepDef::new("nodePermissions", "Node permissions").depends_on(&["forums", "users"]),
        StepDef::new("watchedForums", "Watched forums").depends_on(&["forums", "users"]),
        StepDef::new("threadPrefixes", "Thread prefixes").depends_on(&["forums", "users"]),
        StepDef::new("threads", "Threads")
            .depends_on(&["forums", "threadPrefixes"])
            .forces(&["posts"]),
        StepDef::new("watchedThreads", "Watched threads").depends_on(&["threads", "users"]),
        StepDef::new("posts", "Posts").depends_on(&["threads"]),
        StepDef::new("polls", "Thread polls").depends_on(&["posts"]),
        StepDef::new("attachments", "Attachments").depends_on(&["posts", "conversations"]),
        StepDef::new("likes", "Likes")
            .depends_on(&["posts"])
            .provides(&[Derived::DislikeReaction])
            .reads(&[Derived::DislikeReaction]),
    ]
}

/// The full WoltLab catalog.
pub fn catalog() -> Result<StepCatalog, Error> {
    let mut entries = Vec::new();
    for def in step_defs() {
        let step: Box<dyn crate::job::Step> = match def.name.as_str() {
            "userGroups" => Box::new(UserGroups),
            "userFields" => Box::new(UserFields),
            "users" => Box::new(Paged(Users)),
            "followedUsers" => Box::new(Paged(FollowedUsers)),
            "ignoredUsers" => Box::new(Paged(IgnoredUsers)),
            "conversations" => Box::new(Paged(Conversations)),
            "profilePosts" => Box::new(Paged(ProfilePosts)),
            "forums" => Box::new(Forums),
            "nodePermissions" => Box::new(NodePermissions),
            "watchedForums" => Box::new(Paged(WatchedForums)),
            "threadPrefixes" => Box::new(ThreadPrefixes),
            "threads" => Box::new(Paged(Threads)),
            "watchedThreads" => Box::new(Paged(WatchedThreads)),
            "posts" => Box::new(Paged(Posts)),
            "polls" => Box::new(Paged(Polls)),
            "attachments" => Box::new(Paged(Attachments)),
            "likes" => Box::new(Paged(Likes)),
            other => return Err(Error::UnknownStep(other.to_string())),
        };
        entries.push((def, step));
    }
    StepCatalog::new(entries)
}

/// Turn a `json!` object into record fields.
pub(crate) fn record(value: Value) -> Fields {
    match value {
        Value::Object(fields) => fields,
        _ => Map::new(),
    }
}

/// Target id of a source record, or `default` when it was not imported.
pub(crate) fn target_or(
    ctx: &JobContext,
    entity_type: &str,
    source_id: u64,
    default: u64,
) -> Result<u64, Error> {
    ctx.ids().resolve_or_default(entity_type, source_id, default)
}

/// Target id of a source record, `None` when missing or excluded.
pub(crate) fn target(ctx: &JobContext, entity_type: &str, source_id: u64) -> Result<Option<u64>, Error> {
    if source_id == 0 {
        return Ok(None);
    }
    ctx.ids().target(entity_type, source_id)
}

/// Load the translations of every id in `column` of `rows` into the cache.
pub(crate) fn warm(
    ctx: &JobContext,
    entity_type: &str,
    rows: &[SourceRow],
    columns: &[&str],
) -> Result<(), Error> {
    let ids = rows
        .iter()
        .flat_map(|row| columns.iter().map(move |column| row.u64(column)))
        .filter(|id| *id > 0)
        .map(SourceKey::from);
    ctx.ids().get_many(entity_type, ids)?;
    Ok(())
}

/// A suite table restricted to one object type.
///
/// `None` when the source has no such object type, i.e. nothing to import.
pub(crate) fn object_table(
    ctx: &JobContext,
    name: &str,
    key: &str,
    object_type: &str,
) -> Result<Option<SourceTable>, Error> {
    Ok(ctx
        .object_type_id(object_type)?
        .map(|id| SourceTable::new(ctx.config().wcf_table(name), key).filtered("objectTypeID", id)))
}

/// Highest ordinal of an optional table.
pub(crate) fn end_of(ctx: &JobContext, table: Option<SourceTable>) -> Result<u64, Error> {
    match table {
        Some(table) => ctx.source().max_key(&table),
        None => Ok(0),
    }
}

/// One page of an optional table.
pub(crate) fn page_of(
    ctx: &JobContext,
    table: Option<SourceTable>,
    start_after: u64,
    end: u64,
    limit: usize,
) -> Result<Vec<SourceRow>, Error> {
    match table {
        Some(table) => ctx.source().fetch_page(&table, start_after, end, limit),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_valid() {
        let catalog = catalog().unwrap();
        assert_eq!(catalog.graph().defs().len(), 17);
    }

    #[test]
    fn test_threads_pull_in_posts_and_dependencies() {
        let catalog = catalog().unwrap();
        let plan = catalog
            .graph()
            .plan(&["threads"], &Default::default())
            .unwrap();
        assert_eq!(
            plan,
            vec!["userGroups", "userFields", "users", "forums", "threadPrefixes", "threads", "posts"]
        );
    }

    #[test]
    fn test_attachments_wait_for_both_containers() {
        let catalog = catalog().unwrap();
        let plan = catalog
            .graph()
            .plan(&["attachments"], &Default::default())
            .unwrap();
        let position = |name: &str| plan.iter().position(|step| step == name).unwrap();
        assert!(position("posts") < position("attachments"));
        assert!(position("conversations") < position("attachments"));
    }

    #[test]
    fn test_users_follow_groups_and_fields() {
        let catalog = catalog().unwrap();
        let done = ["userGroups".to_string(), "userFields".to_string()]
            .into_iter()
            .collect();
        let plan = catalog.graph().plan(&["users"], &done).unwrap();
        assert_eq!(plan, vec!["users"]);
    }
}

//! Private conversations and profile comments.

use serde_json::{json, Value};

use super::{end_of, object_table, object_type, page_of, record, target, target_or, warm, UNKNOWN_USERNAME};
use crate::error::Error;
use crate::idmap::SourceKey;
use crate::job::{JobContext, PagedStep, RecordOutcome};
use crate::source::{SourceRow, SourceTable};
use crate::target::EntityKind;

fn username(row: &SourceRow) -> &str {
    match row.str("username") {
        "" => UNKNOWN_USERNAME,
        name => name,
    }
}

/// Conversations with their recipients and messages.
pub struct Conversations;

impl Conversations {
    fn table(ctx: &JobContext) -> SourceTable {
        SourceTable::new(ctx.config().wcf_table("conversation"), "conversationID")
    }

    fn children(
        ctx: &JobContext,
        table: &str,
        key: &str,
        conversation_id: u64,
    ) -> Result<Vec<SourceRow>, Error> {
        ctx.source().fetch_by(
            &SourceTable::new(ctx.config().wcf_table(table), key),
            "conversationID",
            &[Value::from(conversation_id)],
        )
    }
}

impl PagedStep for Conversations {
    fn end(&self, ctx: &JobContext) -> Result<u64, Error> {
        ctx.source().max_key(&Self::table(ctx))
    }

    fn fetch_page(
        &self,
        ctx: &JobContext,
        start_after: u64,
        end: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, Error> {
        ctx.source()
            .fetch_page(&Self::table(ctx), start_after, end, limit)
    }

    fn prepare_page(&self, rows: &[SourceRow], ctx: &mut JobContext) -> Result<(), Error> {
        warm(ctx, "user", rows, &["userID"])
    }

    fn import_row(&self, row: &SourceRow, ctx: &mut JobContext) -> Result<RecordOutcome, Error> {
        let participants = Self::children(ctx, "conversation_to_user", "participantID", row.key)?;
        let messages = Self::children(ctx, "conversation_message", "messageID", row.key)?;
        warm(ctx, "user", &participants, &["participantID"])?;
        warm(ctx, "user", &messages, &["userID"])?;

        let mut recipients = Vec::new();
        for participant in &participants {
            if let Some(user_id) = target(ctx, "user", participant.u64("participantID"))? {
                if !recipients.contains(&user_id) {
                    recipients.push(user_id);
                }
            }
        }

        let mut conversation = ctx.new_entity(EntityKind::Conversation)?;
        conversation.bulk_set(record(json!({
            "title": row.str("subject"),
            "user_id": target_or(ctx, "user", row.u64("userID"), 0)?,
            "username": username(row),
            "start_date": row.i64("time"),
            "conversation_open": !row.bool("isClosed"),
            "recipients": recipients,
        })));

        for message in &messages {
            let mut child = ctx.new_entity(EntityKind::ConversationMessage)?;
            child.bulk_set(record(json!({
                "message_date": message.i64("time"),
                "user_id": target_or(ctx, "user", message.u64("userID"), 0)?,
                "username": username(message),
                "message": ctx.rewrite(message.str("message"), true),
                "ip": message.str("ipAddress"),
            })));
            conversation.add_child(SourceKey::from(message.key), child);
        }

        Ok(RecordOutcome::saved(conversation.save(SourceKey::from(row.key))?))
    }
}

/// Profile comments and their responses.
pub struct ProfilePosts;

impl ProfilePosts {
    fn table(ctx: &JobContext) -> Result<Option<SourceTable>, Error> {
        object_table(ctx, "comment", "commentID", object_type::PROFILE_COMMENT)
    }
}

impl PagedStep for ProfilePosts {
    fn end(&self, ctx: &JobContext) -> Result<u64, Error> {
        end_of(ctx, Self::table(ctx)?)
    }

    fn fetch_page(
        &self,
        ctx: &JobContext,
        start_after: u64,
        end: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, Error> {
        page_of(ctx, Self::table(ctx)?, start_after, end, limit)
    }

    fn prepare_page(&self, rows: &[SourceRow], ctx: &mut JobContext) -> Result<(), Error> {
        warm(ctx, "user", rows, &["userID", "objectID"])
    }

    fn import_row(&self, row: &SourceRow, ctx: &mut JobContext) -> Result<RecordOutcome, Error> {
        let Some(profile_user_id) = target(ctx, "user", row.u64("objectID"))? else {
            return Ok(RecordOutcome::missing("user", row.u64("objectID")));
        };

        let responses = if row.u64("responses") > 0 {
            ctx.source().fetch_by(
                &SourceTable::new(ctx.config().wcf_table("comment_response"), "responseID"),
                "commentID",
                &[Value::from(row.key)],
            )?
        } else {
            Vec::new()
        };
        warm(ctx, "user", &responses, &["userID"])?;

        let mut post = ctx.new_entity(EntityKind::ProfilePost)?;
        post.bulk_set(record(json!({
            "profile_user_id": profile_user_id,
            "user_id": target_or(ctx, "user", row.u64("userID"), 0)?,
            "username": row.str("username"),
            "post_date": row.i64("time"),
            "comment_count": responses.len(),
            "message": ctx.rewrite(row.str("message"), false),
            "message_state": if row.bool("isDisabled") { "moderated" } else { "visible" },
        })));

        for response in &responses {
            let mut comment = ctx.new_entity(EntityKind::ProfilePostComment)?;
            comment.bulk_set(record(json!({
                "user_id": target_or(ctx, "user", response.u64("userID"), 0)?,
                "username": response.str("username"),
                "comment_date": response.i64("time"),
                "message": ctx.rewrite(response.str("message"), false),
            })));
            post.add_child(SourceKey::from(response.key), comment);
        }

        Ok(RecordOutcome::saved(post.save(SourceKey::from(row.key))?))
    }
}

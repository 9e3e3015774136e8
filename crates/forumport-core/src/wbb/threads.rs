//! Threads, posts, polls and thread subscriptions.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::trace;

use super::{end_of, object_table, object_type, page_of, record, target, target_or, warm};
use crate::error::Error;
use crate::idmap::{Lookup, SourceKey};
use crate::job::{JobContext, PagedStep, RecordOutcome};
use crate::rewrite::decode_entities;
use crate::source::{SourceRow, SourceTable};
use crate::target::EntityKind;

/// Moderation state shared by threads and posts.
fn content_state(row: &SourceRow) -> &'static str {
    if row.bool("isDeleted") {
        "deleted"
    } else if row.bool("isDisabled") {
        "moderated"
    } else {
        "visible"
    }
}

pub struct Threads;

impl Threads {
    fn table(ctx: &JobContext) -> SourceTable {
        SourceTable::new(ctx.config().wbb_table("thread"), "threadID")
    }

    /// Target prefix of a labelled thread, `0` when it has none.
    fn prefix(ctx: &JobContext, thread: &SourceRow) -> Result<u64, Error> {
        if !thread.bool("hasLabels") {
            return Ok(0);
        }
        let Some(table) = object_table(ctx, "label_object", "labelID", object_type::THREAD)? else {
            return Ok(0);
        };
        let label = ctx
            .source()
            .fetch_by(&table, "objectID", &[Value::from(thread.key)])?
            .into_iter()
            .next();
        match label {
            Some(label) => target_or(ctx, "thread_prefix", label.key, 0),
            None => Ok(0),
        }
    }
}

impl PagedStep for Threads {
    fn page_limit(&self) -> usize {
        1000
    }

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
        warm(ctx, "user", rows, &["userID"])?;
        warm(ctx, "node", rows, &["boardID"])
    }

    fn import_row(&self, row: &SourceRow, ctx: &mut JobContext) -> Result<RecordOutcome, Error> {
        let Some(node_id) = target(ctx, "node", row.u64("boardID"))? else {
            return Ok(RecordOutcome::missing("node", row.u64("boardID")));
        };

        let mut thread = ctx.new_entity(EntityKind::Thread)?;
        thread.bulk_set(record(json!({
            "node_id": node_id,
            "title": decode_entities(row.str("topic")),
            "user_id": target_or(ctx, "user", row.u64("userID"), 0)?,
            "username": decode_entities(row.str("username")),
            "post_date": row.i64("time"),
            "reply_count": row.i64("replies"),
            "view_count": row.i64("views"),
            "sticky": row.bool("isSticky"),
            "discussion_open": !row.bool("isClosed"),
            "discussion_state": content_state(row),
            "last_post_date": row.i64("lastPostTime"),
            "last_post_username": decode_entities(row.str("lastPoster")),
            "prefix_id": Self::prefix(ctx, row)?,
        })));
        Ok(RecordOutcome::saved(thread.save(SourceKey::from(row.key))?))
    }
}

/// Thread subscriptions.
pub struct WatchedThreads;

impl WatchedThreads {
    fn table(ctx: &JobContext) -> Result<Option<SourceTable>, Error> {
        object_table(ctx, "user_object_watch", "watchID", object_type::THREAD)
    }
}

impl PagedStep for WatchedThreads {
    fn page_limit(&self) -> usize {
        1000
    }

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
        warm(ctx, "user", rows, &["userID"])?;
        warm(ctx, "thread", rows, &["objectID"])
    }

    fn import_row(&self, row: &SourceRow, ctx: &mut JobContext) -> Result<RecordOutcome, Error> {
        let Some(thread_id) = target(ctx, "thread", row.u64("objectID"))? else {
            return Ok(RecordOutcome::missing("thread", row.u64("objectID")));
        };
        let Some(user_id) = target(ctx, "user", row.u64("userID"))? else {
            return Ok(RecordOutcome::missing("user", row.u64("userID")));
        };
        let mut watch = ctx.new_entity(EntityKind::ThreadWatch)?;
        watch.bulk_set(record(json!({
            "thread_id": thread_id,
            "user_id": user_id,
            "email_subscribe": true,
        })));
        Ok(RecordOutcome::saved(watch.save(SourceKey::from(row.key))?))
    }
}

/// Posts. A post whose thread was not imported is skipped.
pub struct Posts;

impl Posts {
    fn table(ctx: &JobContext) -> SourceTable {
        SourceTable::new(ctx.config().wbb_table("post"), "postID")
    }
}

impl PagedStep for Posts {
    fn page_limit(&self) -> usize {
        1000
    }

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
        warm(ctx, "user", rows, &["userID"])?;
        warm(ctx, "thread", rows, &["threadID"])
    }

    fn import_row(&self, row: &SourceRow, ctx: &mut JobContext) -> Result<RecordOutcome, Error> {
        if let Lookup::Mapped(existing) = ctx.ids().lookup("post", row.key)? {
            trace!(source_id = row.key, existing, "post already imported");
            return Ok(RecordOutcome::Imported);
        }
        let Some(thread_id) = target(ctx, "thread", row.u64("threadID"))? else {
            return Ok(RecordOutcome::missing("thread", row.u64("threadID")));
        };

        let state = content_state(row);
        let position = ctx.next_post_position(thread_id, state == "visible")?;

        let mut post = ctx.new_entity(EntityKind::Post)?;
        post.bulk_set(record(json!({
            "thread_id": thread_id,
            "user_id": target_or(ctx, "user", row.u64("userID"), 0)?,
            "username": row.str("username"),
            "post_date": row.i64("time"),
            "last_edit_date": row.i64("lastEditTime"),
            "message_state": state,
            "position": position,
            "message": ctx.rewrite(row.str("message"), true),
            "ip": row.str("ipAddress"),
        })));
        Ok(RecordOutcome::saved(post.save(SourceKey::from(row.key))?))
    }
}

/// Polls attached to posts, imported onto the post's thread.
pub struct Polls;

impl Polls {
    fn table(ctx: &JobContext) -> Result<Option<SourceTable>, Error> {
        object_table(ctx, "poll", "pollID", object_type::POST)
    }

    /// Source thread holding the post a poll is attached to.
    fn source_thread(ctx: &JobContext, post_id: u64) -> Result<Option<u64>, Error> {
        let table = SourceTable::new(ctx.config().wbb_table("post"), "postID");
        Ok(ctx
            .source()
            .fetch_by(&table, "postID", &[Value::from(post_id)])?
            .first()
            .map(|post| post.u64("threadID")))
    }

    /// Voters per option, translated and deduplicated.
    fn voters(ctx: &JobContext, poll_id: u64) -> Result<BTreeMap<u64, Vec<u64>>, Error> {
        let table = SourceTable::new(ctx.config().wcf_table("poll_option_vote"), "optionID");
        let votes = ctx
            .source()
            .fetch_by(&table, "pollID", &[Value::from(poll_id)])?;
        warm(ctx, "user", &votes, &["userID"])?;

        let mut voters: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for vote in &votes {
            if let Some(user_id) = target(ctx, "user", vote.u64("userID"))? {
                let entry = voters.entry(vote.key).or_default();
                if !entry.contains(&user_id) {
                    entry.push(user_id);
                }
            }
        }
        Ok(voters)
    }
}

impl PagedStep for Polls {
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

    fn import_row(&self, row: &SourceRow, ctx: &mut JobContext) -> Result<RecordOutcome, Error> {
        let Some(source_thread) = Self::source_thread(ctx, row.u64("objectID"))? else {
            return Ok(RecordOutcome::missing("post", row.u64("objectID")));
        };
        let Some(thread_id) = target(ctx, "thread", source_thread)? else {
            return Ok(RecordOutcome::missing("thread", source_thread));
        };

        let options = ctx.source().fetch_by(
            &SourceTable::new(ctx.config().wcf_table("poll_option"), "optionID"),
            "pollID",
            &[Value::from(row.key)],
        )?;
        if options.is_empty() {
            return Ok(RecordOutcome::malformed("poll has no options"));
        }
        let mut voters = Self::voters(ctx, row.key)?;

        let mut poll = ctx.new_entity(EntityKind::Poll)?;
        poll.bulk_set(record(json!({
            "content_type": "thread",
            "content_id": thread_id,
            "question": ctx.rewrite(row.str("question"), false),
            "max_votes": row.i64("maxVotes"),
            "close_date": row.i64("endTime"),
            "voter_count": row.i64("votes"),
            "public_votes": row.bool("isPublic"),
            "change_vote": row.bool("isChangeable"),
            "view_results_unvoted": !row.bool("resultsRequireVote"),
        })));

        for option in &options {
            let voters = voters.remove(&option.key).unwrap_or_default();
            let mut response = ctx.new_entity(EntityKind::PollResponse)?;
            response.bulk_set(record(json!({
                "response": ctx.rewrite(option.str("optionValue"), false),
                "response_vote_count": voters.len(),
                "voters": voters,
            })));
            poll.add_child(SourceKey::from(option.key), response);
        }

        Ok(RecordOutcome::saved(poll.save(SourceKey::from(row.key))?))
    }
}

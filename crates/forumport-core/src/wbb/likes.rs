//! Post likes and dislikes as reactions.

use serde_json::{json, Value};
use tracing::info;

use super::{end_of, object_table, object_type, page_of, record, target, warm};
use crate::error::Error;
use crate::idmap::SourceKey;
use crate::job::{JobContext, PagedStep, RecordOutcome};
use crate::source::{SourceRow, SourceTable};
use crate::target::EntityKind;

/// Reaction every positive like maps to.
const LIKE_REACTION: u64 = 1;

/// Source value of a dislike.
const DISLIKE_VALUE: i64 = -1;

/// Post likes. Dislikes get a dedicated reaction, created on first use.
pub struct Likes;

impl Likes {
    fn table(ctx: &JobContext) -> Result<Option<SourceTable>, Error> {
        object_table(ctx, "like", "likeID", object_type::LIKEABLE_POST)
    }

    fn create_dislike_reaction(ctx: &JobContext) -> Result<Option<u64>, Error> {
        let mut reaction = ctx.new_entity(EntityKind::Reaction)?;
        reaction.bulk_set(record(json!({
            "title": "Dislike",
            "text_color": "#FF4D4D",
            "image_url": "styles/default/xenforo/reactions/emojis.png",
            "sprite_mode": true,
            "sprite_params": { "w": 32, "h": 32, "x": 0, "y": -192, "bs": "100%" },
            "reaction_score": -1,
            "display_order": 700,
            "active": true,
        })));
        reaction.save(SourceKey::from("dislike"))
    }
}

impl PagedStep for Likes {
    fn setup(&self, ctx: &mut JobContext) -> Result<(), Error> {
        let has_dislikes = match Self::table(ctx)? {
            Some(table) => !ctx
                .source()
                .fetch_by(&table, "likeValue", &[Value::from(DISLIKE_VALUE)])?
                .is_empty(),
            None => false,
        };
        let reaction = if has_dislikes {
            let id = Self::create_dislike_reaction(ctx)?;
            info!(reaction_id = ?id, "created dislike reaction");
            id
        } else {
            None
        };
        ctx.set_dislike_reaction(reaction);
        Ok(())
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
        warm(ctx, "user", rows, &["userID", "objectUserID"])?;
        warm(ctx, "post", rows, &["objectID"])
    }

    fn import_row(&self, row: &SourceRow, ctx: &mut JobContext) -> Result<RecordOutcome, Error> {
        let Some(post_id) = target(ctx, "post", row.u64("objectID"))? else {
            return Ok(RecordOutcome::missing("post", row.u64("objectID")));
        };
        let Some(user_id) = target(ctx, "user", row.u64("userID"))? else {
            return Ok(RecordOutcome::missing("user", row.u64("userID")));
        };

        let reaction_id = if row.i64("likeValue") > 0 {
            LIKE_REACTION
        } else {
            ctx.dislike_reaction()?.unwrap_or(LIKE_REACTION)
        };

        let mut like = ctx.new_entity(EntityKind::ReactionContent)?;
        like.bulk_set(record(json!({
            "reaction_id": reaction_id,
            "content_type": "post",
            "content_id": post_id,
            "reaction_user_id": user_id,
            "reaction_date": row.i64("time"),
            "content_user_id": target(ctx, "user", row.u64("objectUserID"))?.unwrap_or(0),
        })));
        Ok(RecordOutcome::saved(like.save(SourceKey::from(row.key))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{memory_context_with_target, BatchRunner, StepState, TimeBudget};
    use crate::source::MemorySource;
    use std::sync::Arc;

    fn source(likes: Vec<Value>) -> Arc<MemorySource> {
        Arc::new(
            MemorySource::new()
                .with_rows(
                    "wcf1_object_type",
                    [json!({ "objectTypeID": 12, "objectType": object_type::LIKEABLE_POST })],
                )
                .with_rows("wcf1_like", likes),
        )
    }

    fn run(ctx: &mut JobContext) -> StepState {
        Likes.setup(ctx).unwrap();
        let mut state = StepState::new("likes");
        state.start(Likes.end(ctx).unwrap());
        BatchRunner::default()
            .run(&Likes, &mut state, &TimeBudget::unlimited(), ctx)
            .unwrap();
        state
    }

    #[test]
    fn test_likes_and_dislikes() {
        let (mut ctx, target) = memory_context_with_target(source(vec![
            json!({ "likeID": 1, "objectTypeID": 12, "objectID": 100, "objectUserID": 2, "userID": 1, "likeValue": 1, "time": 10 }),
            json!({ "likeID": 2, "objectTypeID": 12, "objectID": 100, "objectUserID": 2, "userID": 3, "likeValue": -1, "time": 20 }),
            json!({ "likeID": 3, "objectTypeID": 12, "objectID": 404, "userID": 1, "likeValue": 1 }),
            json!({ "likeID": 4, "objectTypeID": 12, "objectID": 100, "userID": 8, "likeValue": 1 }),
            json!({ "likeID": 5, "objectTypeID": 7, "objectID": 100, "userID": 1, "likeValue": 1 }),
        ]));
        ctx.ids().put("post", 100u64, 50).unwrap();
        for (source, target) in [(1u64, 11), (2, 12), (3, 13)] {
            ctx.ids().put("user", source, target).unwrap();
        }

        let state = run(&mut ctx);
        assert_eq!(state.end, 4);
        assert_eq!(state.imported, 2);
        assert_eq!(state.skipped, 2);

        let dislike = ctx.dislike_reaction().unwrap().unwrap();
        assert_ne!(dislike, LIKE_REACTION);
        assert_eq!(ctx.ids().target("reaction", "dislike").unwrap(), Some(dislike));

        let reactions = target.records(EntityKind::ReactionContent);
        assert_eq!(reactions.len(), 2);
        assert_eq!(reactions[0].1["reaction_id"], LIKE_REACTION);
        assert_eq!(reactions[0].1["content_id"], 50);
        assert_eq!(reactions[0].1["content_user_id"], 12);
        assert_eq!(reactions[1].1["reaction_id"], dislike);
        assert_eq!(reactions[1].1["reaction_user_id"], 13);
    }

    #[test]
    fn test_no_dislike_reaction_without_dislikes() {
        let (mut ctx, target) = memory_context_with_target(source(vec![
            json!({ "likeID": 1, "objectTypeID": 12, "objectID": 100, "userID": 1, "likeValue": 1 }),
        ]));
        let state = run(&mut ctx);
        assert_eq!(state.skipped, 1);
        assert_eq!(ctx.dislike_reaction().unwrap(), None);
        assert!(target.records(EntityKind::Reaction).is_empty());
    }

    #[test]
    fn test_setup_is_reentrant() {
        let (mut ctx, target) = memory_context_with_target(source(vec![
            json!({ "likeID": 1, "objectTypeID": 12, "objectID": 100, "userID": 1, "likeValue": -1 }),
        ]));
        Likes.setup(&mut ctx).unwrap();
        let first = ctx.dislike_reaction().unwrap();
        Likes.setup(&mut ctx).unwrap();
        assert_eq!(ctx.dislike_reaction().unwrap(), first);
        assert_eq!(target.records(EntityKind::Reaction).len(), 1);
    }
}

//! Post and conversation attachments.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::warn;

use super::{object_type, record, target, target_or, warm};
use crate::error::Error;
use crate::idmap::{Lookup, SourceKey};
use crate::job::{JobContext, PagedStep, RecordOutcome, SkipReason};
use crate::source::{SourceRow, SourceTable};
use crate::target::{EntityKind, Fields};

/// Containers attachments can belong to.
const CONTAINERS: [(&str, EntityKind); 2] = [
    (object_type::POST, EntityKind::Post),
    (object_type::CONVERSATION_MESSAGE, EntityKind::ConversationMessage),
];

/// Stored file of an attachment: `attachments/<hh>/<id>-<hash>`, or the same
/// with a `.bin` suffix as written by newer suite versions.
pub fn attachment_file(uploads: &Path, attachment_id: u64, hash: &str) -> Option<PathBuf> {
    let bucket = hash.get(..2)?;
    let plain = uploads
        .join("attachments")
        .join(bucket)
        .join(format!("{attachment_id}-{hash}"));
    if plain.is_file() {
        return Some(plain);
    }
    let bin = plain.with_file_name(format!("{attachment_id}-{hash}.bin"));
    bin.is_file().then_some(bin)
}

/// Imports attachments of posts and conversation messages, then points the
/// container's pending attachment references at the new attachment.
///
/// The source table is read unfiltered; rows of other object types are
/// skipped as unsupported.
pub struct Attachments;

impl Attachments {
    fn table(ctx: &JobContext) -> SourceTable {
        SourceTable::new(ctx.config().wcf_table("attachment"), "attachmentID")
    }

    /// Container kind of a source object type id.
    fn container(ctx: &JobContext, object_type_id: u64) -> Result<Option<EntityKind>, Error> {
        for (name, kind) in CONTAINERS {
            if ctx.object_type_id(name)? == Some(object_type_id) {
                return Ok(Some(kind));
            }
        }
        Ok(None)
    }

    /// Rewrite the container's message so it references the imported attachment.
    fn fix_container(
        ctx: &JobContext,
        kind: EntityKind,
        container_id: u64,
        old_id: u64,
        new_id: u64,
    ) -> Result<(), Error> {
        let Some(fields) = ctx.target().get(kind, container_id)? else {
            return Ok(());
        };
        let Some(message) = fields.get("message").and_then(Value::as_str) else {
            return Ok(());
        };
        let fixed = ctx
            .rewriter()
            .rewrite_embedded_attachments(message, old_id, new_id);
        if fixed != message {
            let mut update = Fields::new();
            update.insert("message".into(), Value::from(fixed));
            ctx.target().update(kind, container_id, &update)?;
        }
        Ok(())
    }
}

impl PagedStep for Attachments {
    fn page_limit(&self) -> usize {
        1000
    }

    fn end(&self, ctx: &JobContext) -> Result<u64, Error> {
        let mut end = 0;
        for (name, _) in CONTAINERS {
            if let Some(id) = ctx.object_type_id(name)? {
                end = end.max(ctx.source().max_key(&Self::table(ctx).filtered("objectTypeID", id))?);
            }
        }
        Ok(end)
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
        let Some(kind) = Self::container(ctx, row.u64("objectTypeID"))? else {
            return Ok(RecordOutcome::Skipped(SkipReason::Unsupported(format!(
                "attachment object type {}",
                row.u64("objectTypeID")
            ))));
        };
        let content_type = kind.content_type();
        let Some(content_id) = target(ctx, content_type, row.u64("objectID"))? else {
            return Ok(RecordOutcome::missing(content_type, row.u64("objectID")));
        };
        // Saved by an earlier invocation that may have stopped before the fix-up.
        if let Lookup::Mapped(new_id) = ctx.ids().lookup("attachment", row.key)? {
            Self::fix_container(ctx, kind, content_id, row.key, new_id)?;
            return Ok(RecordOutcome::Imported);
        }
        let Some(uploads) = ctx.config().base.uploads_path.clone() else {
            return Ok(RecordOutcome::malformed("no uploads path configured"));
        };
        let Some(file) = attachment_file(&uploads, row.key, row.str("fileHash")) else {
            warn!(attachment_id = row.key, hash = row.str("fileHash"), "attachment file not found");
            return Ok(RecordOutcome::malformed("attachment file not found"));
        };

        let mut attachment = ctx.new_entity(EntityKind::Attachment)?;
        attachment.bulk_set(record(json!({
            "content_type": content_type,
            "content_id": content_id,
            "attach_date": row.i64("uploadTime"),
            "view_count": row.i64("downloads"),
            "unassociated": false,
            "upload_date": row.i64("uploadTime"),
            "user_id": target_or(ctx, "user", row.u64("userID"), 0)?,
            "filename": row.str("filename"),
            "file_path": file.to_string_lossy(),
        })));
        let Some(new_id) = attachment.save(SourceKey::from(row.key))? else {
            return Ok(RecordOutcome::saved(None));
        };
        Self::fix_container(ctx, kind, content_id, row.key, new_id)?;
        Ok(RecordOutcome::Imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{memory_context_with_config, BatchRunner, JobConfig, StepState, TimeBudget};
    use crate::source::MemorySource;
    use crate::target::{MemoryTarget, TargetStore};
    use std::sync::Arc;

    const HASH: &str = "ab34cd";

    fn uploads() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let bucket = dir.path().join("attachments").join("ab");
        std::fs::create_dir_all(&bucket).unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        std::fs::write(bucket.join(format!("1-{HASH}")), b"one").unwrap();
        std::fs::write(bucket.join(format!("2-{HASH}.bin")), b"two").unwrap();
        dir
    }

    fn source() -> MemorySource {
        MemorySource::new()
            .with_rows(
                "wcf1_object_type",
                [
                    json!({ "objectTypeID": 3, "objectType": object_type::POST }),
                    json!({ "objectTypeID": 4, "objectType": object_type::CONVERSATION_MESSAGE }),
                ],
            )
            .with_rows(
                "wcf1_attachment",
                [
                    json!({ "attachmentID": 1, "objectTypeID": 3, "objectID": 100, "fileHash": HASH, "filename": "a.png", "userID": 5 }),
                    json!({ "attachmentID": 2, "objectTypeID": 4, "objectID": 30, "fileHash": HASH, "filename": "b.zip" }),
                    json!({ "attachmentID": 3, "objectTypeID": 3, "objectID": 100, "fileHash": HASH }),
                    json!({ "attachmentID": 4, "objectTypeID": 9, "objectID": 1, "fileHash": HASH }),
                    json!({ "attachmentID": 5, "objectTypeID": 3, "objectID": 404, "fileHash": HASH }),
                ],
            )
    }

    fn context(dir: &tempfile::TempDir) -> (JobContext, Arc<MemoryTarget>) {
        let config = JobConfig::new("test").with_uploads_path(dir.path());
        memory_context_with_config(Arc::new(source()), config)
    }

    fn create(target: &MemoryTarget, kind: EntityKind, fields: Value) -> u64 {
        target.create(kind, &record(fields)).unwrap().unwrap()
    }

    #[test]
    fn test_attachments_fix_up_their_container() {
        let dir = uploads();
        let (mut ctx, target) = context(&dir);
        let post = create(
            &target,
            EntityKind::Post,
            json!({ "thread_id": 1, "message": "see [attach=1][/attach] and [attach=3][/attach]" }),
        );
        let message = create(&target, EntityKind::ConversationMessage, json!({ "message": "[attach=2][/attach]" }));
        ctx.ids().put("post", 100u64, post).unwrap();
        ctx.ids().put("conversation_message", 30u64, message).unwrap();

        let mut state = StepState::new("attachments");
        state.start(Attachments.end(&ctx).unwrap());
        assert_eq!(state.end, 5);
        BatchRunner::default()
            .run(&Attachments, &mut state, &TimeBudget::unlimited(), &mut ctx)
            .unwrap();
        // 3 has no file, 4 is another object type, 5 has no container
        assert_eq!(state.imported, 2);
        assert_eq!(state.skipped, 3);

        let first = ctx.ids().target("attachment", 1u64).unwrap().unwrap();
        let second = ctx.ids().target("attachment", 2u64).unwrap().unwrap();
        let post = target.get(EntityKind::Post, post).unwrap().unwrap();
        assert_eq!(
            post["message"],
            format!("see [ATTACH=full]{first}[/ATTACH] and [attach=3][/attach]")
        );
        let message = target.get(EntityKind::ConversationMessage, message).unwrap().unwrap();
        assert_eq!(message["message"], format!("[ATTACH=full]{second}[/ATTACH]"));

        let stored = target.get(EntityKind::Attachment, second).unwrap().unwrap();
        assert!(stored["file_path"].as_str().unwrap().ends_with(".bin"));
        assert_eq!(stored["content_type"], "conversation_message");
    }

    fn run(ctx: &mut JobContext) -> StepState {
        let mut state = StepState::new("attachments");
        state.start(Attachments.end(ctx).unwrap());
        BatchRunner::default()
            .run(&Attachments, &mut state, &TimeBudget::unlimited(), ctx)
            .unwrap();
        state
    }

    fn post_with_two_attachments() -> MemorySource {
        MemorySource::new()
            .with_rows(
                "wcf1_object_type",
                [json!({ "objectTypeID": 3, "objectType": object_type::POST })],
            )
            .with_rows(
                "wcf1_attachment",
                [
                    json!({ "attachmentID": 1, "objectTypeID": 3, "objectID": 100, "fileHash": HASH }),
                    json!({ "attachmentID": 2, "objectTypeID": 3, "objectID": 100, "fileHash": HASH }),
                ],
            )
    }

    #[test]
    fn test_interleaved_ids_in_one_container() {
        let dir = uploads();
        let config = JobConfig::new("test").with_uploads_path(dir.path());
        let (mut ctx, target) = memory_context_with_config(Arc::new(post_with_two_attachments()), config);
        // an unrelated attachment already holds target id 1
        create(&target, EntityKind::Attachment, json!({ "content_type": "post", "content_id": 9 }));
        let post = create(
            &target,
            EntityKind::Post,
            json!({ "thread_id": 1, "message": "[attach=1][/attach] [attach=2][/attach]" }),
        );
        ctx.ids().put("post", 100u64, post).unwrap();

        let state = run(&mut ctx);
        assert_eq!(state.imported, 2);
        assert_eq!(ctx.ids().target("attachment", 1u64).unwrap(), Some(2));
        assert_eq!(ctx.ids().target("attachment", 2u64).unwrap(), Some(3));
        let post = target.get(EntityKind::Post, post).unwrap().unwrap();
        assert_eq!(post["message"], "[ATTACH=full]2[/ATTACH] [ATTACH=full]3[/ATTACH]");
    }

    #[test]
    fn test_resume_after_save_fixes_container() {
        let dir = uploads();
        let config = JobConfig::new("test").with_uploads_path(dir.path());
        let (mut ctx, target) = memory_context_with_config(Arc::new(post_with_two_attachments()), config);
        let post = create(
            &target,
            EntityKind::Post,
            json!({ "thread_id": 1, "message": "[attach=1][/attach]" }),
        );
        ctx.ids().put("post", 100u64, post).unwrap();
        // saved by an interrupted invocation, container not yet fixed
        let saved = create(&target, EntityKind::Attachment, json!({ "content_type": "post", "content_id": post }));
        ctx.ids().put("attachment", 1u64, saved).unwrap();

        let state = run(&mut ctx);
        assert_eq!(state.imported, 2);
        assert_eq!(target.records(EntityKind::Attachment).len(), 2);
        let message = target.get(EntityKind::Post, post).unwrap().unwrap();
        assert_eq!(message["message"], format!("[ATTACH=full]{saved}[/ATTACH]"));
    }

    #[test]
    fn test_attachment_file_lookup() {
        let dir = uploads();
        assert!(attachment_file(dir.path(), 1, HASH).is_some());
        assert!(attachment_file(dir.path(), 2, HASH).is_some());
        assert!(attachment_file(dir.path(), 3, HASH).is_none());
        assert!(attachment_file(dir.path(), 1, "a").is_none());
    }
}

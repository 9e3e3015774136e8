//! Node tree, node permissions, forum watches and thread prefixes.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{end_of, object_table, object_type, page_of, record, target, target_or, warm};
use crate::error::Error;
use crate::idmap::SourceKey;
use crate::job::{JobContext, PagedStep, RecordOutcome, Step, StepOutcome, StepState, TimeBudget};
use crate::source::{SourceRow, SourceTable};
use crate::target::EntityKind;

/// Target node type of a board type, with its type-specific fields.
fn node_type(board: &SourceRow) -> Option<(&'static str, Map<String, Value>)> {
    match board.u64("boardType") {
        0 => Some((
            "Forum",
            record(json!({
                "discussion_count": board.i64("threads"),
                "message_count": board.i64("posts"),
            })),
        )),
        1 => Some(("Category", Map::new())),
        2 => Some(("LinkForum", record(json!({ "link_url": board.str("externalURL") })))),
        _ => None,
    }
}

/// Boards keyed by parent id, each level ordered by position then id.
fn board_forest(boards: Vec<SourceRow>) -> BTreeMap<u64, Vec<SourceRow>> {
    let mut forest: BTreeMap<u64, Vec<SourceRow>> = BTreeMap::new();
    for board in boards {
        forest.entry(board.u64("parentID")).or_default().push(board);
    }
    for children in forest.values_mut() {
        children.sort_by_key(|board| (board.i64("position"), board.key));
    }
    forest
}

/// Imports the board hierarchy as target nodes.
///
/// The forest is walked breadth first from the root. A board is only reached
/// through a parent that was saved, so children of rejected boards, orphans
/// and boards caught in a parent cycle are never imported.
pub struct Forums;

impl Step for Forums {
    fn run(
        &self,
        state: &mut StepState,
        _budget: &TimeBudget,
        ctx: &mut JobContext,
    ) -> Result<StepOutcome, Error> {
        let table = SourceTable::new(ctx.config().wbb_table("board"), "boardID");
        let boards = ctx.source().fetch_all(&table)?;
        let total = boards.len() as u64;
        let forest = board_forest(boards);

        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([0u64]);
        let mut imported = 0u64;

        while let Some(parent) = queue.pop_front() {
            let Some(children) = forest.get(&parent) else {
                continue;
            };
            for board in children {
                if !visited.insert(board.key) {
                    warn!(board_id = board.key, parent, "board reached twice, skipping");
                    continue;
                }
                let Some((node_type, data)) = node_type(board) else {
                    debug!(board_id = board.key, board_type = board.u64("boardType"), "unknown board type");
                    continue;
                };

                let mut node = ctx.new_entity(EntityKind::Node)?;
                node.bulk_set(record(json!({
                    "title": board.str("title"),
                    "description": board.str("description"),
                    "display_order": board.i64("position"),
                    "parent_node_id": target_or(ctx, "node", parent, 0)?,
                    "node_type": node_type,
                    "type_data": data,
                })));
                if node.save(SourceKey::from(board.key))?.is_some() {
                    imported += 1;
                    queue.push_back(board.key);
                }
            }
        }

        if imported < total {
            warn!(
                skipped = total - imported,
                "boards not imported (unknown type, rejected, orphaned or cyclic)"
            );
        }
        state.imported += imported;
        state.skipped += total - imported;
        Ok(StepOutcome::Complete)
    }
}

/// Board ACL option names and the target permission they set.
const NODE_PERMISSIONS: [(&str, &str, &str); 14] = [
    ("canDeleteOwnPost", "forum", "deleteOwnPost"),
    ("canEditOwnPost", "forum", "editOwnPost"),
    ("canViewBoard", "forum", "viewContent"),
    ("canEnterBoard", "general", "viewNode"),
    ("canLikePost", "forum", "react"),
    ("canMarkAsDoneOwnThread", "forum", "markSolution"),
    ("canReadThread", "forum", "viewOthers"),
    ("canReplyThread", "forum", "postReply"),
    ("canSetTags", "forum", "tagAnyThread"),
    ("canStartThread", "forum", "postThread"),
    ("canUploadAttachment", "forum", "uploadAttachment"),
    ("canDownloadAttachment", "forum", "viewAttachment"),
    ("canViewAttachmentPreview", "forum", "viewAttachment"),
    ("canVotePoll", "forum", "votePoll"),
];

/// Per-node group permissions from the board ACL.
pub struct NodePermissions;

impl Step for NodePermissions {
    fn run(
        &self,
        state: &mut StepState,
        _budget: &TimeBudget,
        ctx: &mut JobContext,
    ) -> Result<StepOutcome, Error> {
        let options: BTreeMap<u64, String> = ctx
            .source()
            .fetch_all(&SourceTable::new(ctx.config().wcf_table("acl_option"), "optionID"))?
            .into_iter()
            .map(|row| (row.key, row.string("optionName")))
            .collect();
        let grants = ctx
            .source()
            .fetch_all(&SourceTable::new(ctx.config().wcf_table("acl_option_to_group"), "optionID"))?;

        // (source node, source group) -> permission group -> permission -> value
        let mut grouped: BTreeMap<(u64, u64), Map<String, Value>> = BTreeMap::new();
        for grant in &grants {
            let Some(name) = options.get(&grant.key) else {
                continue;
            };
            let Some((_, group, permission)) = NODE_PERMISSIONS.iter().find(|(option, _, _)| *option == name.as_str()) else {
                continue;
            };
            let value = if grant.bool("optionValue") { "content_allow" } else { "reset" };
            let sets = grouped
                .entry((grant.u64("objectID"), grant.u64("groupID")))
                .or_default();
            if let Value::Object(set) = sets
                .entry(group.to_string())
                .or_insert_with(|| Value::Object(Map::new()))
            {
                set.insert(permission.to_string(), json!(value));
            }
        }

        for ((source_node, source_group), permissions) in grouped {
            let node_id = target(ctx, "node", source_node)?;
            let group_id = target(ctx, "user_group", source_group)?;
            let (Some(node_id), Some(group_id)) = (node_id, group_id) else {
                state.skipped += 1;
                continue;
            };
            let mut entry = ctx.new_entity(EntityKind::NodePermission)?;
            entry.bulk_set(record(json!({
                "node_id": node_id,
                "user_group_id": group_id,
                "permissions": permissions,
            })));
            match entry.save(SourceKey::pair(source_node, source_group))? {
                Some(_) => state.imported += 1,
                None => state.skipped += 1,
            }
        }
        Ok(StepOutcome::Complete)
    }
}

/// Board subscriptions.
pub struct WatchedForums;

impl WatchedForums {
    fn table(ctx: &JobContext) -> Result<Option<SourceTable>, Error> {
        object_table(ctx, "user_object_watch", "watchID", object_type::BOARD)
    }
}

impl PagedStep for WatchedForums {
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
        warm(ctx, "node", rows, &["objectID"])
    }

    fn import_row(&self, row: &SourceRow, ctx: &mut JobContext) -> Result<RecordOutcome, Error> {
        let Some(node_id) = target(ctx, "node", row.u64("objectID"))? else {
            return Ok(RecordOutcome::missing("node", row.u64("objectID")));
        };
        let Some(user_id) = target(ctx, "user", row.u64("userID"))? else {
            return Ok(RecordOutcome::missing("user", row.u64("userID")));
        };
        let mut watch = ctx.new_entity(EntityKind::ForumWatch)?;
        watch.bulk_set(record(json!({
            "node_id": node_id,
            "user_id": user_id,
            "notify_on": "thread",
            "send_alert": true,
            "send_email": true,
        })));
        Ok(RecordOutcome::saved(watch.save(SourceKey::from(row.key))?))
    }
}

/// Label groups and labels attached to boards, imported as prefix groups
/// and prefixes.
pub struct ThreadPrefixes;

impl ThreadPrefixes {
    /// Source label group -> target nodes it is offered in.
    fn group_nodes(ctx: &JobContext) -> Result<Option<BTreeMap<u64, Vec<u64>>>, Error> {
        let Some(table) = object_table(ctx, "label_group_to_object", "groupID", object_type::BOARD)? else {
            return Ok(None);
        };
        let mut nodes: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for row in ctx.source().fetch_all(&table)? {
            let entry = nodes.entry(row.key).or_default();
            if let Some(node_id) = target(ctx, "node", row.u64("objectID"))? {
                if !entry.contains(&node_id) {
                    entry.push(node_id);
                }
            }
        }
        Ok(Some(nodes))
    }
}

impl Step for ThreadPrefixes {
    fn run(
        &self,
        state: &mut StepState,
        _budget: &TimeBudget,
        ctx: &mut JobContext,
    ) -> Result<StepOutcome, Error> {
        let groups = ctx
            .source()
            .fetch_all(&SourceTable::new(ctx.config().wcf_table("label_group"), "groupID"))?;
        for group in &groups {
            let mut prefix_group = ctx.new_entity(EntityKind::ThreadPrefixGroup)?;
            prefix_group.bulk_set(record(json!({
                "title": group.str("groupName"),
                "display_order": group.i64("showOrder"),
            })));
            prefix_group.save(SourceKey::from(group.key))?;
        }

        let Some(group_nodes) = Self::group_nodes(ctx)? else {
            debug!("no board label object type, prefixes skipped");
            return Ok(StepOutcome::Complete);
        };

        let labels = ctx
            .source()
            .fetch_all(&SourceTable::new(ctx.config().wcf_table("label"), "labelID"))?;
        for label in &labels {
            let group = label.u64("groupID");
            let Some(node_ids) = group_nodes.get(&group) else {
                continue;
            };
            let mut prefix = ctx.new_entity(EntityKind::ThreadPrefix)?;
            prefix.bulk_set(record(json!({
                "title": label.str("label"),
                "css_class": label.str("cssClassName"),
                "prefix_group_id": target_or(ctx, "thread_prefix_group", group, 0)?,
                "allowed_user_group_ids": [-1],
                "node_ids": node_ids,
            })));
            match prefix.save(SourceKey::from(label.key))? {
                Some(_) => state.imported += 1,
                None => state.skipped += 1,
            }
        }
        Ok(StepOutcome::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::Lookup;
    use crate::job::{memory_context_with_target, BatchRunner};
    use crate::source::MemorySource;
    use std::sync::Arc;

    fn run_once(step: &dyn Step, ctx: &mut JobContext) -> StepState {
        let mut state = StepState::new("test");
        step.run(&mut state, &TimeBudget::unlimited(), ctx).unwrap();
        state
    }

    fn boards() -> MemorySource {
        MemorySource::new()
            .with_rows(
                "wbb1_board",
                [
                    json!({ "boardID": 1, "parentID": 0, "boardType": 1, "title": "Main", "position": 1 }),
                    json!({ "boardID": 2, "parentID": 1, "boardType": 0, "title": "News", "position": 2, "threads": 4, "posts": 9 }),
                    json!({ "boardID": 3, "parentID": 1, "boardType": 2, "title": "Docs", "position": 1, "externalURL": "https://x.org" }),
                    json!({ "boardID": 4, "parentID": 2, "boardType": 0, "title": "" }),
                    json!({ "boardID": 5, "parentID": 4, "boardType": 0, "title": "Under rejected" }),
                    json!({ "boardID": 6, "parentID": 7, "boardType": 0, "title": "Cycle A" }),
                    json!({ "boardID": 7, "parentID": 6, "boardType": 0, "title": "Cycle B" }),
                ],
            )
            .with_rows(
                "wcf1_object_type",
                [
                    json!({ "objectTypeID": 1, "objectType": object_type::BOARD }),
                    json!({ "objectTypeID": 2, "objectType": object_type::THREAD }),
                ],
            )
    }

    #[test]
    fn test_forest_is_walked_from_root() {
        let (mut ctx, target) = memory_context_with_target(Arc::new(boards()));
        let state = run_once(&Forums, &mut ctx);
        assert_eq!(state.imported, 3);
        assert_eq!(state.skipped, 4);

        let nodes = target.records(EntityKind::Node);
        let titles: Vec<&str> = nodes.iter().map(|(_, f)| f["title"].as_str().unwrap()).collect();
        assert_eq!(titles, vec!["Main", "Docs", "News"]);

        let main = ctx.ids().target("node", 1u64).unwrap().unwrap();
        assert_eq!(nodes[1].1["parent_node_id"], main);
        assert_eq!(nodes[1].1["type_data"]["link_url"], "https://x.org");
        assert_eq!(nodes[2].1["type_data"]["discussion_count"], 4);

        // forum nodes double as legacy board links
        assert!(ctx.ids().target("forum", 2u64).unwrap().is_some());
        assert_eq!(ctx.ids().lookup("forum", 1u64).unwrap(), Lookup::Missing);
        assert_eq!(ctx.ids().lookup("node", 6u64).unwrap(), Lookup::Missing);

        // re-entry creates nothing new
        run_once(&Forums, &mut ctx);
        assert_eq!(target.records(EntityKind::Node).len(), 3);
    }

    #[test]
    fn test_node_permissions() {
        let source = boards()
            .with_rows(
                "wcf1_acl_option",
                [
                    json!({ "optionID": 1, "optionName": "canStartThread" }),
                    json!({ "optionID": 2, "optionName": "canViewBoard" }),
                    json!({ "optionID": 3, "optionName": "canDoMagic" }),
                ],
            )
            .with_rows(
                "wcf1_acl_option_to_group",
                [
                    json!({ "optionID": 1, "objectID": 2, "groupID": 3, "optionValue": 0 }),
                    json!({ "optionID": 2, "objectID": 2, "groupID": 3, "optionValue": 1 }),
                    json!({ "optionID": 3, "objectID": 2, "groupID": 3, "optionValue": 1 }),
                    json!({ "optionID": 1, "objectID": 2, "groupID": 1, "optionValue": 1 }),
                ],
            );
        let (mut ctx, target) = memory_context_with_target(Arc::new(source));
        run_once(&Forums, &mut ctx);
        ctx.ids().put("user_group", 3u64, 2).unwrap();
        ctx.ids().put_excluded("user_group", 1u64).unwrap();

        let state = run_once(&NodePermissions, &mut ctx);
        assert_eq!(state.imported, 1);
        assert_eq!(state.skipped, 1);

        let entries = target.records(EntityKind::NodePermission);
        assert_eq!(entries.len(), 1);
        let permissions = &entries[0].1["permissions"];
        assert_eq!(permissions["forum"]["postThread"], "reset");
        assert_eq!(permissions["forum"]["viewContent"], "content_allow");
        assert!(ctx
            .ids()
            .target("node_permission", SourceKey::pair(2, 3))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_watched_forums() {
        let source = boards().with_rows(
            "wcf1_user_object_watch",
            [
                json!({ "watchID": 1, "objectTypeID": 1, "objectID": 2, "userID": 5 }),
                json!({ "watchID": 2, "objectTypeID": 2, "objectID": 2, "userID": 5 }),
                json!({ "watchID": 3, "objectTypeID": 1, "objectID": 6, "userID": 5 }),
            ],
        );
        let (mut ctx, target) = memory_context_with_target(Arc::new(source));
        run_once(&Forums, &mut ctx);
        ctx.ids().put("user", 5u64, 50).unwrap();

        let mut state = StepState::new("watchedForums");
        state.start(WatchedForums.end(&ctx).unwrap());
        assert_eq!(state.end, 3);
        BatchRunner::default()
            .run(&WatchedForums, &mut state, &TimeBudget::unlimited(), &mut ctx)
            .unwrap();
        assert_eq!(state.imported, 1);
        assert_eq!(state.skipped, 1);
        let watches = target.records(EntityKind::ForumWatch);
        assert_eq!(watches[0].1["notify_on"], "thread");
        assert_eq!(watches[0].1["user_id"], 50);
    }

    #[test]
    fn test_thread_prefixes() {
        let source = boards()
            .with_rows(
                "wcf1_label_group",
                [
                    json!({ "groupID": 1, "groupName": "Status", "showOrder": 2 }),
                    json!({ "groupID": 2, "groupName": "Gallery only" }),
                ],
            )
            .with_rows(
                "wcf1_label_group_to_object",
                [
                    json!({ "groupID": 1, "objectTypeID": 1, "objectID": 2 }),
                    json!({ "groupID": 1, "objectTypeID": 1, "objectID": 3 }),
                    json!({ "groupID": 2, "objectTypeID": 9, "objectID": 2 }),
                ],
            )
            .with_rows(
                "wcf1_label",
                [
                    json!({ "labelID": 10, "groupID": 1, "label": "Solved", "cssClassName": "green" }),
                    json!({ "labelID": 11, "groupID": 2, "label": "Photo" }),
                ],
            );
        let (mut ctx, target) = memory_context_with_target(Arc::new(source));
        run_once(&Forums, &mut ctx);

        let state = run_once(&ThreadPrefixes, &mut ctx);
        assert_eq!(state.imported, 1);
        assert_eq!(target.records(EntityKind::ThreadPrefixGroup).len(), 2);

        let prefixes = target.records(EntityKind::ThreadPrefix);
        assert_eq!(prefixes.len(), 1);
        let news = ctx.ids().target("node", 2u64).unwrap().unwrap();
        let docs = ctx.ids().target("node", 3u64).unwrap().unwrap();
        assert_eq!(prefixes[0].1["node_ids"], json!([news, docs]));
        assert_eq!(prefixes[0].1["allowed_user_group_ids"], json!([-1]));
        assert_eq!(
            prefixes[0].1["prefix_group_id"],
            ctx.ids().target("thread_prefix_group", 1u64).unwrap().unwrap()
        );
    }
}

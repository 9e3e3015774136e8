//! End-to-end imports of a small WoltLab board.

use std::sync::Arc;
use std::time::Duration;

use forumport_core::idmap::IdMapStore;
use forumport_core::job::{JobConfig, JobContext, JobExecutor, JobStateStore, TimeBudget};
use forumport_core::redirect::{LegacyUrlResolver, LinkBuilder, Resolution};
use forumport_core::source::MemorySource;
use forumport_core::target::{EntityKind, MemoryTarget};
use forumport_core::wbb;
use pretty_assertions::assert_eq;
use serde_json::json;

const KINDS: [EntityKind; 5] = [
    EntityKind::UserGroup,
    EntityKind::User,
    EntityKind::Node,
    EntityKind::Thread,
    EntityKind::Post,
];

fn board() -> Arc<MemorySource> {
    let source = MemorySource::new()
        .with_rows(
            "wcf1_user_group",
            (1..=6u64).map(|id| json!({ "groupID": id, "groupName": format!("Group {id}"), "priority": id })),
        )
        .with_rows(
            "wcf1_user_option",
            [json!({ "optionID": 1, "optionName": "aboutMe", "categoryName": "profile.aboutMe", "optionType": "aboutMe" })],
        )
        .with_rows(
            "wcf1_user",
            [
                json!({ "userID": 1, "username": "Jane", "email": "jane@example.com", "userOnlineGroupID": 6, "registrationDate": 100 }),
                json!({ "userID": 2, "username": "Bob", "email": "bob@example.com", "registrationDate": 200 }),
                json!({ "userID": 3, "username": "Carl", "email": "carl@example.com" }),
            ],
        )
        .with_rows(
            "wcf1_user_option_value",
            [
                json!({ "userID": 1, "userOption1": "<p>Hi &amp; welcome</p>" }),
                json!({ "userID": 2, "userOption1": "" }),
            ],
        )
        .with_rows(
            "wbb1_board",
            [
                json!({ "boardID": 1, "parentID": 0, "boardType": 1, "title": "Main", "position": 1 }),
                json!({ "boardID": 2, "parentID": 1, "boardType": 0, "title": "General", "position": 1 }),
                json!({ "boardID": 3, "parentID": 1, "boardType": 0, "title": "Help", "position": 2 }),
            ],
        )
        .with_rows(
            "wbb1_thread",
            [
                json!({ "threadID": 10, "boardID": 2, "topic": "Hello &amp; welcome", "userID": 1, "username": "Jane", "time": 1000 }),
                json!({ "threadID": 11, "boardID": 3, "topic": "Help me", "userID": 2, "username": "Bob", "time": 2000 }),
                json!({ "threadID": 12, "boardID": 99, "topic": "Lost", "userID": 2, "time": 3000 }),
            ],
        )
        .with_rows(
            "wbb1_post",
            [
                json!({ "postID": 100, "threadID": 10, "userID": 1, "username": "Jane", "message": "<p>Hello</p>", "time": 1000 }),
                json!({ "postID": 101, "threadID": 10, "userID": 2, "username": "Bob", "message": "[quote='Jane','index.php?thread/10-x/&postID=100#post100']Hello[/quote]Hi!", "time": 1100 }),
                json!({ "postID": 102, "threadID": 11, "userID": 2, "username": "Bob", "message": "Anyone?", "time": 2000, "isDisabled": 1 }),
                json!({ "postID": 103, "threadID": 11, "userID": 1, "username": "Jane", "message": "Yes", "time": 2100 }),
                json!({ "postID": 104, "threadID": 12, "userID": 2, "message": "orphan", "time": 3000 }),
            ],
        );
    Arc::new(source)
}

/// Stores that survive process restarts.
struct Install {
    _db: sled::Db,
    ids: Arc<IdMapStore>,
    states: Arc<JobStateStore>,
    target: Arc<MemoryTarget>,
    source: Arc<MemorySource>,
}

impl Install {
    fn new() -> Self {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Self {
            ids: Arc::new(IdMapStore::open(&db).unwrap()),
            states: Arc::new(JobStateStore::open(&db).unwrap()),
            target: Arc::new(MemoryTarget::new()),
            source: board(),
            _db: db,
        }
    }

    /// A fresh executor, as a new process would build it.
    fn executor(&self, job_id: &str) -> JobExecutor {
        let ctx = JobContext::new(
            JobConfig::new(job_id),
            self.source.clone(),
            self.target.clone(),
            self.ids.clone(),
        )
        .unwrap();
        JobExecutor::new(wbb::catalog().unwrap(), ctx, self.states.clone())
    }

    fn import_all(&self, job_id: &str) {
        let mut executor = self.executor(job_id);
        executor.start(&["posts"]).unwrap();
        let progress = executor
            .run_until_complete(Duration::from_secs(600))
            .unwrap();
        assert!(progress.is_complete());
    }

    fn snapshot(&self) -> Vec<Vec<(u64, serde_json::Value)>> {
        KINDS
            .iter()
            .map(|kind| {
                self.target
                    .records(*kind)
                    .into_iter()
                    .map(|(id, fields)| (id, serde_json::Value::Object(fields)))
                    .collect()
            })
            .collect()
    }

    fn mappings(&self) -> Vec<usize> {
        ["user_group", "user", "node", "thread", "post"]
            .iter()
            .map(|entity_type| self.ids.count(entity_type).unwrap())
            .collect()
    }
}

#[test]
fn test_full_import() {
    let install = Install::new();
    install.import_all("wbb");

    let users = install.target.records(EntityKind::User);
    assert_eq!(users.len(), 2);
    assert_eq!(users[0].1["about"], "Hi & welcome");

    let threads = install.target.records(EntityKind::Thread);
    assert_eq!(threads.len(), 2);
    assert_eq!(threads[0].1["title"], "Hello & welcome");

    let posts = install.target.records(EntityKind::Post);
    assert_eq!(posts.len(), 4);
    let first = install.ids.target("post", 100u64).unwrap().unwrap();
    assert_eq!(
        posts[1].1["message"],
        format!("[QUOTE=\"Jane, post: {first}\"]Hello[/quote]Hi!")
    );
    let positions: Vec<_> = posts.iter().map(|(_, p)| p["position"].clone()).collect();
    assert_eq!(positions, vec![json!(0), json!(1), json!(0), json!(0)]);

    assert!(install.ids.target("post", 104u64).unwrap().is_none());
    assert!(install.ids.target("user", 3u64).unwrap().is_none());
}

#[test]
fn test_interrupted_import_matches_uninterrupted() {
    let reference = Install::new();
    reference.import_all("wbb");

    let resumed = Install::new();
    resumed.executor("wbb").start(&["posts"]).unwrap();
    let mut invocations = 0;
    loop {
        invocations += 1;
        assert!(invocations < 500, "import did not converge");
        let progress = resumed
            .executor("wbb")
            .run_once(&TimeBudget::new(Duration::ZERO))
            .unwrap();
        if progress.is_complete() {
            break;
        }
        assert!(!progress.stalled);
    }
    assert!(invocations > 7);

    assert_eq!(resumed.snapshot(), reference.snapshot());
    assert_eq!(resumed.mappings(), reference.mappings());
}

#[test]
fn test_reimport_creates_no_duplicates() {
    let install = Install::new();
    install.import_all("first");
    let before = install.snapshot();
    let mappings = install.mappings();

    install.import_all("second");
    assert_eq!(install.snapshot(), before);
    assert_eq!(install.mappings(), mappings);
}

#[test]
fn test_every_plan_respects_dependencies() {
    let catalog = wbb::catalog().unwrap();
    for def in catalog.graph().defs() {
        let plan = catalog.graph().plan(&[&def.name], &Default::default()).unwrap();
        for (index, name) in plan.iter().enumerate() {
            let step = catalog.graph().get(name).unwrap();
            for dep in &step.depends {
                let at = plan.iter().position(|p| p == dep);
                assert!(
                    matches!(at, Some(at) if at < index),
                    "{dep} must run before {name} in plan for {}",
                    def.name
                );
            }
            for forced in &step.forces {
                assert!(plan.contains(forced), "{name} forces {forced}");
            }
        }
    }
}

#[test]
fn test_legacy_links_resolve_after_import() {
    let install = Install::new();
    install.import_all("wbb");

    let resolver =
        LegacyUrlResolver::new(install.ids.clone(), LinkBuilder::new("https://forum.example")).unwrap();
    let thread = install.ids.target("thread", 10u64).unwrap().unwrap();
    assert_eq!(
        resolver.resolve("/forum/index.php?thread/10-hello-welcome/"),
        Resolution::Redirect(format!("https://forum.example/threads/{thread}/"))
    );
    let post = install.ids.target("post", 103u64).unwrap().unwrap();
    assert_eq!(
        resolver.resolve("/index.php?page=Thread&postID=103"),
        Resolution::Redirect(format!("https://forum.example/posts/{post}/"))
    );
    assert_eq!(resolver.resolve("/thread/12-lost/"), Resolution::PassThrough);
    assert_eq!(resolver.resolve("/user/3-carl/"), Resolution::PassThrough);
}

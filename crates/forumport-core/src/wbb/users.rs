//! User groups, profile fields, users and their follow/ignore lists.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{record, target, target_or, warm};
use crate::auth::{LegacyPassword, LEGACY_AUTH_SCHEME};
use crate::error::Error;
use crate::idmap::{Lookup, SourceKey};
use crate::job::{
    JobContext, PagedStep, RecordOutcome, Step, StepOutcome, StepState, TimeBudget,
};
use crate::source::{SourceRow, SourceTable};
use crate::target::EntityKind;

/// Target built-in group ids.
const GROUP_GUEST: u64 = 1;
const GROUP_REGISTERED: u64 = 2;
const GROUP_ADMIN: u64 = 3;
const GROUP_MODERATOR: u64 = 4;

/// Source groups with a fixed target counterpart. `None` = never imported.
const GROUP_MAP: [(u64, Option<u64>); 5] = [
    (1, None),
    (2, Some(GROUP_GUEST)),
    (3, Some(GROUP_REGISTERED)),
    (4, Some(GROUP_ADMIN)),
    (5, Some(GROUP_MODERATOR)),
];

/// How a source group option becomes a target permission value.
#[derive(Clone, Copy)]
enum Grant {
    Flag,
    Integer,
}

/// `(permission group, permission, source option, grant)`.
const GROUP_PERMISSIONS: &[(&str, &str, &str, Grant)] = &[
    ("avatar", "allowed", "user.profile.avatar.canUploadAvatar", Grant::Flag),
    ("conversation", "alwaysInvite", "user.conversation.canSetCanInvite", Grant::Flag),
    ("conversation", "editAnyMessage", "mod.conversation.canModerateConversation", Grant::Flag),
    ("conversation", "editOwnMessage", "user.conversation.canEditMessage", Grant::Flag),
    ("conversation", "maxRecipients", "user.conversation.maxParticipants", Grant::Integer),
    ("conversation", "start", "user.conversation.canUseConversation", Grant::Flag),
    ("conversation", "uploadAttachment", "user.conversation.canUploadAttachment", Grant::Flag),
    ("forum", "approveUnapprove", "mod.board.canEnablePost", Grant::Flag),
    ("forum", "deleteAnyPost", "mod.board.canDeletePost", Grant::Flag),
    ("forum", "deleteAnyThread", "mod.board.canDeleteThread", Grant::Flag),
    ("forum", "deleteOwnPost", "user.board.canDeleteOwnPost", Grant::Flag),
    ("forum", "editAnyPost", "mod.board.canEditPost", Grant::Flag),
    ("forum", "editOwnPost", "user.board.canEditOwnPost", Grant::Flag),
    ("forum", "editOwnPostTimeLimit", "user.board.postEditTimeout", Grant::Integer),
    ("forum", "hardDeleteAnyPost", "mod.board.canDeletePostCompletely", Grant::Flag),
    ("forum", "hardDeleteAnyThread", "mod.board.canDeleteThreadCompletely", Grant::Flag),
    ("forum", "lockUnlockThread", "mod.board.canCloseThread", Grant::Flag),
    ("forum", "manageAnyTag", "admin.content.tag.canManageTag", Grant::Flag),
    ("forum", "manageAnyThread", "mod.board.canPinThread", Grant::Flag),
    ("forum", "manageOthersTagsOwnThread", "user.board.canSetTags", Grant::Flag),
    ("forum", "markSolution", "user.board.canMarkAsDoneOwnThread", Grant::Flag),
    ("forum", "markSolutionAnyThread", "mod.board.canMarkAsDoneThread", Grant::Flag),
    ("forum", "postReply", "user.board.canReplyThread", Grant::Flag),
    ("forum", "postThread", "user.board.canStartThread", Grant::Flag),
    ("forum", "react", "user.board.canLikePost", Grant::Flag),
    ("forum", "stickUnstickThread", "mod.board.canPinThread", Grant::Flag),
    ("forum", "tagAnyThread", "admin.content.tag.canManageTag", Grant::Flag),
    ("forum", "tagOwnThread", "user.board.canSetTags", Grant::Flag),
    ("forum", "undelete", "mod.board.canRestorePost", Grant::Flag),
    ("forum", "uploadAttachment", "user.board.canUploadAttachment", Grant::Flag),
    ("forum", "viewAttachment", "user.board.canDownloadAttachment", Grant::Flag),
    ("forum", "viewContent", "user.board.canReadThread", Grant::Flag),
    ("forum", "viewDeleted", "mod.board.canReadDeletedPost", Grant::Flag),
    ("forum", "viewModerated", "mod.board.canEnablePost", Grant::Flag),
    ("forum", "viewOthers", "user.board.canReadThread", Grant::Flag),
    ("forum", "votePoll", "user.board.canVotePoll", Grant::Flag),
    ("forum", "warn", "mod.infraction.warning.canWarn", Grant::Flag),
    ("general", "approveRejectUser", "admin.user.canEnableUser", Grant::Flag),
    ("general", "banUser", "admin.user.canBanUser", Grant::Flag),
    ("general", "bypassUserPrivacy", "admin.general.canViewPrivateUserOptions", Grant::Flag),
    ("general", "editCustomTitle", "user.profile.canEditUserTitle", Grant::Flag),
    ("general", "changeUsername", "user.profile.canRename", Grant::Flag),
    ("general", "manageWarning", "admin.user.infraction.canManageWarning", Grant::Flag),
    ("general", "report", "user.profile.canReportContent", Grant::Flag),
    ("general", "submitWithoutApproval", "user.board.canStartThreadWithoutModeration", Grant::Flag),
    ("general", "viewIps", "admin.user.canViewIpAddress", Grant::Flag),
    ("general", "viewMemberList", "user.profile.canViewMembersList", Grant::Flag),
    ("general", "viewProfile", "user.profile.canViewUserProfile", Grant::Flag),
    ("general", "warn", "mod.infraction.warning.canWarn", Grant::Flag),
    ("profilePost", "approveUnapprove", "mod.profileComment.canModerateComment", Grant::Flag),
    ("profilePost", "comment", "user.profileComment.canAddComment", Grant::Flag),
    ("profilePost", "deleteAny", "mod.profileComment.canDeleteComment", Grant::Flag),
    ("profilePost", "deleteOwn", "user.profileComment.canDeleteComment", Grant::Flag),
    ("profilePost", "editAny", "mod.profileComment.canEditComment", Grant::Flag),
    ("profilePost", "editOwn", "user.profileComment.canEditComment", Grant::Flag),
];

/// Permission value of a numeric source option.
fn option_int(value: Option<&str>) -> i64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

/// Build the permission sets of a group from its `optionName -> value` pairs.
fn group_permissions(options: &BTreeMap<String, String>) -> Map<String, Value> {
    let mut permissions = Map::new();
    for (group, permission, option, grant) in GROUP_PERMISSIONS {
        let value = options.get(*option).map(String::as_str);
        let value = match grant {
            Grant::Flag if option_int(value) != 0 => json!("allow"),
            Grant::Flag => json!("unset"),
            Grant::Integer => json!(option_int(value)),
        };
        if let Value::Object(set) = permissions
            .entry(group.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
        {
            set.insert(permission.to_string(), value);
        }
    }
    permissions
}

/// Imports user groups. The built-in groups map onto their target
/// counterparts; group 1 ("everyone") is recorded as excluded.
pub struct UserGroups;

impl UserGroups {
    fn option_names(ctx: &JobContext) -> Result<BTreeMap<u64, String>, Error> {
        let table = SourceTable::new(ctx.config().wcf_table("user_group_option"), "optionID");
        Ok(ctx
            .source()
            .fetch_all(&table)?
            .into_iter()
            .map(|row| (row.key, row.string("optionName")))
            .collect())
    }

    fn group_options(
        ctx: &JobContext,
        names: &BTreeMap<u64, String>,
        group_id: u64,
    ) -> Result<BTreeMap<String, String>, Error> {
        let table = SourceTable::new(ctx.config().wcf_table("user_group_option_value"), "optionID");
        Ok(ctx
            .source()
            .fetch_by(&table, "groupID", &[Value::from(group_id)])?
            .into_iter()
            .filter_map(|row| {
                names
                    .get(&row.key)
                    .map(|name| (name.clone(), row.string("optionValue")))
            })
            .collect())
    }
}

impl Step for UserGroups {
    fn run(
        &self,
        state: &mut StepState,
        _budget: &TimeBudget,
        ctx: &mut JobContext,
    ) -> Result<StepOutcome, Error> {
        let table = SourceTable::new(ctx.config().wcf_table("user_group"), "groupID");
        let groups = ctx.source().fetch_all(&table)?;
        let names = Self::option_names(ctx)?;

        for group in groups {
            let fixed = GROUP_MAP.iter().find(|(source, _)| *source == group.key);
            match fixed {
                Some((source, Some(target_id))) => ctx.ids().put("user_group", *source, *target_id)?,
                Some((source, None)) => ctx.ids().put_excluded("user_group", *source)?,
                None => {
                    let options = Self::group_options(ctx, &names, group.key)?;
                    let mut entity = ctx.new_entity(EntityKind::UserGroup)?;
                    entity.bulk_set(record(json!({
                        "title": group.str("groupName"),
                        "user_title": group.str("groupName"),
                        "display_style_priority": group.i64("priority"),
                        "permissions": group_permissions(&options),
                    })));
                    if entity.save(SourceKey::from(group.key))?.is_none() {
                        state.skipped += 1;
                        continue;
                    }
                }
            }
            state.imported += 1;
        }
        Ok(StepOutcome::Complete)
    }
}

/// Source option columns that map onto built-in target profile columns.
const COLUMN_MAP: [(&str, &str); 12] = [
    ("birthdayShowYear", "show_dob_year"),
    ("showSignature", "content_show_signature"),
    ("adminCanMail", "receive_admin_email"),
    ("canViewProfile", "allow_view_profile"),
    ("canViewOnlineStatus", "visible"),
    ("canWriteProfileComments", "allow_post_profile"),
    ("canSendConversation", "allow_send_personal_conversation"),
    ("timezone", "timezone"),
    ("aboutMe", "about"),
    ("birthday", "birthday"),
    ("location", "location"),
    ("homepage", "website"),
];

/// Contact fields the target ships with.
const BUILTIN_FIELDS: [&str; 3] = ["facebook", "skype", "twitter"];

/// Longest field id the target accepts.
const MAX_FIELD_ID_LEN: usize = 25;

/// Target field type of a source option type.
pub fn field_type(option_type: &str) -> Option<&'static str> {
    match option_type {
        "birthday" | "text" | "URL" | "timezone" => Some("textbox"),
        "aboutMe" | "Address" | "Codemirror" | "textarea" => Some("textarea"),
        "boolean" | "Checkbox" | "CheckboxSet" | "YesNo" => Some("checkbox"),
        "Editor" => Some("bbcode"),
        "Radio" => Some("radio"),
        "Rating" => Some("stars"),
        "select" => Some("select"),
        _ => None,
    }
}

/// Target field id derived from a source option name.
fn field_id(option_name: &str) -> String {
    let id: String = option_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .map(|c| c.to_ascii_lowercase())
        .take(MAX_FIELD_ID_LEN)
        .collect();
    if id.is_empty() {
        "field".to_string()
    } else {
        id
    }
}

/// Parse `key:value` choice lines; bare lines are numbered.
pub fn parse_choices(text: &str) -> Vec<(String, String)> {
    let mut choices = Vec::new();
    let mut next_index = 0usize;
    for line in text.lines().map(|l| l.trim_end_matches('\r')) {
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) => choices.push((key.to_string(), value.to_string())),
            None => {
                choices.push((next_index.to_string(), line.to_string()));
                next_index += 1;
            }
        }
    }
    choices
}

/// Imports custom profile fields and records where every profile option lives.
pub struct UserFields;

impl UserFields {
    fn default_language(ctx: &JobContext) -> Result<Option<u64>, Error> {
        let table = SourceTable::new(ctx.config().wcf_table("language"), "languageID");
        Ok(ctx
            .source()
            .fetch_by(&table, "isDefault", &[Value::from(1)])?
            .first()
            .map(|row| row.key))
    }

    /// `languageItem -> value` for the default language.
    fn phrases(
        ctx: &JobContext,
        language: Option<u64>,
        items: Vec<String>,
    ) -> Result<BTreeMap<String, String>, Error> {
        let Some(language) = language else {
            return Ok(BTreeMap::new());
        };
        if items.is_empty() {
            return Ok(BTreeMap::new());
        }
        let table = SourceTable::new(ctx.config().wcf_table("language_item"), "languageItemID")
            .filtered("languageID", language);
        let values: Vec<Value> = items.into_iter().map(Value::from).collect();
        Ok(ctx
            .source()
            .fetch_by(&table, "languageItem", &values)?
            .into_iter()
            .map(|row| (row.string("languageItem"), row.string("languageItemValue")))
            .collect())
    }
}

impl Step for UserFields {
    fn run(
        &self,
        state: &mut StepState,
        _budget: &TimeBudget,
        ctx: &mut JobContext,
    ) -> Result<StepOutcome, Error> {
        let table = SourceTable::new(ctx.config().wcf_table("user_option"), "optionID");
        let options = ctx.source().fetch_all(&table)?;
        let language = Self::default_language(ctx)?;
        let titles = Self::phrases(
            ctx,
            language,
            options
                .iter()
                .map(|o| format!("wcf.user.option.{}", o.str("optionName")))
                .collect(),
        )?;

        let mut field_map = BTreeMap::new();
        let mut custom_field_map = BTreeMap::new();
        let mut used_ids: Vec<String> = Vec::new();

        for option in &options {
            let name = option.str("optionName");
            let column = format!("userOption{}", option.key);

            if let Some((_, target_column)) = COLUMN_MAP.iter().find(|(source, _)| *source == name) {
                field_map.insert(target_column.to_string(), column);
                continue;
            }

            let category = option.str("categoryName");
            if category == "hidden" || category.starts_with("settings.") {
                continue;
            }

            if BUILTIN_FIELDS.contains(&name) {
                custom_field_map.insert(name.to_string(), column);
                continue;
            }

            let Some(kind) = field_type(option.str("optionType")) else {
                debug!(option = name, option_type = option.str("optionType"), "unsupported field type");
                state.skipped += 1;
                continue;
            };

            let mut id = field_id(name);
            let mut suffix = 1;
            while used_ids.contains(&id) || BUILTIN_FIELDS.contains(&id.as_str()) {
                id = format!("{}{suffix}", field_id(name).chars().take(MAX_FIELD_ID_LEN - 3).collect::<String>());
                suffix += 1;
            }
            used_ids.push(id.clone());

            let title = titles
                .get(&format!("wcf.user.option.{name}"))
                .cloned()
                .unwrap_or_else(|| name.to_string());

            let mut entity = ctx.new_entity(EntityKind::UserField)?;
            entity.bulk_set(record(json!({
                "field_id": id,
                "field_type": kind,
                "title": title,
                "display_group": if category == "profile.contact" { "contact" } else { "personal" },
                "user_editable": if option.bool("editable") { "yes" } else { "never" },
                "viewable_profile": option.bool("visible"),
                "required": option.bool("required"),
                "show_registration": option.bool("askDuringRegistration"),
                "match_params": [],
            })));

            let select_options = option.str("selectOptions");
            if !select_options.is_empty() && matches!(kind, "select" | "checkbox" | "radio") {
                let choices = parse_choices(select_options);
                let phrases = Self::phrases(
                    ctx,
                    language,
                    choices
                        .iter()
                        .filter(|(_, value)| value.starts_with("wcf."))
                        .map(|(_, value)| value.clone())
                        .collect(),
                )?;
                let choices: Map<String, Value> = choices
                    .into_iter()
                    .map(|(key, value)| {
                        let label = phrases.get(&value).cloned().unwrap_or(value);
                        (key, Value::from(label))
                    })
                    .collect();
                entity.set("field_choices", Value::Object(choices));
            }

            match entity.save(SourceKey::from(name))? {
                Some(_) => {
                    custom_field_map.insert(id, column);
                    state.imported += 1;
                }
                None => state.skipped += 1,
            }
        }

        info!(
            profile_columns = field_map.len(),
            custom_fields = custom_field_map.len(),
            "profile field map built"
        );
        ctx.set_field_map(field_map);
        ctx.set_custom_field_map(custom_field_map);
        Ok(StepOutcome::Complete)
    }
}

/// Source time zones the target does not know, and their replacement.
const TIMEZONE_MAP: [(&str, &str); 28] = [
    ("Pacific/Samoa", "Pacific/Midway"),
    ("America/Tegucigalpa", "America/Chicago"),
    ("America/Regina", "America/Chicago"),
    ("America/Indiana/Indianapolis", "America/New_York"),
    ("America/Rio_Branco", "America/New_York"),
    ("America/Cayenne", "America/Godthab"),
    ("Atlantic/South_Georgia", "Atlantic/Azores"),
    ("Africa/Monrovia", "Europe/London"),
    ("Europe/Berlin", "Europe/Amsterdam"),
    ("Europe/Belgrade", "Europe/Amsterdam"),
    ("Europe/Paris", "Europe/Amsterdam"),
    ("Europe/Sarajevo", "Europe/Amsterdam"),
    ("Africa/Harare", "Africa/Cairo"),
    ("Europe/Helsinki", "Europe/Kaliningrad"),
    ("Asia/Baghdad", "Asia/Amman"),
    ("Asia/Kuwait", "Asia/Amman"),
    ("Asia/Muscat", "Asia/Baku"),
    ("Asia/Tbilisi", "Asia/Yerevan"),
    ("Asia/Karachi", "Asia/Tashkent"),
    ("Asia/Colombo", "Asia/Kolkata"),
    ("Asia/Katmandu", "Asia/Colombo"),
    ("Asia/Rangoon", "Asia/Novosibirsk"),
    ("Asia/Kuala_Lumpur", "Asia/Irkutsk"),
    ("Asia/Chongqing", "Asia/Irkutsk"),
    ("Asia/Taipei", "Asia/Irkutsk"),
    ("Asia/Ulaanbaatar", "Asia/Irkutsk"),
    ("Pacific/Guam", "Australia/Sydney"),
    ("Australia/Hobart", "Australia/Sydney"),
];

/// Target time zone for a source zone; unknown or empty zones get `fallback`.
pub fn map_timezone(zone: &str, fallback: &str) -> String {
    let zone = zone.trim();
    if let Some((_, mapped)) = TIMEZONE_MAP.iter().find(|(source, _)| *source == zone) {
        return mapped.to_string();
    }
    let plausible = zone == "UTC"
        || zone
            .split_once('/')
            .is_some_and(|(area, city)| !area.is_empty() && !city.is_empty());
    if plausible {
        zone.to_string()
    } else {
        fallback.to_string()
    }
}

/// `YYYY-MM-DD` birthday parts, `None` for empty or zero dates.
pub fn parse_birthday(value: &str) -> Option<(u32, u32, u32)> {
    let mut parts = value.trim().splitn(3, '-');
    let year = parts.next()?.parse().ok()?;
    let month = parts.next()?.parse().ok()?;
    let day = parts.next()?.get(..2)?.parse().ok()?;
    if year == 0 || month == 0 || day == 0 {
        return None;
    }
    Some((year, month, day))
}

/// Privacy level names indexed by source value.
const VIEW_PROFILE: [&str; 4] = ["everyone", "members", "followed", "none"];
const SEND_CONVERSATION: [&str; 3] = ["members", "followed", "none"];
const POST_PROFILE: [&str; 4] = ["members", "members", "followed", "none"];

fn privacy(levels: &[&'static str], value: i64) -> &'static str {
    usize::try_from(value)
        .ok()
        .and_then(|i| levels.get(i))
        .copied()
        .unwrap_or(levels[0])
}

/// Imports users with their profile, options, ban and avatar.
pub struct Users;

/// A source user with its option row.
struct UserRow<'a> {
    user: &'a SourceRow,
    options: SourceRow,
    field_map: &'a BTreeMap<String, String>,
}

impl UserRow<'_> {
    fn option(&self, target_column: &str) -> Option<&Value> {
        self.field_map
            .get(target_column)
            .and_then(|column| self.options.get(column))
    }

    fn option_str(&self, target_column: &str) -> String {
        match self.option(target_column) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }

    fn option_int(&self, target_column: &str) -> i64 {
        option_int(Some(self.option_str(target_column).as_str()))
    }
}

impl Users {
    fn options_of(ctx: &JobContext, user_id: u64) -> Result<Option<SourceRow>, Error> {
        let table = SourceTable::new(ctx.config().wcf_table("user_option_value"), "userID");
        Ok(ctx
            .source()
            .fetch_by(&table, "userID", &[Value::from(user_id)])?
            .into_iter()
            .next())
    }

    fn secondary_groups(ctx: &JobContext, user_id: u64) -> Result<Vec<u64>, Error> {
        let table = SourceTable::new(ctx.config().wcf_table("user_to_group"), "groupID");
        let mut groups = Vec::new();
        for row in ctx.source().fetch_by(&table, "userID", &[Value::from(user_id)])? {
            if let Lookup::Mapped(id) = ctx.ids().lookup("user_group", row.key)? {
                if !groups.contains(&id) {
                    groups.push(id);
                }
            }
        }
        Ok(groups)
    }

    fn avatar_path(ctx: &JobContext, user: &SourceRow) -> Result<Option<String>, Error> {
        let avatar_id = user.u64("avatarID");
        let Some(uploads) = ctx.config().base.uploads_path.as_deref() else {
            return Ok(None);
        };
        if avatar_id == 0 {
            return Ok(None);
        }
        let table = SourceTable::new(ctx.config().wcf_table("user_avatar"), "avatarID");
        let Some(avatar) = ctx
            .source()
            .fetch_by(&table, "avatarID", &[Value::from(avatar_id)])?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        let hash = avatar.str("fileHash");
        let path = avatar_file(uploads, avatar_id, hash, avatar.str("avatarExtension"));
        Ok(path
            .filter(|p| p.is_file())
            .map(|p| p.to_string_lossy().into_owned()))
    }

    /// Existing target user this source user merges into.
    fn merge_target(ctx: &JobContext, username: &str, email: &str) -> Result<Option<u64>, Error> {
        let config = &ctx.config().steps.users;
        if config.merge_email && !email.is_empty() {
            if let Some(id) = ctx.target().find_by(EntityKind::User, "email", &Value::from(email))? {
                return Ok(Some(id));
            }
        }
        if config.merge_name {
            if let Some(id) =
                ctx.target()
                    .find_by(EntityKind::User, "username", &Value::from(username))?
            {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }
}

/// `images/avatars/<hh>/<id>-<hash>.<ext>` under the uploads root.
fn avatar_file(uploads: &Path, avatar_id: u64, hash: &str, extension: &str) -> Option<std::path::PathBuf> {
    let bucket = hash.get(..2)?;
    Some(
        uploads
            .join("images")
            .join("avatars")
            .join(bucket)
            .join(format!("{avatar_id}-{hash}.{extension}")),
    )
}

impl PagedStep for Users {
    fn end(&self, ctx: &JobContext) -> Result<u64, Error> {
        ctx.source()
            .max_key(&SourceTable::new(ctx.config().wcf_table("user"), "userID"))
    }

    fn fetch_page(
        &self,
        ctx: &JobContext,
        start_after: u64,
        end: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, Error> {
        ctx.source().fetch_page(
            &SourceTable::new(ctx.config().wcf_table("user"), "userID"),
            start_after,
            end,
            limit,
        )
    }

    fn prepare_page(&self, rows: &[SourceRow], ctx: &mut JobContext) -> Result<(), Error> {
        warm(ctx, "user_group", rows, &["userOnlineGroupID"])
    }

    fn import_row(&self, row: &SourceRow, ctx: &mut JobContext) -> Result<RecordOutcome, Error> {
        if ctx.ids().lookup("user", row.key)? != Lookup::Missing {
            return Ok(RecordOutcome::Imported);
        }
        let Some(options) = Self::options_of(ctx, row.key)? else {
            return Ok(RecordOutcome::malformed("user has no option values"));
        };
        let field_map = ctx.field_map()?.clone();
        let custom_field_map = ctx.custom_field_map()?.clone();
        let user = UserRow {
            user: row,
            options,
            field_map: &field_map,
        };

        let username = user.user.str("username").trim().to_string();
        if username.is_empty() {
            return Ok(RecordOutcome::malformed("empty username"));
        }
        let email = user.user.str("email").trim().to_string();

        if let Some(existing) = Self::merge_target(ctx, &username, &email)? {
            debug!(source_id = row.key, target_id = existing, "user merged into existing account");
            ctx.ids().put("user", row.key, existing)?;
            return Ok(RecordOutcome::Imported);
        }

        let username = match ctx
            .target()
            .find_by(EntityKind::User, "username", &Value::from(username.as_str()))?
        {
            Some(_) => format!("{username} ({})", row.key),
            None => username,
        };

        let mut fields = record(json!({
            "username": username,
            "email": email,
            "last_activity": row.i64("lastActivityTime"),
            "register_date": row.i64("registrationDate"),
            "message_count": row.i64("wbbPosts"),
            "is_banned": row.bool("banned"),
            "user_state": "valid",
            "user_group_id": GROUP_REGISTERED,
            "display_style_group_id": target_or(ctx, "user_group", row.u64("userOnlineGroupID"), GROUP_REGISTERED)?,
            "secondary_group_ids": Self::secondary_groups(ctx, row.key)?,
            "timezone": map_timezone(&user.option_str("timezone"), &ctx.config().base.guest_timezone),
            "about": ctx.rewrite(&user.option_str("about"), false),
            "signature": ctx.rewrite(row.str("signature"), false),
            "location": user.option_str("location"),
            "website": user.option_str("website"),
            "registration_ip": row.str("registrationIpAddress"),
            "custom_title": row.str("userTitle"),
            "visible": user.option_int("visible") != 3,
            "privacy": {
                "allow_view_profile": privacy(&VIEW_PROFILE, user.option_int("allow_view_profile")),
                "allow_send_personal_conversation": privacy(&SEND_CONVERSATION, user.option_int("allow_send_personal_conversation")),
                "allow_post_profile": privacy(&POST_PROFILE, user.option_int("allow_post_profile")),
            },
            "option": {
                "show_dob_year": user.option_int("show_dob_year") != 0,
                "content_show_signature": user.option_int("content_show_signature") != 0,
                "receive_admin_email": user.option_int("receive_admin_email") != 0,
            },
        }));

        if row.has("disclaimerAccepted") && row.bool("disclaimerAccepted") {
            fields.insert("terms_accepted".into(), json!(row.i64("disclaimerAccepted")));
        }
        if row.bool("banned") {
            fields.insert(
                "ban".into(),
                json!({
                    "end_date": row.i64("banExpires"),
                    "user_reason": row.str("banReason"),
                }),
            );
        }
        if let Some(password) = LegacyPassword::parse(row.str("password")) {
            fields.insert(
                "auth".into(),
                json!({ "scheme": LEGACY_AUTH_SCHEME, "data": password }),
            );
        }
        if let Some((year, month, day)) = parse_birthday(&user.option_str("birthday")) {
            fields.insert("dob_year".into(), json!(year));
            fields.insert("dob_month".into(), json!(month));
            fields.insert("dob_day".into(), json!(day));
        }
        if let Some(path) = Self::avatar_path(ctx, row)? {
            fields.insert("avatar_path".into(), json!(path));
        }
        if ctx.config().steps.users.super_admins.contains(&row.key) {
            fields.insert("is_admin".into(), json!(true));
            fields.insert("is_super_admin".into(), json!(true));
        }

        let custom: Map<String, Value> = custom_field_map
            .iter()
            .map(|(field, column)| {
                let value = user.options.get(column).cloned().unwrap_or(Value::from(""));
                (field.clone(), value)
            })
            .collect();
        fields.insert("custom_fields".into(), Value::Object(custom));

        let mut entity = ctx.new_entity(EntityKind::User)?;
        entity.bulk_set(fields);
        Ok(RecordOutcome::saved(entity.save(SourceKey::from(row.key))?))
    }
}

/// Pairwise user relation (`user_follow`, `user_ignore`).
struct Relation {
    table: &'static str,
    key: &'static str,
    other: &'static str,
    kind: EntityKind,
    field: &'static str,
}

impl Relation {
    fn table(&self, ctx: &JobContext) -> SourceTable {
        SourceTable::new(ctx.config().wcf_table(self.table), self.key)
    }

    fn import(&self, row: &SourceRow, ctx: &JobContext) -> Result<RecordOutcome, Error> {
        let Some(user_id) = target(ctx, "user", row.u64("userID"))? else {
            return Ok(RecordOutcome::missing("user", row.u64("userID")));
        };
        let Some(other_id) = target(ctx, "user", row.u64(self.other))? else {
            return Ok(RecordOutcome::missing("user", row.u64(self.other)));
        };
        let mut entity = ctx.new_entity(self.kind)?;
        entity.bulk_set(record(json!({ "user_id": user_id, (self.field): other_id })));
        Ok(RecordOutcome::saved(entity.save(SourceKey::from(row.key))?))
    }
}

const FOLLOW: Relation = Relation {
    table: "user_follow",
    key: "followID",
    other: "followUserID",
    kind: EntityKind::UserFollow,
    field: "follow_user_id",
};

const IGNORE: Relation = Relation {
    table: "user_ignore",
    key: "ignoreID",
    other: "ignoreUserID",
    kind: EntityKind::UserIgnore,
    field: "ignored_user_id",
};

pub struct FollowedUsers;

impl PagedStep for FollowedUsers {
    fn end(&self, ctx: &JobContext) -> Result<u64, Error> {
        ctx.source().max_key(&FOLLOW.table(ctx))
    }

    fn fetch_page(
        &self,
        ctx: &JobContext,
        start_after: u64,
        end: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, Error> {
        ctx.source()
            .fetch_page(&FOLLOW.table(ctx), start_after, end, limit)
    }

    fn prepare_page(&self, rows: &[SourceRow], ctx: &mut JobContext) -> Result<(), Error> {
        warm(ctx, "user", rows, &["userID", "followUserID"])
    }

    fn import_row(&self, row: &SourceRow, ctx: &mut JobContext) -> Result<RecordOutcome, Error> {
        FOLLOW.import(row, ctx)
    }
}

pub struct IgnoredUsers;

impl PagedStep for IgnoredUsers {
    fn end(&self, ctx: &JobContext) -> Result<u64, Error> {
        ctx.source().max_key(&IGNORE.table(ctx))
    }

    fn fetch_page(
        &self,
        ctx: &JobContext,
        start_after: u64,
        end: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, Error> {
        ctx.source()
            .fetch_page(&IGNORE.table(ctx), start_after, end, limit)
    }

    fn prepare_page(&self, rows: &[SourceRow], ctx: &mut JobContext) -> Result<(), Error> {
        warm(ctx, "user", rows, &["userID", "ignoreUserID"])
    }

    fn import_row(&self, row: &SourceRow, ctx: &mut JobContext) -> Result<RecordOutcome, Error> {
        IGNORE.import(row, ctx)
    }
}

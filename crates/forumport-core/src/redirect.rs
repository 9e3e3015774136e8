//! Legacy URL resolution.
//!
//! Requests that would otherwise be answered with "not found" are matched
//! against the URL shapes of the source board. When the embedded source id has
//! a translation, the caller answers with a permanent redirect to the
//! canonical target URL; every other case falls through to the ordinary
//! not-found handling. The resolver only ever sees a [`TranslationLookup`],
//! so it cannot write translations.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::error::Error;
use crate::idmap::{Lookup, SourceKey, TranslationLookup};

/// Content types a legacy URL can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegacyContent {
    Post,
    Thread,
    Forum,
    User,
}

impl LegacyContent {
    /// Entity type under which the translation is recorded.
    pub fn entity_type(self) -> &'static str {
        match self {
            LegacyContent::Post => "post",
            LegacyContent::Thread => "thread",
            LegacyContent::Forum => "forum",
            LegacyContent::User => "user",
        }
    }

    fn from_path_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "board" => Some(LegacyContent::Forum),
            "thread" => Some(LegacyContent::Thread),
            "user" => Some(LegacyContent::User),
            _ => None,
        }
    }
}

/// A `(content type, source id)` pair extracted from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyUrl {
    pub content: LegacyContent,
    pub source_id: u64,
}

impl LegacyUrl {
    pub fn new(content: LegacyContent, source_id: u64) -> Self {
        Self { content, source_id }
    }
}

/// Recognises legacy request URIs.
///
/// A single URI can yield several candidates, e.g. a thread path that also
/// names a post. Candidates are returned in the order they should be tried.
pub struct LegacyUrlParser {
    post_in_thread: Regex,
    content_path: Regex,
}

/// Query parameters of older URL schemes, in lookup order.
const QUERY_PARAMS: [(&str, LegacyContent); 3] = [
    ("postID", LegacyContent::Post),
    ("threadID", LegacyContent::Thread),
    ("boardID", LegacyContent::Forum),
];

impl LegacyUrlParser {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            post_in_thread: Regex::new(r"(?i)thread/\d+-[^?]*/.*?[&?]postID=(\d+)(?:&.*)?$")?,
            content_path: Regex::new(r"(?i)(board|thread|user)/(\d+)-.*?/$")?,
        })
    }

    /// Candidates found in `uri` (path plus optional query string).
    pub fn parse(&self, uri: &str) -> Vec<LegacyUrl> {
        let mut found = Vec::new();

        if let Some(caps) = self.post_in_thread.captures(uri) {
            if let Ok(id) = caps[1].parse() {
                found.push(LegacyUrl::new(LegacyContent::Post, id));
            }
        }

        if let Some(caps) = self.content_path.captures(uri) {
            if let (Some(content), Ok(id)) =
                (LegacyContent::from_path_token(&caps[1]), caps[2].parse())
            {
                found.push(LegacyUrl::new(content, id));
            }
        }

        if let Some((_, query)) = uri.split_once('?') {
            let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect();
            for (param, content) in QUERY_PARAMS {
                let id = pairs
                    .iter()
                    .find(|(key, _)| key == param)
                    .and_then(|(_, value)| value.parse::<u64>().ok())
                    .filter(|id| *id > 0);
                if let Some(id) = id {
                    let candidate = LegacyUrl::new(content, id);
                    if !found.contains(&candidate) {
                        found.push(candidate);
                    }
                }
            }
        }

        found
    }
}

/// Builds canonical target links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkBuilder {
    base_url: String,
}

impl LinkBuilder {
    /// Links relative to `base_url`, e.g. `https://forum.example` or empty
    /// for root-relative links.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    pub fn canonical(&self, content: LegacyContent, target_id: u64) -> String {
        let route = match content {
            LegacyContent::Post => "posts",
            LegacyContent::Thread => "threads",
            LegacyContent::Forum => "forums",
            LegacyContent::User => "members",
        };
        format!("{}/{route}/{target_id}/", self.base_url)
    }
}

impl Default for LinkBuilder {
    fn default() -> Self {
        Self::new("")
    }
}

/// Outcome of resolving a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Answer with a permanent redirect to this location.
    Redirect(String),
    /// Continue with the ordinary not-found response.
    PassThrough,
}

/// Maps legacy request URIs to canonical target links.
#[derive(Clone)]
pub struct LegacyUrlResolver {
    parser: Arc<LegacyUrlParser>,
    lookup: Arc<dyn TranslationLookup>,
    links: LinkBuilder,
}

impl LegacyUrlResolver {
    pub fn new(lookup: Arc<dyn TranslationLookup>, links: LinkBuilder) -> Result<Self, Error> {
        Ok(Self {
            parser: Arc::new(LegacyUrlParser::new()?),
            lookup,
            links,
        })
    }

    /// Resolve a request URI.
    ///
    /// Store failures are logged and treated as a miss; a visitor only ever
    /// sees a redirect or the ordinary not-found page.
    pub fn resolve(&self, uri: &str) -> Resolution {
        for candidate in self.parser.parse(uri) {
            let entity_type = candidate.content.entity_type();
            let source_id = SourceKey::from(candidate.source_id);
            match self.lookup.lookup(entity_type, &source_id) {
                Ok(Lookup::Mapped(target_id)) => {
                    let location = self.links.canonical(candidate.content, target_id);
                    debug!(uri, entity_type, source_id = %source_id, target_id, "legacy url redirected");
                    return Resolution::Redirect(location);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(uri, entity_type, source_id = %source_id, error = %err, "translation lookup failed");
                }
            }
        }
        Resolution::PassThrough
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::IdMapStore;

    fn resolver() -> (LegacyUrlResolver, Arc<IdMapStore>) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ids = Arc::new(IdMapStore::open(&db).unwrap());
        let resolver = LegacyUrlResolver::new(ids.clone(), LinkBuilder::default()).unwrap();
        (resolver, ids)
    }

    #[test]
    fn test_thread_path_redirects() {
        let (resolver, ids) = resolver();
        ids.put("thread", 7u64, 207).unwrap();
        assert_eq!(
            resolver.resolve("/forum/index.php?thread/7-example-title/"),
            Resolution::Redirect("/threads/207/".into())
        );
        assert_eq!(
            resolver.resolve("/thread/7-example-title/"),
            Resolution::Redirect("/threads/207/".into())
        );
    }

    #[test]
    fn test_unmapped_passes_through() {
        let (resolver, ids) = resolver();
        assert_eq!(resolver.resolve("/thread/7-example-title/"), Resolution::PassThrough);
        ids.put_excluded("user", 3u64).unwrap();
        assert_eq!(resolver.resolve("/user/3-jane/"), Resolution::PassThrough);
        assert_eq!(resolver.resolve("/gallery/3-photo/"), Resolution::PassThrough);
        assert_eq!(resolver.resolve("/"), Resolution::PassThrough);
    }

    #[test]
    fn test_post_in_thread_prefers_post() {
        let (resolver, ids) = resolver();
        ids.put("thread", 7u64, 207).unwrap();
        ids.put("post", 99u64, 1099).unwrap();
        assert_eq!(
            resolver.resolve("/index.php?thread/7-title/&postID=99"),
            Resolution::Redirect("/posts/1099/".into())
        );
    }

    #[test]
    fn test_post_miss_falls_back_to_thread() {
        let (resolver, ids) = resolver();
        ids.put("thread", 7u64, 207).unwrap();
        let parser = LegacyUrlParser::new().unwrap();
        assert_eq!(
            parser.parse("/thread/7-title/?postID=99"),
            vec![LegacyUrl::new(LegacyContent::Post, 99)]
        );
        assert_eq!(
            parser.parse("/index.php?page=Thread&threadID=7&postID=99"),
            vec![
                LegacyUrl::new(LegacyContent::Post, 99),
                LegacyUrl::new(LegacyContent::Thread, 7),
            ]
        );
        assert_eq!(
            resolver.resolve("/index.php?page=Thread&threadID=7&postID=99"),
            Resolution::Redirect("/threads/207/".into())
        );
    }

    #[test]
    fn test_board_and_user_links() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ids = Arc::new(IdMapStore::open(&db).unwrap());
        ids.put("forum", 4u64, 14).unwrap();
        ids.put("user", 5u64, 15).unwrap();
        let resolver =
            LegacyUrlResolver::new(ids, LinkBuilder::new("https://forum.example/")).unwrap();
        assert_eq!(
            resolver.resolve("/Board/4-news/"),
            Resolution::Redirect("https://forum.example/forums/14/".into())
        );
        assert_eq!(
            resolver.resolve("/user/5-jane/"),
            Resolution::Redirect("https://forum.example/members/15/".into())
        );
        assert_eq!(
            resolver.resolve("/index.php?page=Board&boardID=4"),
            Resolution::Redirect("https://forum.example/forums/14/".into())
        );
    }

    #[test]
    fn test_query_ids_must_be_positive_integers() {
        let parser = LegacyUrlParser::new().unwrap();
        assert!(parser.parse("/index.php?postID=abc&threadID=0").is_empty());
    }
}

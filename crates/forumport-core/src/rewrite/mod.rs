//! Content rewrite engine.
//!
//! Converts stored source markup into the target BBCode dialect with a fixed
//! pipeline of rules:
//!
//! 1. structural normalisation ([`MetacodeRule`]): component tags to flat
//!    bracket tags,
//! 2. reference rewriting ([`QuoteRule`]): quotes and attachments, resolved
//!    through the translation store when the caller allows it,
//! 3. inline formatting ([`AlignRule`], [`SizeRule`], [`MediaRule`]),
//! 4. symbol substitution ([`EmojiRule`]),
//! 5. paragraph and HTML serialisation ([`ParagraphRule`]).
//!
//! Rules never fail. Anything a rule cannot interpret is left as it was, and
//! every rule matches only source forms it does not emit, so running the
//! pipeline twice gives the same result as running it once.

mod emoji;
mod inline;
mod metacode;
mod paragraph;
mod quote;

pub use emoji::{EmojiImage, EmojiRule};
pub use inline::{size_bucket, Alignment, AlignRule, MediaEmbed, MediaProvider, MediaRule, SizeRule};
pub use metacode::{Metacode, MetacodeRule, Spoiler};
pub use paragraph::{decode_entities, ParagraphRule};
pub use quote::{AttachmentRef, QuoteRef, QuoteRule};

use quote::PENDING_ATTACHMENT;

use regex::{Captures, Regex};
use tracing::warn;

use crate::error::Error;
use crate::idmap::{Lookup, SourceKey, TranslationLookup};

/// Per-call rewrite settings.
#[derive(Clone, Copy)]
pub struct RewriteContext<'a> {
    /// Resolve embedded source ids through the translation store.
    pub update_content_ids: bool,
    lookup: Option<&'a dyn TranslationLookup>,
}

impl<'a> RewriteContext<'a> {
    /// Context resolving references through `lookup` when
    /// `update_content_ids` is set.
    pub fn new(lookup: &'a dyn TranslationLookup, update_content_ids: bool) -> Self {
        Self {
            update_content_ids,
            lookup: Some(lookup),
        }
    }

    /// Context without a store; embedded ids are preserved.
    pub fn detached() -> Self {
        Self {
            update_content_ids: false,
            lookup: None,
        }
    }

    /// How an embedded source id should be rendered.
    pub fn reference(&self, entity_type: &str, source_id: u64) -> Reference {
        let lookup = match self.lookup {
            Some(lookup) if self.update_content_ids => lookup,
            _ => return Reference::Preserved(source_id),
        };
        match lookup.lookup(entity_type, &SourceKey::from(source_id)) {
            Ok(Lookup::Mapped(target)) => Reference::Resolved(target),
            Ok(_) => Reference::Unresolved(source_id),
            Err(err) => {
                warn!(entity_type, source_id, error = %err, "reference lookup failed");
                Reference::Unresolved(source_id)
            }
        }
    }
}

/// Outcome of resolving an embedded id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    /// Ids are not being updated; the source id stays.
    Preserved(u64),
    /// Translated to a target id.
    Resolved(u64),
    /// Resolution was requested but no mapping exists.
    Unresolved(u64),
}

impl Reference {
    /// Id to render, `None` when the reference must degrade.
    pub fn id(self) -> Option<u64> {
        match self {
            Reference::Preserved(id) | Reference::Resolved(id) => Some(id),
            Reference::Unresolved(_) => None,
        }
    }
}

/// One substitution rule of the pipeline.
pub trait Rule: Send + Sync {
    /// Short rule name for diagnostics.
    fn name(&self) -> &'static str;

    /// Rewrite `content`. Must return the input unchanged when nothing applies.
    fn apply(&self, content: &str, ctx: &RewriteContext<'_>) -> String;
}

/// The ordered rule pipeline.
pub struct RewriteEngine {
    rules: Vec<Box<dyn Rule>>,
    pending_attachment: Regex,
}

impl RewriteEngine {
    /// Build the standard pipeline. `full_unicode` enables emoji substitution.
    pub fn new(full_unicode: bool) -> Result<Self, Error> {
        let rules: Vec<Box<dyn Rule>> = vec![
            Box::new(MetacodeRule::new()?),
            Box::new(QuoteRule::new()?),
            Box::new(AlignRule::new()?),
            Box::new(SizeRule::new()?),
            Box::new(MediaRule::new()?),
            Box::new(EmojiRule::new(full_unicode)?),
            Box::new(ParagraphRule::new()?),
        ];
        Self::with_rules(rules)
    }

    /// Build a pipeline from explicit rules.
    pub fn with_rules(rules: Vec<Box<dyn Rule>>) -> Result<Self, Error> {
        Ok(Self {
            rules,
            pending_attachment: Regex::new(PENDING_ATTACHMENT)?,
        })
    }

    /// Names of the rules in pipeline order.
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    /// Run the pipeline over one content string.
    pub fn rewrite(&self, content: &str, ctx: &RewriteContext<'_>) -> String {
        if content.is_empty() {
            return String::new();
        }
        self.rules
            .iter()
            .fold(content.to_string(), |text, rule| rule.apply(&text, ctx))
    }

    /// Point pending references to source attachment `old_id` at `new_id`.
    ///
    /// Used once an attachment is imported, on the already rewritten content
    /// of the post or message that holds it. Only references left unresolved
    /// by the rewrite are touched, so tags that already carry a target id are
    /// never rewritten again and repeating the fix-up changes nothing.
    pub fn rewrite_embedded_attachments(&self, content: &str, old_id: u64, new_id: u64) -> String {
        let old = old_id.to_string();
        self.pending_attachment
            .replace_all(content, |caps: &Captures<'_>| {
                if caps[1] == old {
                    format!("[ATTACH=full]{new_id}[/ATTACH]")
                } else {
                    caps[0].to_string()
                }
            })
            .into_owned()
    }
}

/// Replace tag pairs innermost first.
///
/// Candidates are found by searching `marker` (lowercase) from the end of the
/// content, so a tag's lazily matched body never contains an unprocessed
/// opening tag of the same kind. A candidate the pattern does not match at
/// its own position is left untouched.
pub(crate) fn replace_innermost<F>(content: &str, marker: &str, pattern: &Regex, mut render: F) -> String
where
    F: FnMut(&Captures<'_>) -> String,
{
    // Text left of the current candidate is never modified, so the lowercase
    // copy stays aligned with `out` where it is searched.
    let lower = content.to_ascii_lowercase();
    let mut out = content.to_string();
    let mut limit = content.len();

    while let Some(start) = lower[..limit].rfind(marker) {
        let found = pattern.captures_at(&out, start).and_then(|caps| {
            let whole = caps.get(0)?;
            (whole.start() == start).then(|| (whole.range(), render(&caps)))
        });
        if let Some((range, text)) = found {
            out.replace_range(range, &text);
        }
        limit = start;
    }
    out
}

//! Quote and attachment references.

use regex::{Captures, Regex};
use tracing::warn;

use super::{replace_innermost, RewriteContext, Rule};

/// A quote of a post, from either the HTML or the BBCode form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRef {
    pub author: Option<String>,
    /// Source post id embedded in the quote link.
    pub post_id: Option<u64>,
}

impl QuoteRef {
    /// Opening `[QUOTE]` tag, resolved per `ctx`.
    pub fn opening(&self, ctx: &RewriteContext<'_>) -> String {
        let author = match self.author.as_deref().filter(|a| !a.is_empty()) {
            Some(author) => author,
            None => return "[QUOTE]".to_string(),
        };
        let reference = self.post_id.map(|id| ctx.reference("post", id));
        match reference {
            Some(reference) => match reference.id() {
                Some(id) => format!("[QUOTE=\"{author}, post: {id}\"]"),
                None => {
                    warn!(author, post_id = ?self.post_id, "quoted post not imported, keeping author only");
                    format!("[QUOTE=\"{author}\"]")
                }
            },
            None => format!("[QUOTE=\"{author}\"]"),
        }
    }
}

/// Source attachment reference with an empty body, `[attach=N][/attach]`
/// plus optional alignment and width attributes.
///
/// References that could not be resolved stay in this form, which the
/// translated `[ATTACH=full]N[/ATTACH]` never matches.
pub(crate) const PENDING_ATTACHMENT: &str = r"(?i)\[attach='?(\d+)'?(?:\s?,[^\]\[]*)?\]\s*\[/attach\]";

/// An embedded attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentRef {
    pub attachment_id: u64,
}

impl AttachmentRef {
    /// `[ATTACH=full]` tag, or `None` when resolution was requested but the
    /// attachment has no mapping yet.
    pub fn render(&self, ctx: &RewriteContext<'_>) -> Option<String> {
        ctx.reference("attachment", self.attachment_id)
            .id()
            .map(|id| format!("[ATTACH=full]{id}[/ATTACH]"))
    }
}

/// Rewrites quotes and attachment references.
pub struct QuoteRule {
    html_quote: Regex,
    html_attribute: Regex,
    bbcode_quote: Regex,
    post_link: Regex,
    attachment: Regex,
}

impl QuoteRule {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            html_quote: Regex::new(r"(?si)<woltlab-quote([^>]*)>(.*?)</woltlab-quote>")?,
            html_attribute: Regex::new(r#"(?i)data-(author|link)="([^"]*)""#)?,
            bbcode_quote: Regex::new(r"(?i)\[quote='([^,'\]]+)'(?:,'([^']*)')?\]")?,
            post_link: Regex::new(r"postID=(\d+)")?,
            attachment: Regex::new(PENDING_ATTACHMENT)?,
        })
    }

    fn post_id(&self, link: &str) -> Option<u64> {
        self.post_link
            .captures(link)
            .and_then(|caps| caps[1].parse().ok())
    }

    fn html_quote_ref(&self, attributes: &str) -> QuoteRef {
        let mut quote = QuoteRef {
            author: None,
            post_id: None,
        };
        for caps in self.html_attribute.captures_iter(attributes) {
            match caps[1].to_ascii_lowercase().as_str() {
                "author" => quote.author = Some(caps[2].to_string()),
                _ => quote.post_id = self.post_id(&caps[2]),
            }
        }
        quote
    }
}

impl Rule for QuoteRule {
    fn name(&self) -> &'static str {
        "quote"
    }

    fn apply(&self, content: &str, ctx: &RewriteContext<'_>) -> String {
        let content = replace_innermost(content, "<woltlab-quote", &self.html_quote, |caps| {
            let quote = self.html_quote_ref(&caps[1]);
            format!("{}{}[/QUOTE]", quote.opening(ctx), &caps[2])
        });

        let content = self
            .bbcode_quote
            .replace_all(&content, |caps: &Captures<'_>| {
                QuoteRef {
                    author: Some(caps[1].to_string()),
                    post_id: caps.get(2).and_then(|link| self.post_id(link.as_str())),
                }
                .opening(ctx)
            });

        self.attachment
            .replace_all(&content, |caps: &Captures<'_>| {
                caps[1]
                    .parse()
                    .ok()
                    .and_then(|attachment_id| AttachmentRef { attachment_id }.render(ctx))
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::IdMapStore;
    use pretty_assertions::assert_eq;

    fn store() -> IdMapStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        IdMapStore::open(&db).unwrap()
    }

    #[test]
    fn test_html_quote_forms() {
        let ids = store();
        ids.put("post", 9u64, 90).unwrap();
        let rule = QuoteRule::new().unwrap();
        let ctx = RewriteContext::new(&ids, true);

        assert_eq!(
            rule.apply(
                r#"<woltlab-quote data-author="Jane" data-link="https://x.org/index.php?thread/3/&amp;postID=9#post9">hi</woltlab-quote>"#,
                &ctx
            ),
            "[QUOTE=\"Jane, post: 90\"]hi[/QUOTE]"
        );
        assert_eq!(
            rule.apply(r#"<woltlab-quote data-author="Jane" data-link="">hi</woltlab-quote>"#, &ctx),
            "[QUOTE=\"Jane\"]hi[/QUOTE]"
        );
        assert_eq!(
            rule.apply("<woltlab-quote>hi</woltlab-quote>", &ctx),
            "[QUOTE]hi[/QUOTE]"
        );
    }

    #[test]
    fn test_nested_quotes() {
        let rule = QuoteRule::new().unwrap();
        let out = rule.apply(
            concat!(
                r#"<woltlab-quote data-author="A" data-link="?postID=1">outer "#,
                r#"<woltlab-quote data-author="B" data-link="?postID=2">inner</woltlab-quote>"#,
                "</woltlab-quote>"
            ),
            &RewriteContext::detached(),
        );
        assert_eq!(
            out,
            "[QUOTE=\"A, post: 1\"]outer [QUOTE=\"B, post: 2\"]inner[/QUOTE][/QUOTE]"
        );
    }

    #[test]
    fn test_bbcode_quote_without_link() {
        let rule = QuoteRule::new().unwrap();
        assert_eq!(
            rule.apply("[quote='Jane']x[/quote]", &RewriteContext::detached()),
            "[QUOTE=\"Jane\"]x[/quote]"
        );
    }

    #[test]
    fn test_attachments() {
        let ids = store();
        ids.put("attachment", 4u64, 40).unwrap();
        let rule = QuoteRule::new().unwrap();

        let resolved = rule.apply(
            "[attach=4][/attach] [attach='5',left,'300'][/attach]",
            &RewriteContext::new(&ids, true),
        );
        assert_eq!(resolved, "[ATTACH=full]40[/ATTACH] [attach='5',left,'300'][/attach]");

        let preserved = rule.apply("[attach=4][/attach]", &RewriteContext::new(&ids, false));
        assert_eq!(preserved, "[ATTACH=full]4[/ATTACH]");
    }

    #[test]
    fn test_attachment_bodies_are_kept() {
        let rule = QuoteRule::new().unwrap();
        let ctx = RewriteContext::detached();

        assert_eq!(
            rule.apply("see [attach=1]intro text [attach=2][/attach] end", &ctx),
            "see [attach=1]intro text [ATTACH=full]2[/ATTACH] end"
        );
        assert_eq!(
            rule.apply("[attach=3]my caption[/attach]", &ctx),
            "[attach=3]my caption[/attach]"
        );
        assert_eq!(
            rule.apply("[attach=4] \n[/attach][attach=5,'right'][/attach]", &ctx),
            "[ATTACH=full]4[/ATTACH][ATTACH=full]5[/ATTACH]"
        );
    }
}

//! Paragraph and HTML serialisation.
//!
//! The target has no block paragraphs: paragraphs and `<br>` become line
//! breaks, simple inline HTML becomes BBCode, remaining tags are dropped and
//! entities decoded. Plain BBCode content only has its line endings
//! normalised.

use regex::{Captures, Regex};

use super::{RewriteContext, Rule};

pub struct ParagraphRule {
    html_marker: Regex,
    empty_paragraph: Regex,
    paragraph_break: Regex,
    paragraph_tag: Regex,
    line_break: Regex,
    inline: Regex,
    link: Regex,
    image: Regex,
    any_tag: Regex,
}

impl ParagraphRule {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            html_marker: Regex::new(
                r"(?i)</?(?:p|br|strong|b|em|i|u|s|del|strike|a|img|span|div|ul|ol|li)(?:\s[^>]*)?/?>",
            )?,
            empty_paragraph: Regex::new(r"(?i)<p(?:\s[^>]*)?>\s*(?:<br\s*/?>)?\s*</p>")?,
            paragraph_break: Regex::new(r"(?i)</p>\s*<p(?:\s[^>]*)?>")?,
            paragraph_tag: Regex::new(r"(?i)</?p(?:\s[^>]*)?>")?,
            line_break: Regex::new(r"(?i)<br\s*/?>")?,
            inline: Regex::new(r"(?i)<(/?)(strong|b|em|i|u|s|del|strike)(?:\s[^>]*)?>")?,
            link: Regex::new(r#"(?is)<a\s[^>]*?href="([^"]*)"[^>]*>(.*?)</a>"#)?,
            image: Regex::new(r#"(?i)<img\s[^>]*?src="([^"]*)"[^>]*>"#)?,
            any_tag: Regex::new(r"(?i)</?[a-z][a-z0-9-]*(?:\s[^>]*)?/?>")?,
        })
    }

    fn is_html(&self, content: &str) -> bool {
        self.html_marker.is_match(content)
    }

    fn serialize(&self, content: &str) -> String {
        let text = self.empty_paragraph.replace_all(content, "<p></p>");
        let text = self.paragraph_break.replace_all(&text, "\n");
        let text = self.paragraph_tag.replace_all(&text, "");
        let text = self.line_break.replace_all(&text, "\n");
        let text = self
            .inline
            .replace_all(&text, |caps: &Captures<'_>| {
                let tag = match caps[2].to_ascii_lowercase().as_str() {
                    "strong" | "b" => "B",
                    "em" | "i" => "I",
                    "u" => "U",
                    _ => "S",
                };
                format!("[{}{tag}]", &caps[1])
            });
        let text = self.link.replace_all(&text, "[URL=\"$1\"]$2[/URL]");
        let text = self.image.replace_all(&text, "[IMG]$1[/IMG]");
        let text = self.any_tag.replace_all(&text, "");
        let text = decode_entities(&text);
        text.trim_end_matches('\n').to_string()
    }
}

/// Longest entity name accepted between `&` and `;`.
const MAX_ENTITY_LEN: usize = 10;

/// Decode HTML character references in one pass.
///
/// Unknown or malformed references are kept as written. A `<` that would
/// open a tag stays escaped, so decoded text never reads as HTML again.
pub fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let decoded = tail
            .find(';')
            .filter(|end| *end <= MAX_ENTITY_LEN)
            .and_then(|end| entity_char(&tail[..end]).map(|c| (c, end)))
            .filter(|(c, end)| *c != '<' || !opens_tag(&tail[end + 1..]));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn opens_tag(after: &str) -> bool {
    after
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '/' || c == '!' || c == '?')
}

fn entity_char(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let number = name.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

impl Rule for ParagraphRule {
    fn name(&self) -> &'static str {
        "paragraph"
    }

    fn apply(&self, content: &str, _ctx: &RewriteContext<'_>) -> String {
        let content = content.replace("\r\n", "\n");
        if self.is_html(&content) {
            self.serialize(&content)
        } else {
            content
        }
    }
}

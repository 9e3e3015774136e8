//! Image emoji to Unicode characters.

use regex::{Captures, Regex};

use super::{RewriteContext, Rule};

/// An emoji image whose file name carries the codepoint, e.g. `1f600.png`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmojiImage {
    pub character: char,
}

impl EmojiImage {
    /// Parse a hex codepoint. `None` for values that are not characters.
    pub fn from_hex(hex: &str) -> Option<Self> {
        u32::from_str_radix(hex, 16)
            .ok()
            .and_then(char::from_u32)
            .map(|character| Self { character })
    }
}

/// Replaces emojione images with the character itself.
///
/// Disabled targets cannot store characters outside the basic plane, so the
/// images are kept.
pub struct EmojiRule {
    enabled: bool,
    html: Regex,
    bbcode: Regex,
}

impl EmojiRule {
    pub fn new(enabled: bool) -> Result<Self, regex::Error> {
        Ok(Self {
            enabled,
            html: Regex::new(
                r#"(?i)<img[^>]*?\ssrc="[^"<>]*/emojione/([0-9a-f]{4,5})(?:@2x)?\.png"[^>]*>"#,
            )?,
            bbcode: Regex::new(
                r"(?i)\[img[^\]]*\][^\[\]]*/emojione/([0-9a-f]{4,5})(?:@2x)?\.png\[/img\]",
            )?,
        })
    }

    fn substitute(pattern: &Regex, content: &str) -> String {
        pattern
            .replace_all(content, |caps: &Captures<'_>| match EmojiImage::from_hex(&caps[1]) {
                Some(emoji) => emoji.character.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

impl Rule for EmojiRule {
    fn name(&self) -> &'static str {
        "emoji"
    }

    fn apply(&self, content: &str, _ctx: &RewriteContext<'_>) -> String {
        if !self.enabled || !content.to_ascii_lowercase().contains("/emojione/") {
            return content.to_string();
        }
        let content = Self::substitute(&self.html, content);
        Self::substitute(&self.bbcode, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HTML: &str =
        r#"hi <img src="https://x.org/images/smilies/emojione/1f600@2x.png" alt=":D" class="smiley">"#;

    #[test]
    fn test_html_image_replaced_when_enabled() {
        let rule = EmojiRule::new(true).unwrap();
        assert_eq!(rule.apply(HTML, &RewriteContext::detached()), "hi \u{1F600}");
    }

    #[test]
    fn test_untouched_when_disabled() {
        let rule = EmojiRule::new(false).unwrap();
        assert_eq!(rule.apply(HTML, &RewriteContext::detached()), HTML);
    }

    #[test]
    fn test_bbcode_image() {
        let rule = EmojiRule::new(true).unwrap();
        assert_eq!(
            rule.apply("[img]https://x.org/emojione/2764.png[/img]!", &RewriteContext::detached()),
            "\u{2764}!"
        );
    }

    #[test]
    fn test_invalid_codepoint_kept() {
        assert!(EmojiImage::from_hex("d800").is_none());
        let rule = EmojiRule::new(true).unwrap();
        let input = "[img]https://x.org/emojione/d800.png[/img]";
        assert_eq!(rule.apply(input, &RewriteContext::detached()), input);
    }
}

//! Inline formatting: alignment, font sizes and media embeds.

use regex::{Captures, Regex};
use url::Url;

use super::{replace_innermost, RewriteContext, Rule};

/// Source point sizes and their target size buckets.
const SIZE_STEPS: [(u64, u8); 6] = [(8, 4), (10, 2), (12, 3), (14, 4), (18, 5), (24, 6)];

/// Bucket used for sizes below the smallest step or that cannot be parsed.
const DEFAULT_SIZE_BUCKET: u8 = 4;

/// Target size bucket of a source point size.
///
/// Sizes between two steps round down to the lower step; digit strings too
/// long for a number count as the largest size.
pub fn size_bucket(points: &str) -> u8 {
    let points = points.trim();
    let points = match points.parse::<u64>() {
        Ok(points) => points,
        Err(_) if !points.is_empty() && points.bytes().all(|b| b.is_ascii_digit()) => u64::MAX,
        Err(_) => return DEFAULT_SIZE_BUCKET,
    };
    SIZE_STEPS
        .iter()
        .rev()
        .find(|(step, _)| *step <= points)
        .map(|(_, bucket)| *bucket)
        .unwrap_or(DEFAULT_SIZE_BUCKET)
}

/// Block alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Left,
    Center,
    Right,
}

impl Alignment {
    /// Parse a source alignment. `justify` has no target equivalent and
    /// becomes left.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "left" | "justify" => Some(Alignment::Left),
            "center" => Some(Alignment::Center),
            "right" => Some(Alignment::Right),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Alignment::Left => "LEFT",
            Alignment::Center => "CENTER",
            Alignment::Right => "RIGHT",
        }
    }
}

/// `[align=x]...[/align]` to `[X]...[/X]`.
pub struct AlignRule {
    pattern: Regex,
}

impl AlignRule {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(r"(?si)\[align=(left|center|right|justify)\](.*?)\[/align\]")?,
        })
    }
}

impl Rule for AlignRule {
    fn name(&self) -> &'static str {
        "align"
    }

    fn apply(&self, content: &str, _ctx: &RewriteContext<'_>) -> String {
        replace_innermost(content, "[align=", &self.pattern, |caps| {
            match Alignment::parse(&caps[1]) {
                Some(alignment) => {
                    let tag = alignment.tag();
                    format!("[{tag}]{}[/{tag}]", &caps[2])
                }
                None => caps[0].to_string(),
            }
        })
    }
}

/// `[size=N]` point sizes to `[SIZE=bucket]`.
///
/// Only the lowercase source form is matched; the emitted uppercase tag
/// already holds a bucket.
pub struct SizeRule {
    pattern: Regex,
}

impl SizeRule {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(r"\[size=(\d+)\]")?,
        })
    }
}

impl Rule for SizeRule {
    fn name(&self) -> &'static str {
        "size"
    }

    fn apply(&self, content: &str, _ctx: &RewriteContext<'_>) -> String {
        self.pattern
            .replace_all(content, |caps: &Captures<'_>| {
                format!("[SIZE={}]", size_bucket(&caps[1]))
            })
            .into_owned()
    }
}

/// Known media hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaProvider {
    YouTube,
    Vimeo,
    Dailymotion,
}

impl MediaProvider {
    pub fn tag(self) -> &'static str {
        match self {
            MediaProvider::YouTube => "youtube",
            MediaProvider::Vimeo => "vimeo",
            MediaProvider::Dailymotion => "dailymotion",
        }
    }
}

/// A media link recognised by provider URL shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEmbed {
    pub provider: MediaProvider,
    pub id: String,
}

impl MediaEmbed {
    /// Recognise a provider URL.
    pub fn parse(link: &str) -> Option<Self> {
        let url = Url::parse(link.trim()).ok()?;
        let host = url.host_str()?.to_ascii_lowercase();
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let on = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));

        let (provider, id) = if on("youtu.be") {
            (MediaProvider::YouTube, segments.first()?.to_string())
        } else if on("youtube.com") {
            let id = match segments.as_slice() {
                ["watch", ..] => url
                    .query_pairs()
                    .find(|(key, _)| key == "v")
                    .map(|(_, value)| value.into_owned())?,
                ["embed" | "shorts" | "v", id, ..] => id.to_string(),
                _ => return None,
            };
            (MediaProvider::YouTube, id)
        } else if on("vimeo.com") {
            let id = segments
                .iter()
                .rev()
                .find(|seg| seg.chars().all(|c| c.is_ascii_digit()))?;
            (MediaProvider::Vimeo, id.to_string())
        } else if on("dailymotion.com") {
            match segments.as_slice() {
                ["video", id, ..] => (MediaProvider::Dailymotion, video_slug(id)),
                _ => return None,
            }
        } else if on("dai.ly") {
            (MediaProvider::Dailymotion, video_slug(segments.first()?))
        } else {
            return None;
        };

        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then_some(Self { provider, id })
    }

    pub fn render(&self) -> String {
        format!("[MEDIA={}]{}[/MEDIA]", self.provider.tag(), self.id)
    }
}

/// Dailymotion ids may carry a `_title` suffix.
fn video_slug(segment: &str) -> String {
    segment.split('_').next().unwrap_or(segment).to_string()
}

/// `[media]url[/media]` to `[MEDIA=provider]id[/MEDIA]` for known providers.
pub struct MediaRule {
    pattern: Regex,
}

impl MediaRule {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(r"(?si)\[media\]\s*(.*?)\s*\[/media\]")?,
        })
    }
}

impl Rule for MediaRule {
    fn name(&self) -> &'static str {
        "media"
    }

    fn apply(&self, content: &str, _ctx: &RewriteContext<'_>) -> String {
        self.pattern
            .replace_all(content, |caps: &Captures<'_>| match MediaEmbed::parse(&caps[1]) {
                Some(embed) => embed.render(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

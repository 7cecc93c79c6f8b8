//! Output file naming for downloads.
//!
//! Placeholders are written `{Name}` or `{{ .Name }}`:
//! `DialogID`, `MessageID`, `FileName`, `FileSize`, `MessageDate`,
//! `DownloadDate`, `FileCaption`. Dates render as Unix seconds.

use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

pub const DEFAULT_TEMPLATE: &str = "{DialogID}_{MessageID}_{FileName}";

const MAX_CAPTION_CHARS: usize = 48;

const PLACEHOLDER: &str = r"\{\{\s*\.([A-Za-z]+)\s*\}\}|\{([A-Za-z]+)\}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("output template is empty")]
    Empty,
    #[error("unknown placeholder '{0}' in output template")]
    UnknownPlaceholder(String),
    #[error("placeholder pattern: {0}")]
    Pattern(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    DialogId,
    MessageId,
    FileName,
    FileSize,
    MessageDate,
    DownloadDate,
    FileCaption,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "DialogID" => Field::DialogId,
            "MessageID" => Field::MessageId,
            "FileName" => Field::FileName,
            "FileSize" => Field::FileSize,
            "MessageDate" => Field::MessageDate,
            "DownloadDate" => Field::DownloadDate,
            "FileCaption" => Field::FileCaption,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// Values available to a template.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub dialog_id: i64,
    pub message_id: i32,
    pub file_name: &'a str,
    pub file_size: u64,
    pub message_date: DateTime<Utc>,
    pub download_date: DateTime<Utc>,
    pub caption: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl Default for OutputTemplate {
    fn default() -> Self {
        // The default template only uses known placeholders.
        Self::parse(DEFAULT_TEMPLATE).unwrap_or_else(|_| Self {
            source: DEFAULT_TEMPLATE.to_string(),
            segments: vec![Segment::Field(Field::FileName)],
        })
    }
}

impl OutputTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        if source.trim().is_empty() {
            return Err(TemplateError::Empty);
        }

        let pattern = Regex::new(PLACEHOLDER).map_err(|e| TemplateError::Pattern(e.to_string()))?;
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in pattern.captures_iter(source) {
            let Some(whole) = caps.get(0) else { continue };
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let field =
                Field::parse(name).ok_or_else(|| TemplateError::UnknownPlaceholder(name.into()))?;

            if whole.start() > last {
                segments.push(Segment::Literal(source[last..whole.start()].to_string()));
            }
            segments.push(Segment::Field(field));
            last = whole.end();
        }
        if last < source.len() {
            segments.push(Segment::Literal(source[last..].to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render to a single, sanitized file name.
    pub fn render(&self, ctx: &TemplateContext<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => match field {
                    Field::DialogId => out.push_str(&ctx.dialog_id.to_string()),
                    Field::MessageId => out.push_str(&ctx.message_id.to_string()),
                    Field::FileName => out.push_str(ctx.file_name),
                    Field::FileSize => out.push_str(&ctx.file_size.to_string()),
                    Field::MessageDate => out.push_str(&ctx.message_date.timestamp().to_string()),
                    Field::DownloadDate => {
                        out.push_str(&ctx.download_date.timestamp().to_string())
                    }
                    Field::FileCaption => {
                        let caption: String = ctx
                            .caption
                            .split_whitespace()
                            .collect::<Vec<_>>()
                            .join(" ")
                            .chars()
                            .take(MAX_CAPTION_CHARS)
                            .collect();
                        out.push_str(&caption);
                    }
                },
            }
        }
        sanitize_file_name(&out)
    }
}

/// Replace path separators and control characters so the result is a
/// single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim();

    match trimmed {
        "" | "." | ".." => "_".to_string(),
        _ => trimmed.to_string(),
    }
}

/// Swap the extension of `name` for the canonical one of `mime_type`.
///
/// Leaves the name alone when the MIME type is unknown or the current
/// extension is already a valid one for it.
pub fn rewrite_extension(name: &str, mime_type: &str) -> String {
    const PREFERRED: &[&str] = &[
        "jpg", "png", "gif", "webp", "mp4", "webm", "mov", "mp3", "ogg", "m4a", "pdf", "txt",
        "zip",
    ];

    let Some(candidates) = mime_guess::get_mime_extensions_str(mime_type) else {
        return name.to_string();
    };
    let path = Path::new(name);
    let current = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase());

    if current
        .as_deref()
        .is_some_and(|ext| candidates.contains(&ext))
    {
        return name.to_string();
    }

    let Some(ext) = PREFERRED
        .iter()
        .find(|p| candidates.contains(*p))
        .or_else(|| candidates.first())
    else {
        return name.to_string();
    };

    let stem = match current {
        Some(_) => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        None => name.to_string(),
    };
    format!("{stem}.{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx<'a>(name: &'a str, caption: &'a str) -> TemplateContext<'a> {
        TemplateContext {
            dialog_id: 1001,
            message_id: 42,
            file_name: name,
            file_size: 2048,
            message_date: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            download_date: Utc.timestamp_opt(1_700_000_500, 0).unwrap(),
            caption,
        }
    }

    #[test]
    fn default_template() {
        let tpl = OutputTemplate::default();
        assert_eq!(tpl.render(&ctx("a.jpg", "")), "1001_42_a.jpg");
    }

    #[test]
    fn both_placeholder_styles_are_accepted() {
        let tpl = OutputTemplate::parse("{{ .MessageDate }}-{FileSize}-{{.FileName}}").unwrap();
        assert_eq!(tpl.render(&ctx("a.jpg", "")), "1700000000-2048-a.jpg");
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        assert_eq!(
            OutputTemplate::parse("{Nope}").unwrap_err(),
            TemplateError::UnknownPlaceholder("Nope".into())
        );
        assert_eq!(OutputTemplate::parse("  ").unwrap_err(), TemplateError::Empty);
    }

    #[test]
    fn rendered_names_stay_in_one_directory() {
        let tpl = OutputTemplate::parse("{FileCaption}_{FileName}").unwrap();
        let name = tpl.render(&ctx("../../etc/passwd", "line one\nline/two"));
        assert!(!name.contains('/'));
        assert!(name.starts_with("line one line_two_"));
    }

    #[test]
    fn extension_rewrite() {
        assert_eq!(rewrite_extension("clip.bin", "video/mp4"), "clip.mp4");
        assert_eq!(rewrite_extension("photo", "image/png"), "photo.png");
        assert_eq!(rewrite_extension("photo.jpeg", "image/jpeg"), "photo.jpeg");
        assert_eq!(rewrite_extension("data.xyz", "application/x-unknown-thing"), "data.xyz");
    }
}

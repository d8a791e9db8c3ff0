//! Naming templates: literal text mixed with `%placeholder%` tokens.
//!
//! Parsing turns the template into a list of segments once; resolving then
//! substitutes values from a [`ResolveContext`] without touching the
//! filesystem or reading the clock, so the same inputs always produce the same
//! name.

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{SaveError, SaveResult};
use crate::provenance::{short_model_name, ProvenanceContext};

pub const DEFAULT_COUNTER_WIDTH: usize = 4;
pub const MAX_COUNTER_WIDTH: usize = 10;
pub const DEFAULT_PROMPT_HASH_LEN: usize = 8;
pub const MAX_COMPONENT_LEN: usize = 255;
/// Longest value a single placeholder may expand to.
pub const MAX_VALUE_LEN: usize = 100;

const DELIMITER: char = '%';
const ILLEGAL_LITERAL_CHARS: &[char] = &['<', '>', ':', '"', '\\', '|', '?', '*'];
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];
const DATE_TOKENS: &[&str] = &["yyyy", "yy", "MM", "dd", "hh", "mm", "ss"];

/// One kind of substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// `%date%` or `%date:<pattern>%`.
    Date(Option<String>),
    /// `%time%`
    Time,
    /// `%seed%`
    Seed,
    /// `%prompt_hash%` or `%prompt_hash:<len>%`.
    PromptHash(Option<usize>),
    /// `%counter%` or `%counter:<width>%`.
    Counter(Option<usize>),
    /// `%model%`
    Model,
    /// Any other `%key%`, looked up in the provenance context.
    Context(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// Everything a template needs to resolve besides the counter.
#[derive(Debug, Clone)]
pub struct ResolveContext<'a> {
    pub provenance: &'a ProvenanceContext,
    /// Capture time of the request; `%date%`/`%time%` never read the clock.
    pub timestamp: NaiveDateTime,
    pub counter_width: usize,
    pub prompt_hash_len: usize,
}

impl<'a> ResolveContext<'a> {
    pub fn new(provenance: &'a ProvenanceContext, timestamp: NaiveDateTime) -> Self {
        Self {
            provenance,
            timestamp,
            counter_width: DEFAULT_COUNTER_WIDTH,
            prompt_hash_len: DEFAULT_PROMPT_HASH_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> SaveResult<Self> {
        if source.trim().is_empty() {
            return Err(SaveError::invalid_template(source, "template is empty"));
        }
        if source.starts_with('/') {
            return Err(SaveError::invalid_template(
                source,
                "template must be relative to the destination root",
            ));
        }

        let mut segments = Vec::new();
        let mut rest = source;
        while !rest.is_empty() {
            match rest.find(DELIMITER) {
                None => {
                    segments.push(Segment::Literal(check_literal(source, rest)?));
                    break;
                }
                Some(start) => {
                    if start > 0 {
                        segments.push(Segment::Literal(check_literal(source, &rest[..start])?));
                    }
                    let after = &rest[start + 1..];
                    let end = after.find(DELIMITER).ok_or_else(|| {
                        SaveError::invalid_template(source, "unterminated placeholder")
                    })?;
                    let placeholder = parse_placeholder(source, &after[..end])?;
                    segments.push(Segment::Placeholder(placeholder));
                    rest = &after[end + 1..];
                }
            }
        }

        let template = Self {
            source: source.to_string(),
            segments,
        };
        template.check_counter_position()?;
        Ok(template)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn has_counter(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Placeholder(Placeholder::Counter(_))))
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(p) => Some(p),
            Segment::Literal(_) => None,
        })
    }

    /// The counter may only appear in the file name, so every probe of one
    /// request lands in the same directory.
    fn check_counter_position(&self) -> SaveResult<()> {
        let mut seen_counter = false;
        for segment in &self.segments {
            match segment {
                Segment::Placeholder(Placeholder::Counter(_)) => seen_counter = true,
                Segment::Literal(text) if seen_counter && text.contains('/') => {
                    return Err(SaveError::invalid_template(
                        &self.source,
                        "%counter% may only appear in the file name, not in a directory",
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Substitutes every placeholder and validates the resulting relative
    /// path.
    pub fn resolve(&self, ctx: &ResolveContext<'_>, counter: u32) -> SaveResult<String> {
        let mut out = String::with_capacity(self.source.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(p) => out.push_str(&self.resolve_placeholder(p, ctx, counter)?),
            }
        }
        self.check_resolved(&out)?;
        Ok(out)
    }

    fn resolve_placeholder(
        &self,
        placeholder: &Placeholder,
        ctx: &ResolveContext<'_>,
        counter: u32,
    ) -> SaveResult<String> {
        let value = match placeholder {
            Placeholder::Date(pattern) => {
                format_date(pattern.as_deref().unwrap_or("yyyy-MM-dd"), &ctx.timestamp)
            }
            Placeholder::Time => format_date("hh-mm-ss", &ctx.timestamp),
            Placeholder::Seed => {
                let seed = ctx.provenance.seed().ok_or_else(|| {
                    SaveError::invalid_template(&self.source, "%seed% used but no seed in context")
                })?;
                sanitize_component(&self.scalar(placeholder, seed)?, MAX_VALUE_LEN)
            }
            Placeholder::PromptHash(len) => {
                let len = len.unwrap_or(ctx.prompt_hash_len).clamp(1, 64);
                let prompt = ctx.provenance.prompt().unwrap_or_default();
                let mut hex = faster_hex::hex_string(&Sha256::digest(prompt.as_bytes()));
                hex.truncate(len);
                hex
            }
            Placeholder::Counter(width) => {
                let width = width.unwrap_or(ctx.counter_width);
                format!("{:0width$}", counter, width = width)
            }
            Placeholder::Model => {
                let model = ctx.provenance.model().ok_or_else(|| {
                    SaveError::invalid_template(&self.source, "%model% used but no model in context")
                })?;
                sanitize_component(short_model_name(model), MAX_VALUE_LEN)
            }
            Placeholder::Context(key) => {
                let value = ctx
                    .provenance
                    .get(key)
                    .filter(|v| !v.is_null())
                    .ok_or_else(|| {
                        SaveError::invalid_template(
                            &self.source,
                            format!("unknown placeholder %{}%: not present in the context", key),
                        )
                    })?;
                sanitize_component(&self.scalar(placeholder, value)?, MAX_VALUE_LEN)
            }
        };
        Ok(value)
    }

    fn scalar(&self, placeholder: &Placeholder, value: &Value) -> SaveResult<String> {
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(SaveError::invalid_template(
                &self.source,
                format!("{:?} does not resolve to a scalar value", placeholder),
            )),
        }
    }

    fn check_resolved(&self, resolved: &str) -> SaveResult<()> {
        let components: Vec<&str> = resolved.split('/').collect();
        for (i, component) in components.iter().enumerate() {
            let is_file = i == components.len() - 1;
            if component.is_empty() {
                let reason = if is_file {
                    "resolves to an empty file name"
                } else {
                    "contains an empty path segment"
                };
                return Err(SaveError::invalid_template(&self.source, reason));
            }
            if *component == "." || *component == ".." {
                return Err(SaveError::invalid_template(
                    &self.source,
                    "path traversal segments are not allowed",
                ));
            }
            if component.len() > MAX_COMPONENT_LEN {
                return Err(SaveError::invalid_template(
                    &self.source,
                    format!("segment longer than {} bytes", MAX_COMPONENT_LEN),
                ));
            }
            if component.trim().is_empty() {
                return Err(SaveError::invalid_template(&self.source, "blank path segment"));
            }
            let stem = component.split('.').next().unwrap_or_default().to_uppercase();
            if RESERVED_NAMES.contains(&stem.as_str()) {
                return Err(SaveError::invalid_template(
                    &self.source,
                    format!("'{}' is a reserved device name", component),
                ));
            }
            if is_file && component.starts_with('.') {
                return Err(SaveError::invalid_template(
                    &self.source,
                    "file names starting with '.' are reserved",
                ));
            }
        }
        Ok(())
    }
}

/// Parses and resolves in one go.
pub fn resolve(template: &str, ctx: &ResolveContext<'_>, counter: u32) -> SaveResult<String> {
    Template::parse(template)?.resolve(ctx, counter)
}

fn check_literal(template: &str, literal: &str) -> SaveResult<String> {
    if let Some(c) = literal
        .chars()
        .find(|c| ILLEGAL_LITERAL_CHARS.contains(c) || c.is_control())
    {
        return Err(SaveError::invalid_template(
            template,
            format!("illegal character {:?} in literal text", c),
        ));
    }
    Ok(literal.to_string())
}

fn parse_placeholder(template: &str, body: &str) -> SaveResult<Placeholder> {
    if body.is_empty() {
        return Err(SaveError::invalid_template(template, "empty placeholder '%%'"));
    }
    let (name, arg) = match body.split_once(':') {
        Some((name, arg)) => (name, Some(arg)),
        None => (body, None),
    };

    let parse_width = |arg: &str, max: usize| -> SaveResult<usize> {
        arg.parse::<usize>()
            .ok()
            .filter(|w| (1..=max).contains(w))
            .ok_or_else(|| {
                SaveError::invalid_template(
                    template,
                    format!("%{}% expects a number between 1 and {}", body, max),
                )
            })
    };

    let placeholder = match (name, arg) {
        ("date", None) => Placeholder::Date(None),
        ("date", Some(pattern)) => {
            check_date_pattern(template, pattern)?;
            Placeholder::Date(Some(pattern.to_string()))
        }
        ("time", None) => Placeholder::Time,
        ("seed", None) => Placeholder::Seed,
        ("prompt_hash", None) => Placeholder::PromptHash(None),
        ("prompt_hash", Some(len)) => Placeholder::PromptHash(Some(parse_width(len, 64)?)),
        ("counter", None) => Placeholder::Counter(None),
        ("counter", Some(width)) => Placeholder::Counter(Some(parse_width(width, MAX_COUNTER_WIDTH)?)),
        ("model", None) => Placeholder::Model,
        (key, None) if is_context_key(key) => Placeholder::Context(key.to_string()),
        _ => {
            return Err(SaveError::invalid_template(
                template,
                format!("unknown placeholder %{}%", body),
            ))
        }
    };
    Ok(placeholder)
}

fn is_context_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn check_date_pattern(template: &str, pattern: &str) -> SaveResult<()> {
    if pattern.is_empty() {
        return Err(SaveError::invalid_template(template, "empty date pattern"));
    }
    let mut rest = pattern;
    let mut has_token = false;
    while !rest.is_empty() {
        if let Some(token) = DATE_TOKENS.iter().find(|t| rest.starts_with(**t)) {
            has_token = true;
            rest = &rest[token.len()..];
            continue;
        }
        let c = rest.chars().next().unwrap_or_default();
        if !(c == '-' || c == '_' || c == '.' || c == ' ') {
            return Err(SaveError::invalid_template(
                template,
                format!("date pattern may not contain {:?}", c),
            ));
        }
        rest = &rest[c.len_utf8()..];
    }
    if !has_token {
        return Err(SaveError::invalid_template(
            template,
            "date pattern has no date or time token",
        ));
    }
    Ok(())
}

/// Expands `yyyy yy MM dd hh mm ss` tokens; everything else is copied.
pub fn format_date(pattern: &str, ts: &NaiveDateTime) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut rest = pattern;
    while !rest.is_empty() {
        let token = DATE_TOKENS.iter().find(|t| rest.starts_with(**t));
        match token {
            Some(&"yyyy") => out.push_str(&format!("{:04}", ts.year())),
            Some(&"yy") => out.push_str(&format!("{:02}", ts.year().rem_euclid(100))),
            Some(&"MM") => out.push_str(&format!("{:02}", ts.month())),
            Some(&"dd") => out.push_str(&format!("{:02}", ts.day())),
            Some(&"hh") => out.push_str(&format!("{:02}", ts.hour())),
            Some(&"mm") => out.push_str(&format!("{:02}", ts.minute())),
            Some(&"ss") => out.push_str(&format!("{:02}", ts.second())),
            _ => {
                let c = rest.chars().next().unwrap_or_default();
                out.push(c);
                rest = &rest[c.len_utf8()..];
                continue;
            }
        }
        rest = &rest[token.map_or(0, |t| t.len())..];
    }
    out
}

/// Turns an arbitrary value into one safe path component.
///
/// Path separators, characters illegal on common filesystems and whitespace
/// become `_`; runs of `_` collapse; leading and trailing `_` and `.` are
/// trimmed. An empty result becomes `untitled`.
pub fn sanitize_component(value: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        let c = if c.is_alphanumeric() || c == '-' || c == '.' {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }

    let mut trimmed: String = out.trim_matches(|c| c == '_' || c == '.').to_string();
    if trimmed.chars().count() > max_len {
        trimmed = trimmed.chars().take(max_len).collect();
        trimmed = trimmed.trim_end_matches(|c| c == '_' || c == '.').to_string();
    }
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed
    }
}

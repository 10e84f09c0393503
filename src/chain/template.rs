// src/chain/template.rs

//! Command templates.
//!
//! A stage's `cmd` is parsed once at config load into a list of segments and
//! rendered per attempt. Placeholders:
//!
//! - `{ref}` / `{ref:<strftime>}`: reference time of the cycle
//! - `{end}` / `{end:<strftime>}`: reference time + chain horizon
//! - `{workdir}`, `{cycle_id}`, `{chain}`, `{stage}`, `{attempt}`
//!
//! `{{` and `}}` produce literal braces.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};

const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Ref(Option<String>),
    End(Option<String>),
    Workdir,
    CycleId,
    Chain,
    Stage,
    Attempt,
}

/// Values substituted into a template for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub cycle_id: &'a str,
    pub chain: &'a str,
    pub stage: &'a str,
    pub reference_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub workdir: &'a Path,
    pub attempt: u32,
}

/// A parsed command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    pub fn parse(source: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut inner = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        inner.push(c);
                    }
                    if !closed {
                        return Err(format!("unclosed placeholder in template '{source}'"));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_placeholder(&inner)?);
                }
                '}' => {
                    return Err(format!("unmatched '}}' in template '{source}'"));
                }
                other => literal.push(other),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// The template as written in the config.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, ctx: &TemplateContext<'_>) -> String {
        let mut out = String::with_capacity(self.source.len() + 32);
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Ref(fmt) => push_time(&mut out, ctx.reference_time, fmt.as_deref()),
                Segment::End(fmt) => push_time(&mut out, ctx.end_time, fmt.as_deref()),
                Segment::Workdir => out.push_str(&ctx.workdir.to_string_lossy()),
                Segment::CycleId => out.push_str(ctx.cycle_id),
                Segment::Chain => out.push_str(ctx.chain),
                Segment::Stage => out.push_str(ctx.stage),
                Segment::Attempt => out.push_str(&ctx.attempt.to_string()),
            }
        }
        out
    }
}

impl FromStr for CommandTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_placeholder(inner: &str) -> Result<Segment, String> {
    let (name, fmt) = match inner.split_once(':') {
        Some((name, fmt)) => (name.trim(), Some(fmt)),
        None => (inner.trim(), None),
    };

    match (name, fmt) {
        ("ref", fmt) => Ok(Segment::Ref(checked_format(fmt)?)),
        ("end", fmt) => Ok(Segment::End(checked_format(fmt)?)),
        ("workdir", None) => Ok(Segment::Workdir),
        ("cycle_id", None) => Ok(Segment::CycleId),
        ("chain", None) => Ok(Segment::Chain),
        ("stage", None) => Ok(Segment::Stage),
        ("attempt", None) => Ok(Segment::Attempt),
        (name, Some(_)) if matches!(name, "workdir" | "cycle_id" | "chain" | "stage" | "attempt") => {
            Err(format!("placeholder '{{{name}}}' does not take a format"))
        }
        (other, _) => Err(format!("unknown placeholder '{{{other}}}'")),
    }
}

/// Reject strftime strings chrono cannot render, so `render` never panics.
fn checked_format(fmt: Option<&str>) -> Result<Option<String>, String> {
    match fmt {
        None => Ok(None),
        Some("") => Err("empty time format in placeholder".to_string()),
        Some(fmt) => {
            if StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error)) {
                return Err(format!("invalid time format '{fmt}'"));
            }
            Ok(Some(fmt.to_string()))
        }
    }
}

fn push_time(out: &mut String, at: DateTime<Utc>, fmt: Option<&str>) {
    use std::fmt::Write;
    let _ = write!(out, "{}", at.format(fmt.unwrap_or(DEFAULT_TIME_FORMAT)));
}

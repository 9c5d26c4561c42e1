//! URL templates with `{Params.x}`, `{Input.x}` and `{Pager.page|size|skip}`
//! placeholders. Dotted paths walk nested objects.

use crate::{Error, Result};
use serde_json::Value;

/// Paging cursor handed to URL templates and query builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pager {
    pub page: u64,
    pub size: u64,
    pub skip: u64,
}

impl Pager {
    pub fn first(size: u64) -> Self {
        Self { page: 1, size, skip: 0 }
    }

    /// Pager for the 1-based `page`.
    pub fn at(page: u64, size: u64) -> Self {
        Self {
            page,
            size,
            skip: size.saturating_mul(page.saturating_sub(1)),
        }
    }
}

/// Everything a single request is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestData {
    pub pager: Pager,
    pub params: Value,
    pub input: Option<Value>,
    /// Cursor extracted from the previous response (sequential paging only).
    pub custom: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Params(Vec<String>),
    Input(Vec<String>),
    Page,
    Size,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl UrlTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| Error::InvalidInput(format!("unclosed placeholder in url template: {template}")))?;
            segments.push(parse_placeholder(&after[..close], template)?);
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn render(&self, req: &RequestData) -> Result<String> {
        let mut out = String::with_capacity(self.raw.len());
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Params(path) => out.push_str(&lookup(&req.params, path, "Params")?),
                Segment::Input(path) => {
                    let input = req
                        .input
                        .as_ref()
                        .ok_or_else(|| Error::InvalidInput(format!("url template {} needs an input", self.raw)))?;
                    out.push_str(&lookup(input, path, "Input")?);
                }
                Segment::Page => out.push_str(&req.pager.page.to_string()),
                Segment::Size => out.push_str(&req.pager.size.to_string()),
                Segment::Skip => out.push_str(&req.pager.skip.to_string()),
            }
        }
        Ok(out)
    }
}

fn parse_placeholder(body: &str, template: &str) -> Result<Segment> {
    let mut parts = body.trim().split('.');
    let root = parts.next().unwrap_or_default();
    let path: Vec<String> = parts.map(str::to_string).collect();
    let bad = || Error::InvalidInput(format!("unknown placeholder {{{body}}} in url template: {template}"));
    match root {
        "Params" if !path.is_empty() => Ok(Segment::Params(path)),
        "Input" if !path.is_empty() => Ok(Segment::Input(path)),
        "Pager" => match path.as_slice() {
            [p] if p == "page" || p == "Page" => Ok(Segment::Page),
            [p] if p == "size" || p == "Size" => Ok(Segment::Size),
            [p] if p == "skip" || p == "Skip" => Ok(Segment::Skip),
            _ => Err(bad()),
        },
        _ => Err(bad()),
    }
}

fn lookup(root: &Value, path: &[String], label: &str) -> Result<String> {
    let mut cur = root;
    for key in path {
        cur = cur
            .get(key.as_str())
            .ok_or_else(|| Error::InvalidInput(format!("{label}.{} is missing", path.join("."))))?;
    }
    match cur {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(Error::InvalidInput(format!(
            "{label}.{} is not a scalar",
            path.join(".")
        ))),
    }
}

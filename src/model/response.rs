//! Parsing of model responses into structured fields.
//!
//! Two layouts are understood: XML-like tags (`<thinking>`, `<tool_call>`,
//! `<conclusion>`) and markdown section headers (`### Thought ###`). Prose
//! around the structured block is tolerated.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Response parsing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseParseError {
    #[error("Model response is empty")]
    Empty,
    #[error("No structured {0} block found in model response")]
    NoStructuredBlock(&'static str),
}

/// `### Header ###` lines, also `## Header ##` and `### Header:`.
static SECTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*#{2,3}[ \t]*([^#\n]+?)[ \t]*(?:#{2,3}|:)?[ \t]*$")
        .expect("valid section regex")
});

static FENCED_JSON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid fenced JSON regex")
});

/// Header aliases, lowercase. English first, then the Chinese forms some models emit.
pub const THOUGHT_HEADERS: &[&str] = &["thought", "thinking", "思考"];
pub const ACTION_HEADERS: &[&str] = &["action", "动作"];
pub const DESCRIPTION_HEADERS: &[&str] = &["description", "conclusion", "描述"];
pub const PLAN_HEADERS: &[&str] = &["plan", "计划"];
pub const COMPLETED_HEADERS: &[&str] = &[
    "completed subgoal",
    "completed subgoals",
    "historical operations",
    "历史操作",
    "已完成子目标",
];
pub const OUTCOME_HEADERS: &[&str] = &["outcome", "结果"];
pub const ERROR_DESCRIPTION_HEADERS: &[&str] = &["error description", "错误描述"];
pub const NOTES_HEADERS: &[&str] = &["important notes", "notes", "重要注意事项"];

/// The three logical fields of an action decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub thinking: String,
    /// Raw action block, fed to the action validator.
    pub action: String,
    pub conclusion: String,
}

/// Extract the first `<tag>...</tag>` body.
pub fn extract_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let body = &text[start..];
    let end = body.find(&close).unwrap_or(body.len());
    Some(body[..end].trim())
}

/// Split text into `(lowercased header, body)` pairs in order of appearance.
pub fn sections(text: &str) -> Vec<(String, String)> {
    let headers: Vec<_> = SECTION_RE.captures_iter(text).collect();
    let mut out = Vec::with_capacity(headers.len());
    for (i, caps) in headers.iter().enumerate() {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        out.push((
            name.as_str().trim().to_lowercase(),
            text[whole.end()..end].trim().to_string(),
        ));
    }
    out
}

/// Body of the first section whose header matches one of `aliases`.
pub fn section(text: &str, aliases: &[&str]) -> Option<String> {
    sections(text)
        .into_iter()
        .find(|(name, _)| aliases.iter().any(|alias| name == alias))
        .map(|(_, body)| body)
}

/// First balanced `{...}` object in `text`, string-literal aware.
pub fn find_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse an action decision from accumulated model text.
pub fn parse_decision(text: &str) -> Result<Decision, ResponseParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ResponseParseError::Empty);
    }

    let delimited = extract_tag(text, "tool_call")
        .map(str::to_string)
        .or_else(|| section(text, ACTION_HEADERS));
    let action = delimited
        .as_deref()
        .and_then(find_json_object)
        .or_else(|| {
            FENCED_JSON_RE
                .captures(text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str())
        })
        .or_else(|| find_json_object(text))
        .ok_or(ResponseParseError::NoStructuredBlock("action"))?
        .to_string();

    let thinking = extract_tag(text, "thinking")
        .or_else(|| extract_tag(text, "think"))
        .map(str::to_string)
        .or_else(|| section(text, THOUGHT_HEADERS))
        .unwrap_or_else(|| {
            let before = text.find(&action).map(|i| &text[..i]).unwrap_or_default();
            before
                .split("<tool_call>")
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()
        });

    let conclusion = extract_tag(text, "conclusion")
        .map(str::to_string)
        .or_else(|| section(text, DESCRIPTION_HEADERS))
        .unwrap_or_default();

    Ok(Decision {
        thinking,
        action,
        conclusion,
    })
}

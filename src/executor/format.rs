//! Rendering helpers for tool traffic and markdown results.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::ser::{Formatter, Serializer};
use serde_json::Value;
use std::io;
use tracing::{info, warn};

const MAX_ARGS_PREVIEW_CHARS: usize = 100;
const MAX_RESULT_PREVIEW_CHARS: usize = 500;

static HTML_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```html\s*\n(.*?)\n```").expect("valid html block pattern"));
static EXCESS_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank line pattern"));

/// Compact JSON with `", "` between entries and `": "` after keys.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

fn spaced<T: Serialize + ?Sized>(value: &T) -> Option<String> {
    let mut out = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut out, SpacedFormatter);
    value.serialize(&mut serializer).ok()?;
    String::from_utf8(out).ok()
}

/// Arguments keep the order the model sent them in. Maps too long to
/// preview are reduced to their key list.
pub fn format_tool_args(args: &Value) -> String {
    let rendered = spaced(args).unwrap_or_else(|| args.to_string());
    match args.as_object() {
        Some(map) if rendered.chars().count() > MAX_ARGS_PREVIEW_CHARS => {
            let keys: Vec<&String> = map.keys().collect();
            format!("`{}`", spaced(&keys).unwrap_or(rendered))
        }
        _ => format!("`{}`", rendered),
    }
}

pub fn format_tool_result(result: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(result) {
        return json_fence(&parsed).unwrap_or_else(|| result.to_string());
    }

    let total = result.chars().count();
    if total > MAX_RESULT_PREVIEW_CHARS {
        let head: String = result.chars().take(MAX_RESULT_PREVIEW_CHARS).collect();
        return format!(
            "```\n{}...\n[Result truncated - {} total characters]\n```",
            head, total
        );
    }
    format!("```\n{}\n```", result)
}

fn json_fence(value: &Value) -> Option<String> {
    match serde_json::to_string_pretty(value) {
        Ok(pretty) => Some(format!("```json\n{}\n```", pretty)),
        Err(e) => {
            warn!("Error formatting result: {}", e);
            None
        }
    }
}

/// First complete HTML document found in a fenced html block, or an empty
/// string when there is none or it looks truncated.
pub fn extract_html_dashboard(text: &str) -> String {
    let Some(captures) = HTML_BLOCK.captures(text) else {
        info!("No HTML code blocks found in response");
        return String::new();
    };
    let html = captures.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
    info!("Found HTML block with {} characters", html.len());

    let lower = html.to_lowercase();
    let has_closing_html = lower.contains("</html>");
    let has_closing_body = lower.contains("</body>");
    if !has_closing_html || !has_closing_body {
        let tail: String = {
            let chars: Vec<char> = html.chars().collect();
            let start = chars.len().saturating_sub(200);
            chars[start..].iter().collect()
        };
        warn!(
            "HTML appears truncated: has_closing_html={}, has_closing_body={}, tail={:?}",
            has_closing_html, has_closing_body, tail
        );
        return String::new();
    }

    if !["<html", "<head", "<body"].iter().all(|tag| lower.contains(tag)) {
        info!("HTML block found but not a complete document, skipping");
        return String::new();
    }

    info!("Complete HTML dashboard found and validated");
    html.to_string()
}

/// Markdown with every fenced html block removed.
pub fn remove_html_blocks(text: &str) -> String {
    let cleaned = HTML_BLOCK.replace_all(text, "");
    collapse_blank_lines(&cleaned).trim().to_string()
}

pub fn collapse_blank_lines(text: &str) -> String {
    EXCESS_BLANK_LINES.replace_all(text, "\n\n").into_owned()
}

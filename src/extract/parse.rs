//! Turning raw LLM output into résumé-shaped JSON.
//!
//! Parsing never looks at the network. It runs on the verbatim content stored
//! in `raw_response.json`, so `reparse` can re-run it after this module
//! changes.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Map;

use crate::{
    prelude::*,
    resume::{LIST_SECTIONS, SECTION_NAMES},
};

use super::ResponseMode;

/// Matches a Markdown code fence wrapped around the whole response.
static CODE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n(.*?)\n?```\s*$")
        .expect("failed to compile regex")
});

/// Parse raw LLM content into a normalized JSON object.
///
/// The result has `snake_case` keys and string (or list-of-string) leaves,
/// but has not been validated yet.
pub fn parse_response(mode: ResponseMode, content: &str) -> Result<Value> {
    let value = match mode {
        ResponseMode::Json => parse_json_content(content)?,
        ResponseMode::Markdown => parse_markdown_sections(content),
    };
    Ok(normalize_response(value))
}

/// Parse JSON content, tolerating a surrounding code fence.
fn parse_json_content(content: &str) -> Result<Value> {
    let body = match CODE_FENCE_RE.captures(content) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()),
        None => content,
    };
    let value = serde_json::from_str::<Value>(body.trim())
        .with_context(|| format!("LLM response is not valid JSON: {:?}", truncate(content)))?;
    if !value.is_object() {
        return Err(anyhow!(
            "LLM response is JSON but not an object: {}",
            truncate(&value.to_string())
        ));
    }
    Ok(value)
}

/// Parse the sectioned Markdown format requested by the `markdown` prompt.
///
/// ```text
/// ### PERSONAL INFORMATION
/// - **Name:** Jane Doe
/// - **Email:** jane@example.com
///
/// ### SKILLS
/// **Technical**
/// - Rust
/// - SQL
/// ```
///
/// Every top-level section is produced, even if empty.
fn parse_markdown_sections(content: &str) -> Value {
    let mut sections = Map::new();
    for name in SECTION_NAMES {
        let empty = if LIST_SECTIONS.contains(name) {
            Value::Array(vec![])
        } else {
            Value::Object(Map::new())
        };
        sections.insert((*name).to_owned(), empty);
    }

    let mut current: Option<String> = None;
    let mut lines: Vec<&str> = vec![];
    let mut flush = |name: Option<String>, lines: &mut Vec<&str>| {
        if let Some(name) = name
            && !lines.is_empty()
        {
            let list = LIST_SECTIONS.contains(&name.as_str());
            let mut entries = parse_section_entries(lines, list);
            let section = if list {
                Value::Array(entries.into_iter().map(Value::Object).collect())
            } else {
                Value::Object(entries.pop().unwrap_or_default())
            };
            sections.insert(name, section);
        }
        lines.clear();
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') {
            flush(current.take(), &mut lines);
            current = Some(section_name_for_header(line.trim_matches('#').trim()));
        } else {
            lines.push(line);
        }
    }
    flush(current.take(), &mut lines);

    Value::Object(sections)
}

/// Map a Markdown header to a section name.
fn section_name_for_header(header: &str) -> String {
    let lower = header.to_lowercase();
    if lower.contains("personal") || lower.contains("contact") {
        "personal_info".to_owned()
    } else if lower.contains("education") {
        "education".to_owned()
    } else if lower.contains("experience") || lower.contains("employment") {
        "experience".to_owned()
    } else if lower.contains("skill") {
        "skills".to_owned()
    } else if lower.contains("project") {
        "projects".to_owned()
    } else {
        normalize_key(header)
    }
}

/// Parse the body of one Markdown section into flat mappings.
///
/// In a list section, a key we've already seen starts the next entry, so
/// two `**Company:**` lines become two positions. Elsewhere, repeated keys are
/// merged.
fn parse_section_entries(lines: &[&str], list: bool) -> Vec<Map<String, Value>> {
    let mut entries = vec![];
    let mut items = Map::new();
    let mut current_key: Option<String> = None;

    for &line in lines {
        if line.starts_with("- **") || line.starts_with("**") {
            let line = line.replacen("- **", "", 1).replace("**", "");
            let (key, value) = line.split_once(':').unwrap_or((&line, ""));
            let key = normalize_key(key);
            if key.is_empty() {
                continue;
            }
            // A key without a value starts a list.
            let value = match value.trim() {
                "" => Value::Array(vec![]),
                text => Value::String(text.to_owned()),
            };
            if list && items.contains_key(&key) {
                entries.push(std::mem::take(&mut items));
                items.insert(key.clone(), value);
            } else {
                insert_merging(&mut items, key.clone(), value);
            }
            current_key = Some(key);
        } else if let Some(item) = line.strip_prefix("- ").or_else(|| line.strip_prefix("• ")) {
            let item = Value::String(item.trim().to_owned());
            match current_key.as_ref().and_then(|k| items.get_mut(k)) {
                Some(Value::Array(list)) => list.push(item),
                _ => push_to_items(&mut items, item),
            }
        } else {
            match current_key.as_ref().and_then(|k| items.get_mut(k)) {
                Some(Value::Array(list)) => list.push(Value::String(line.to_owned())),
                Some(Value::String(text)) => {
                    text.push(' ');
                    text.push_str(line);
                }
                _ => push_to_items(&mut items, Value::String(line.to_owned())),
            }
        }
    }
    if !items.is_empty() || entries.is_empty() {
        entries.push(items);
    }
    entries
}

/// Append to the catch-all `items` list.
fn push_to_items(items: &mut Map<String, Value>, item: Value) {
    let entry = items
        .entry("items")
        .or_insert_with(|| Value::Array(vec![]));
    match entry {
        Value::Array(list) => list.push(item),
        other => *other = Value::Array(vec![other.take(), item]),
    }
}

/// Normalize a raw LLM value to the shape of a `ParsedResume`.
///
/// This is deliberately forgiving about *shape* (a single education object
/// becomes a one-element list, numbers become strings, a bare skills list
/// becomes `{ "items": [...] }`), and never forgiving about *content*: nothing
/// is dropped, and anything we can't coerce is left as-is for the validator to
/// reject with a useful message.
pub fn normalize_response(value: Value) -> Value {
    let Value::Object(obj) = value else {
        return value;
    };

    let mut out = Map::new();
    let mut other_sections = Map::new();
    for (key, value) in obj {
        let key = normalize_key(&key);
        if key == "other_sections" {
            if let Value::Object(extra) = value {
                for (name, section) in extra {
                    insert_merging(
                        &mut other_sections,
                        normalize_key(&name),
                        normalize_section(section),
                    );
                }
            } else {
                insert_merging(&mut out, key, value);
            }
        } else if LIST_SECTIONS.contains(&key.as_str()) {
            let entries = match value {
                Value::Array(entries) => entries,
                Value::Null => vec![],
                single => vec![single],
            };
            let entries = entries.into_iter().map(normalize_section).collect();
            insert_merging(&mut out, key, Value::Array(entries));
        } else if key == "skills" {
            let skills = match value {
                Value::Array(_) => json!({ "items": value }),
                Value::Null => json!({}),
                other => other,
            };
            insert_merging(&mut out, key, normalize_section(skills));
        } else if SECTION_NAMES.contains(&key.as_str()) {
            insert_merging(&mut out, key, normalize_section(value));
        } else {
            insert_merging(&mut other_sections, key, normalize_section(value));
        }
    }
    if !other_sections.is_empty() {
        insert_merging(&mut out, "other_sections".to_owned(), Value::Object(other_sections));
    }
    Value::Object(out)
}

/// Normalize the keys and leaf values of one section entry.
fn normalize_section(value: Value) -> Value {
    let Value::Object(obj) = value else {
        return value;
    };
    let mut out = Map::new();
    for (key, value) in obj {
        insert_merging(&mut out, normalize_key(&key), normalize_field(value));
    }
    Value::Object(out)
}

/// Insert `value` under `key`, merging with anything already there.
///
/// Keys like `Name` and `name` normalize to the same thing, and we don't want
/// either one to silently win.
fn insert_merging(map: &mut Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        Some(existing) => merge_values(existing, value),
        None => {
            map.insert(key, value);
        }
    }
}

/// Merge `new` into `existing`. Objects merge by key, lists concatenate, and
/// two different scalars become a list of both.
fn merge_values(existing: &mut Value, new: Value) {
    if *existing == new {
        return;
    }
    match (existing, new) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, value) in new {
                insert_merging(old, key, value);
            }
        }
        (Value::Array(old), Value::Array(new)) => old.extend(new),
        (Value::Array(old), new) => old.push(new),
        (existing, Value::Array(mut new)) => {
            new.insert(0, existing.take());
            *existing = Value::Array(new);
        }
        (existing, new) => *existing = Value::Array(vec![existing.take(), new]),
    }
}

/// Coerce a field value to a string or a list of strings, where possible.
fn normalize_field(value: Value) -> Value {
    match value {
        Value::Null => Value::String(String::new()),
        Value::Bool(b) => Value::String(b.to_string()),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| match item {
                    Value::Bool(_) | Value::Number(_) | Value::Null => {
                        normalize_field(item)
                    }
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}

/// Convert a field or section name to `snake_case`.
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Shorten long content for error messages.
fn truncate(content: &str) -> String {
    const MAX: usize = 200;
    if content.chars().count() <= MAX {
        content.to_owned()
    } else {
        let mut short = content.chars().take(MAX).collect::<String>();
        short.push('…');
        short
    }
}

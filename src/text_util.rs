use serde_json::Value;

use crate::llm::Summary;

/// Maximum number of characters of file text placed in a model prompt.
pub const PROMPT_TEXT_CHARS: usize = 3000;

/// Prefixes models like to put in front of a keyword line.
const EXPANSION_PREFIXES: &[&str] = &["keywords:", "answer:", "result:"];

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Locate the JSON object in a model response.
///
/// Prefers the body of a fenced code block when one is present, then takes
/// the span from the first `{` to the last `}`.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let mut body = text;
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            body = &after[..end];
        }
    }

    let open = body.find('{')?;
    let close = body.rfind('}')?;
    (close > open).then(|| &body[open..=close])
}

/// Parse a summarize/caption response into a [`Summary`].
///
/// Falls back to the whole response as the summary with no keywords when no
/// usable JSON object is found.
pub fn parse_summary_response(text: &str) -> Summary {
    let parsed = extract_json_block(text)
        .and_then(|block| serde_json::from_str::<Value>(block).ok())
        .filter(Value::is_object);

    let Some(value) = parsed else {
        return Summary {
            summary: text.trim().to_string(),
            keywords: Vec::new(),
        };
    };

    let summary = value
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let keywords = match value.get("keywords") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    Summary { summary, keywords }
}

/// Reduce an expansion response to a single keyword line.
///
/// Strips quotes, keeps the last line with more than one word (models tend
/// to put an explanation first), and removes a leading "keywords:" style
/// label. Returns `None` if nothing usable remains.
pub fn clean_expansion(response: &str) -> Option<String> {
    let trimmed = response.trim().trim_matches(|c| c == '"' || c == '\'');

    let line = trimmed
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.split_whitespace().count() > 1)
        .unwrap_or(trimmed);

    let mut line = line.trim();
    let lower = line.to_ascii_lowercase();
    if let Some(prefix) = EXPANSION_PREFIXES.iter().find(|p| lower.starts_with(*p))
    {
        line = line[prefix.len()..].trim_start();
    }

    let line = line.trim_matches(|c| c == '"' || c == '\'').trim();
    (!line.is_empty()).then(|| line.to_string())
}

/// Lowercased alphanumeric terms of a query, deduplicated in order.
pub fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Words of a file stem, used when an attachment cannot be described.
pub fn stem_words(file_name: &str) -> String {
    let stem = std::path::Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    query_terms(&stem).join(" ")
}

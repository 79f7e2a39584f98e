use crate::error::RenderError;
use crate::request::RequestFacts;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^path\[(\d+)\]$").unwrap());
static DOTTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(params|query|header|body)\.([A-Za-z0-9_\-\.]+)$").unwrap());

/// Resolves `{{...}}` placeholders in a variant body against the request.
///
/// Supported: `{{path[N]}}`, `{{params.NAME}}`, `{{query.NAME}}`, `{{header.NAME}}`,
/// `{{body.some.field}}`. Values that are absent render as `null`.
pub fn resolve_template(template: &str, facts: &RequestFacts) -> Result<String, RenderError> {
    if !template.contains("{{") {
        return Ok(template.to_string());
    }

    let segments = facts.path_segments();
    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        resolved.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(RenderError::UnterminatedPlaceholder(offset + start));
        };
        let expr = after[..end].trim();
        resolved.push_str(&resolve_placeholder(expr, &segments, facts)?);

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    resolved.push_str(rest);
    Ok(resolved)
}

fn resolve_placeholder(
    expr: &str,
    segments: &[&str],
    facts: &RequestFacts,
) -> Result<String, RenderError> {
    if let Some(caps) = PATH_RE.captures(expr) {
        let index: usize = caps[1].parse().unwrap_or(usize::MAX);
        return Ok(segments.get(index).copied().unwrap_or("null").to_string());
    }

    let Some(caps) = DOTTED_RE.captures(expr) else {
        return Err(RenderError::UnknownPlaceholder(expr.to_string()));
    };
    let key = &caps[2];
    let value = match &caps[1] {
        "params" => facts.params.get(key).cloned(),
        "query" => facts.query.get(key).cloned(),
        "header" => facts.headers.get(&key.to_ascii_lowercase()).cloned(),
        _ => facts
            .json
            .as_ref()
            .and_then(|body| get_value_by_path(body, key))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
    };
    Ok(value.unwrap_or_else(|| "null".to_string()))
}

fn get_value_by_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = body;
    for part in path.split('.') {
        current = match current {
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            other => other.get(part)?,
        };
    }
    Some(current)
}

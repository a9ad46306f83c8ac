//! `{{root.path}}` variable references.
//!
//! A reference names a root (a step id, a named output variable, `input` or
//! an item variable) followed by an optional dotted path into the value.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::fmt;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_\-]*)((?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
        .expect("reference pattern is valid")
});

/// Roots that never name a step
pub const RESERVED_ROOTS: &[&str] = &["input", "item", "index"];

/// Whether `root` is resolved from scope rather than from a step
#[must_use]
pub fn is_reserved_root(root: &str) -> bool {
    RESERVED_ROOTS.contains(&root)
}

/// A parsed `{{root.a.b}}` token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// First segment
    pub root: String,
    /// Remaining segments
    pub path: Vec<String>,
}

impl Reference {
    fn from_captures(caps: &Captures<'_>) -> Self {
        let path = caps
            .get(2)
            .map(|m| {
                m.as_str()
                    .split('.')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            root: caps[1].to_string(),
            path,
        }
    }

    /// Dotted form without braces
    #[must_use]
    pub fn dotted(&self) -> String {
        let mut out = self.root.clone();
        for seg in &self.path {
            out.push('.');
            out.push_str(seg);
        }
        out
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{{{}}}}}", self.dotted())
    }
}

/// All references embedded in a string, in order of appearance
#[must_use]
pub fn references_in_str(text: &str) -> Vec<Reference> {
    TOKEN
        .captures_iter(text)
        .map(|caps| Reference::from_captures(&caps))
        .collect()
}

/// All references in every string of a JSON value
#[must_use]
pub fn references_in_value(value: &Value) -> Vec<Reference> {
    let mut out = Vec::new();
    collect_refs(value, &mut out);
    out
}

fn collect_refs(value: &Value, out: &mut Vec<Reference>) {
    match value {
        Value::String(s) => out.extend(references_in_str(s)),
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

/// The reference if `text` is exactly one token (surrounding whitespace allowed)
#[must_use]
pub fn whole_token(text: &str) -> Option<Reference> {
    let trimmed = text.trim();
    let caps = TOKEN.captures(trimmed)?;
    let m = caps.get(0)?;
    if m.start() == 0 && m.end() == trimmed.len() {
        Some(Reference::from_captures(&caps))
    } else {
        None
    }
}

/// Replace every token rooted at `from` with the same path rooted at `to`.
///
/// `to` may itself be dotted (`step1.emails`). Returns `None` when nothing
/// matched.
#[must_use]
pub fn rewrite_root_in_str(text: &str, from: &str, to: &str) -> Option<String> {
    let mut changed = false;
    let out = TOKEN.replace_all(text, |caps: &Captures<'_>| {
        if &caps[1] == from {
            changed = true;
            let path = caps.get(2).map_or("", |m| m.as_str());
            format!("{{{{{}{}}}}}", to, path)
        } else {
            caps[0].to_string()
        }
    });
    changed.then(|| out.into_owned())
}

/// Replace every token with the text `render` returns for it
pub fn replace_references(text: &str, mut render: impl FnMut(&Reference) -> String) -> String {
    TOKEN
        .replace_all(text, |caps: &Captures<'_>| render(&Reference::from_captures(caps)))
        .into_owned()
}

/// [`rewrite_root_in_str`] applied to every string of a JSON value
pub fn rewrite_root_in_value(value: &mut Value, from: &str, to: &str) -> bool {
    match value {
        Value::String(s) => match rewrite_root_in_str(s, from, to) {
            Some(new) => {
                *s = new;
                true
            }
            None => false,
        },
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |acc, v| rewrite_root_in_value(v, from, to) || acc),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |acc, v| rewrite_root_in_value(v, from, to) || acc),
        _ => false,
    }
}

/// Strip surrounding `{{ }}` from a field expression, if present
#[must_use]
pub fn strip_braces(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map_or(trimmed, str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_references_in_str() {
        let refs = references_in_str("Hi {{input.name}}, see {{ step1.items.0 }} and {{x}}");
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].root, "input");
        assert_eq!(refs[0].path, vec!["name"]);
        assert_eq!(refs[1].dotted(), "step1.items.0");
        assert!(refs[2].path.is_empty());
    }

    #[test]
    fn test_whole_token() {
        assert_eq!(whole_token(" {{step2}} ").map(|r| r.root), Some("step2".to_string()));
        assert!(whole_token("total: {{step2}}").is_none());
        assert!(whole_token("{{a}}{{b}}").is_none());
        assert!(whole_token("plain").is_none());
    }

    #[test]
    fn test_rewrite_root_keeps_path() {
        let out = rewrite_root_in_str("{{step2.subject}} / {{step20}}", "step2", "step1.emails");
        assert_eq!(out.as_deref(), Some("{{step1.emails.subject}} / {{step20}}"));
        assert!(rewrite_root_in_str("{{step3}}", "step2", "step1").is_none());
    }

    #[test]
    fn test_rewrite_root_in_value() {
        let mut value = json!({"a": ["{{old.x}}", {"b": "{{old}}"}], "c": 3});
        assert!(rewrite_root_in_value(&mut value, "old", "new"));
        assert_eq!(value, json!({"a": ["{{new.x}}", {"b": "{{new}}"}], "c": 3}));
        assert!(!rewrite_root_in_value(&mut value, "old", "new"));
    }

    #[test]
    fn test_replace_references() {
        let out = replace_references("{{a.b}} and {{ c }}", |r| r.dotted().to_uppercase());
        assert_eq!(out, "A.B and C");
    }

    #[test]
    fn test_reference_display() {
        let r = whole_token("{{step1.a.b}}").unwrap();
        assert_eq!(r.to_string(), "{{step1.a.b}}");
        assert_eq!(strip_braces(" {{ step1.a }} "), "step1.a");
        assert_eq!(strip_braces("subject"), "subject");
    }

    #[test]
    fn test_reserved_roots() {
        assert!(is_reserved_root("input"));
        assert!(is_reserved_root("item"));
        assert!(!is_reserved_root("step1"));
    }
}

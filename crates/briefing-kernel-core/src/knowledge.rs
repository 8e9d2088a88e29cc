use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::Date;

pub const DEFAULT_KNOWLEDGE_MARKER: &str = "## Self-Annealing Learnings";

const KEY_PREFIX: &str = "<!-- learning:";
const KEY_SUFFIX: &str = " -->";
const KEY_HEX_LEN: usize = 12;

/// One line of operational knowledge produced by a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Learning {
    pub text: String,
    /// Source pattern; keyed learnings are appended at most once per day.
    #[serde(default)]
    pub pattern_id: Option<String>,
}

impl Learning {
    #[must_use]
    pub fn keyed(pattern_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { text: text.into(), pattern_id: Some(pattern_id.into()) }
    }

    #[must_use]
    pub fn unkeyed(text: impl Into<String>) -> Self {
        Self { text: text.into(), pattern_id: None }
    }

    #[must_use]
    pub fn idempotency_key(&self, date: Date) -> Option<String> {
        let pattern_id = self.pattern_id.as_deref()?;
        let mut hasher = Sha256::new();
        hasher.update(date.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(pattern_id.as_bytes());
        let mut key = hex::encode(hasher.finalize());
        key.truncate(KEY_HEX_LEN);
        Some(key)
    }
}

#[must_use]
pub fn render_learning(date: Date, learning: &Learning) -> String {
    let text = learning.text.split_whitespace().collect::<Vec<_>>().join(" ");
    match learning.idempotency_key(date) {
        Some(key) => format!("- [{date}] {text} {KEY_PREFIX}{key}{KEY_SUFFIX}"),
        None => format!("- [{date}] {text}"),
    }
}

/// Keys of every keyed learning already present in `document`.
#[must_use]
pub fn existing_learning_keys(document: &str) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    let mut rest = document;
    while let Some(start) = rest.find(KEY_PREFIX) {
        rest = &rest[start + KEY_PREFIX.len()..];
        let Some(end) = rest.find(KEY_SUFFIX) else {
            break;
        };
        let key = rest[..end].trim();
        if !key.is_empty() {
            keys.insert(key.to_string());
        }
        rest = &rest[end..];
    }
    keys
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeAppend {
    pub document: String,
    pub appended: usize,
    pub skipped: usize,
}

/// Insert dated bullet lines under `marker`.
///
/// With the marker present, lines go in front of the first blank line that
/// follows it, or at the end of the document when there is none. Existing
/// lines are never reordered and no blank lines are added. Without the
/// marker, the section is created at the end of the document.
#[must_use]
pub fn append_learnings(
    document: &str,
    marker: &str,
    date: Date,
    learnings: &[Learning],
) -> KnowledgeAppend {
    let mut seen = existing_learning_keys(document);
    let mut rendered = Vec::new();
    let mut skipped = 0;
    for learning in learnings {
        if learning.text.trim().is_empty() {
            skipped += 1;
            continue;
        }
        if let Some(key) = learning.idempotency_key(date) {
            if !seen.insert(key) {
                skipped += 1;
                continue;
            }
        }
        rendered.push(render_learning(date, learning));
    }

    if rendered.is_empty() {
        return KnowledgeAppend { document: document.to_string(), appended: 0, skipped };
    }

    let marker = marker.trim();
    let lines = document.lines().collect::<Vec<_>>();
    let Some(marker_index) = lines.iter().position(|line| line.trim() == marker) else {
        let mut out = document.to_string();
        if !out.is_empty() {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        }
        out.push_str(marker);
        out.push('\n');
        for line in &rendered {
            out.push_str(line);
            out.push('\n');
        }
        return KnowledgeAppend { document: out, appended: rendered.len(), skipped };
    };

    let insert_at = lines[marker_index + 1..]
        .iter()
        .position(|line| line.trim().is_empty())
        .map_or(lines.len(), |offset| marker_index + 1 + offset);

    let mut out_lines: Vec<&str> = Vec::with_capacity(lines.len() + rendered.len());
    out_lines.extend_from_slice(&lines[..insert_at]);
    out_lines.extend(rendered.iter().map(String::as_str));
    out_lines.extend_from_slice(&lines[insert_at..]);

    let mut out = out_lines.join("\n");
    out.push('\n');
    KnowledgeAppend { document: out, appended: rendered.len(), skipped }
}

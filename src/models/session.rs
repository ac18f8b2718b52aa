//! Tracked activity sessions and the label syntax used to start them.
//!
//! A label such as `"study:math #important #exam"` carries an optional
//! category before the first `:`, free activity text, and `#word` tags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Row id assigned by the store; `None` until saved.
    #[serde(default)]
    pub id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration: Duration,
    pub activity: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Session {
    pub fn new(parsed: ParsedLabel, started_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            started_at,
            stopped_at: None,
            duration: Duration::ZERO,
            activity: parsed.activity,
            category: parsed.category,
            tags: parsed.tags,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.stopped_at.is_some()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.activity.trim().is_empty() {
            return Err("activity cannot be empty".into());
        }
        if let Some(stopped_at) = self.stopped_at {
            if stopped_at < self.started_at {
                return Err("end time cannot be before start time".into());
            }
        }
        Ok(())
    }

    /// `"1h 5m"`, `"42m"`, or `"0m"`.
    pub fn formatted_duration(&self) -> String {
        format_duration(self.duration)
    }

    /// Case-insensitive substring match against any tag.
    pub fn has_tag_matching(&self, query: &str) -> bool {
        let needle = query.to_lowercase();
        self.tags
            .iter()
            .any(|tag| tag.to_lowercase().contains(&needle))
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_minutes = duration.as_secs() / 60;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedLabel {
    pub category: Option<String>,
    pub activity: String,
    pub tags: Vec<String>,
}

/// Splits a label into category, activity text and `#` tags.
pub fn parse_label(label: &str) -> ParsedLabel {
    let (category, rest) = match label.split_once(':') {
        Some((category, rest)) => {
            let category = category.trim();
            let category = (!category.is_empty()).then(|| category.to_string());
            (category, rest)
        }
        None => (None, label),
    };

    let mut words = Vec::new();
    let mut tags = Vec::new();
    for token in rest.split_whitespace() {
        match token.strip_prefix('#') {
            Some(tag) => push_unique(&mut tags, tag),
            None => words.push(token),
        }
    }

    ParsedLabel {
        category,
        activity: words.join(" "),
        tags,
    }
}

/// Parses the free-form tag field: comma or whitespace separated, `#` optional.
pub fn parse_tag_list(input: &str) -> Vec<String> {
    let mut tags = Vec::new();
    for raw in input.split(|c: char| c == ',' || c.is_whitespace()) {
        let trimmed = raw.trim();
        push_unique(&mut tags, trimmed.strip_prefix('#').unwrap_or(trimmed));
    }
    tags
}

pub(crate) fn push_unique(tags: &mut Vec<String>, tag: &str) {
    if !tag.is_empty() && !tags.iter().any(|existing| existing == tag) {
        tags.push(tag.to_string());
    }
}

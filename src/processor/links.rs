use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use super::MessageSummary;

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '>', '"', '\''];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MessageLinks {
    pub message_id: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub urls: Vec<String>,
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\bhttps?://[^\s<>]+").expect("compile url regex"))
}

/// URLs in `text`, in order of first appearance, without duplicates.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    url_pattern()
        .find_iter(text)
        .map(|found| found.as_str().trim_end_matches(TRAILING_PUNCTUATION))
        .filter(|url| url.len() > "http://".len())
        .filter(|url| seen.insert(url.to_string()))
        .map(str::to_string)
        .collect()
}

pub fn links_for_message(summary: &MessageSummary) -> MessageLinks {
    let text = summary
        .body_text
        .as_deref()
        .or(summary.body_preview.as_deref())
        .unwrap_or_default();
    MessageLinks {
        message_id: summary.id.clone(),
        subject: summary.subject.clone(),
        sender: summary.sender_address.clone(),
        urls: extract_urls(text),
    }
}

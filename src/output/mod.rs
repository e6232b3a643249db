pub mod json;
pub mod table;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::processor::{MessageLinks, MessageSummary};
use crate::subscription::{Subscription, TickOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

pub fn format_messages(
    format: OutputFormat,
    messages: &[MessageSummary],
    details: bool,
) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_messages(messages, details)),
        OutputFormat::Json => json::format_messages(messages),
    }
}

pub fn format_message(format: OutputFormat, message: &MessageSummary) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_message(message)),
        OutputFormat::Json => json::format_message(message),
    }
}

pub fn format_new_message(format: OutputFormat, message: &MessageSummary) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_new_message(message)),
        OutputFormat::Json => json::format_new_message(message),
    }
}

pub fn format_links(format: OutputFormat, links: &[MessageLinks]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_links(links)),
        OutputFormat::Json => json::format_links(links),
    }
}

pub fn format_subscription(
    format: OutputFormat,
    subscription: Option<&Subscription>,
    now: DateTime<Utc>,
) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_subscription(subscription, now)),
        OutputFormat::Json => json::format_subscription(subscription),
    }
}

pub fn format_tick(format: OutputFormat, outcome: &TickOutcome, now: DateTime<Utc>) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_tick(outcome, now)),
        OutputFormat::Json => json::format_tick(outcome),
    }
}

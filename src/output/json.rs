use anyhow::Result;
use serde_json::json;

use crate::processor::{MessageLinks, MessageSummary};
use crate::subscription::{Subscription, TickOutcome};

pub fn format_messages(messages: &[MessageSummary]) -> Result<String> {
    Ok(serde_json::to_string_pretty(messages)?)
}

pub fn format_message(message: &MessageSummary) -> Result<String> {
    Ok(serde_json::to_string_pretty(message)?)
}

/// One line per message so a consumer can read the stream incrementally.
pub fn format_new_message(message: &MessageSummary) -> Result<String> {
    Ok(serde_json::to_string(&json!({ "event": "new_email", "message": message }))?)
}

pub fn format_links(links: &[MessageLinks]) -> Result<String> {
    Ok(serde_json::to_string_pretty(links)?)
}

const REDACTED: &str = "[redacted]";

pub fn format_subscription(subscription: Option<&Subscription>) -> Result<String> {
    Ok(serde_json::to_string_pretty(&subscription.map(redact_client_state))?)
}

pub fn format_tick(outcome: &TickOutcome) -> Result<String> {
    let outcome = match outcome {
        TickOutcome::Created(s) => TickOutcome::Created(redact_client_state(s)),
        TickOutcome::Renewed(s) => TickOutcome::Renewed(redact_client_state(s)),
        TickOutcome::Recreated(s) => TickOutcome::Recreated(redact_client_state(s)),
        TickOutcome::Unchanged(s) => TickOutcome::Unchanged(redact_client_state(s)),
        other => other.clone(),
    };
    Ok(serde_json::to_string_pretty(&outcome)?)
}

/// The client state authenticates notifications and never goes to stdout.
fn redact_client_state(subscription: &Subscription) -> Subscription {
    Subscription {
        client_state: REDACTED.to_string(),
        ..subscription.clone()
    }
}

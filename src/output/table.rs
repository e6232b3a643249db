use chrono::{DateTime, Duration, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::processor::{MessageLinks, MessageSummary};
use crate::subscription::{format_expiration, Subscription, TickOutcome};

const FROM_WIDTH: usize = 24;
const SUBJECT_WIDTH: usize = 48;
const DATE_WIDTH: usize = 12;
const FLAGS_WIDTH: usize = 5;
const NEW_MESSAGE_PREVIEW_WIDTH: usize = 100;

pub fn format_messages(messages: &[MessageSummary], details: bool) -> String {
    if messages.is_empty() {
        return "No emails found.".to_string();
    }

    if details {
        let mut out = String::new();
        for (idx, message) in messages.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
                out.push_str(&"-".repeat(80));
                out.push('\n');
            }
            out.push_str(&format_message(message));
        }
        return out;
    }

    let now = Utc::now();
    let mut out = String::new();
    out.push_str(&format!(
        "{:<from$}  {:<subject$}  {:<date$}  {:<flags$}\n",
        "From",
        "Subject",
        "Received",
        "Flags",
        from = FROM_WIDTH,
        subject = SUBJECT_WIDTH,
        date = DATE_WIDTH,
        flags = FLAGS_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}\n",
        "-".repeat(FROM_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(DATE_WIDTH),
        "-".repeat(FLAGS_WIDTH)
    ));

    for message in messages {
        let from = truncate_for_width(sender_label(message), FROM_WIDTH);
        let subject = truncate_for_width(
            message.subject.as_deref().unwrap_or("(no subject)"),
            SUBJECT_WIDTH,
        );
        let date = truncate_for_width(
            &message
                .received_at
                .as_deref()
                .map(|value| relative_date(value, now))
                .unwrap_or_else(|| "-".to_string()),
            DATE_WIDTH,
        );

        out.push_str(&format!(
            "{}  {}  {}  {}\n",
            pad_to_width(&from, FROM_WIDTH),
            pad_to_width(&subject, SUBJECT_WIDTH),
            pad_to_width(&date, DATE_WIDTH),
            flags(message)
        ));
    }

    out
}

pub fn format_message(message: &MessageSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("ID: {}\n", message.id));
    out.push_str(&format!(
        "Subject: {}\n",
        message.subject.as_deref().unwrap_or("(no subject)")
    ));
    out.push_str(&format!(
        "From: {} <{}>\n",
        message.sender_name.as_deref().unwrap_or("(unknown)"),
        message.sender_address.as_deref().unwrap_or("(unknown)")
    ));
    if !message.to_addresses.is_empty() {
        out.push_str(&format!("To: {}\n", message.to_addresses.join(", ")));
    }
    if let Some(received_at) = &message.received_at {
        out.push_str(&format!(
            "Date: {} ({})\n",
            received_at,
            relative_date(received_at, Utc::now())
        ));
    }
    if let Some(is_read) = message.is_read {
        out.push_str(&format!("Read: {}\n", yes_no(is_read)));
    }
    if let Some(has_attachments) = message.has_attachments {
        out.push_str(&format!("Attachments: {}\n", yes_no(has_attachments)));
    }
    if let Some(web_link) = &message.web_link {
        out.push_str(&format!("Link: {web_link}\n"));
    }

    out.push('\n');
    out.push_str("Body\n");
    out.push_str("----\n");

    let body = message
        .body_text
        .as_deref()
        .or(message.body_preview.as_deref())
        .unwrap_or("(empty)");
    out.push_str(body);
    out.push('\n');
    out
}

/// Announcement block printed when the webhook reports a new message.
pub fn format_new_message(message: &MessageSummary) -> String {
    let mut out = String::new();
    out.push_str(&"=".repeat(60));
    out.push('\n');
    out.push_str("NEW EMAIL\n");
    out.push_str(&format!("From: {}\n", sender_label(message)));
    out.push_str(&format!(
        "Subject: {}\n",
        message.subject.as_deref().unwrap_or("(no subject)")
    ));
    if let Some(received_at) = &message.received_at {
        out.push_str(&format!("Received: {received_at}\n"));
    }
    let preview = message
        .body_preview
        .as_deref()
        .or(message.body_text.as_deref())
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    if !preview.is_empty() {
        out.push_str(&format!(
            "Preview: {}\n",
            truncate_for_width(&preview, NEW_MESSAGE_PREVIEW_WIDTH)
        ));
    }
    out.push_str(&"=".repeat(60));
    out
}

pub fn format_links(links: &[MessageLinks]) -> String {
    let with_urls = links
        .iter()
        .filter(|entry| !entry.urls.is_empty())
        .collect::<Vec<_>>();
    if with_urls.is_empty() {
        return "No links found.".to_string();
    }

    let mut out = String::new();
    for (idx, entry) in with_urls.iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        out.push_str(&format!(
            "{} ({})\n",
            truncate_for_width(
                entry.subject.as_deref().unwrap_or("(no subject)"),
                SUBJECT_WIDTH
            ),
            entry.sender.as_deref().unwrap_or("(unknown)")
        ));
        for url in &entry.urls {
            out.push_str(&format!("  {url}\n"));
        }
    }
    out
}

pub fn format_subscription(subscription: Option<&Subscription>, now: DateTime<Utc>) -> String {
    let Some(subscription) = subscription else {
        return "No active subscription.".to_string();
    };

    let mut out = String::new();
    out.push_str(&format!("ID:         {}\n", subscription.id));
    out.push_str(&format!("Resource:   {}\n", subscription.resource));
    if let Some(change_type) = &subscription.change_type {
        out.push_str(&format!("Change:     {change_type}\n"));
    }
    out.push_str(&format!(
        "Expires:    {} ({})\n",
        format_expiration(subscription.expiration),
        format_remaining(subscription.remaining_at(now))
    ));
    out.push_str(&format!("Webhook:    {}\n", subscription.notification_url));
    out
}

pub fn format_tick(outcome: &TickOutcome, now: DateTime<Utc>) -> String {
    match outcome {
        TickOutcome::Failed(detail) | TickOutcome::StorageFailed(detail) => {
            format!("Tick {}: {detail}", outcome.label())
        }
        _ => match outcome.subscription() {
            Some(subscription) => format!(
                "Tick {}\n{}",
                outcome.label(),
                format_subscription(Some(subscription), now)
            ),
            None => format!("Tick {}", outcome.label()),
        },
    }
}

fn sender_label(message: &MessageSummary) -> &str {
    message
        .sender_name
        .as_deref()
        .or(message.sender_address.as_deref())
        .unwrap_or("(unknown)")
}

fn flags(message: &MessageSummary) -> String {
    let mut out = String::new();
    if message.is_read == Some(false) {
        out.push('*');
    }
    if message.has_attachments == Some(true) {
        out.push('@');
    }
    out
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn format_remaining(remaining: Duration) -> String {
    if remaining <= Duration::zero() {
        return "expired".to_string();
    }
    let hours = remaining.num_hours();
    let minutes = remaining.num_minutes() - hours * 60;
    if hours >= 24 {
        format!("in {}d {}h", hours / 24, hours % 24)
    } else if hours > 0 {
        format!("in {hours}h {minutes}m")
    } else {
        format!("in {}m", remaining.num_minutes().max(1))
    }
}

fn relative_date(input: &str, now: DateTime<Utc>) -> String {
    let parsed = match DateTime::parse_from_rfc3339(input) {
        Ok(value) => value.with_timezone(&Utc),
        Err(_) => return input.to_string(),
    };

    let delta = now.signed_duration_since(parsed);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    parsed.format("%Y-%m-%d").to_string()
}

fn pad_to_width(value: &str, width: usize) -> String {
    let used = UnicodeWidthStr::width(value);
    format!("{value}{}", " ".repeat(width.saturating_sub(used)))
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use unicode_width::UnicodeWidthStr;

    use crate::processor::{MessageLinks, MessageSummary};
    use crate::subscription::{Subscription, TickOutcome};

    use super::{
        format_links, format_messages, format_new_message, format_remaining, format_subscription,
        format_tick, relative_date, truncate_for_width,
    };

    fn sample_message() -> MessageSummary {
        MessageSummary {
            id: "msg-1".to_string(),
            subject: Some("A very long subject line that should be truncated in table output because it exceeds width".to_string()),
            sender_name: Some("Sender Name".to_string()),
            sender_address: Some("sender@example.com".to_string()),
            to_addresses: vec!["owner@example.com".to_string()],
            received_at: Some((Utc::now() - Duration::hours(2)).to_rfc3339()),
            body_text: Some("Body".to_string()),
            body_preview: Some("Preview".to_string()),
            is_read: Some(false),
            has_attachments: Some(true),
            web_link: None,
        }
    }

    fn sample_subscription() -> Subscription {
        Subscription {
            id: "sub-1".to_string(),
            resource: "users/a@example.com/mailFolders('Inbox')/messages".to_string(),
            change_type: Some("created".to_string()),
            expiration: Utc.with_ymd_and_hms(2026, 10, 20, 12, 0, 0).unwrap(),
            notification_url: "https://hooks.example.com/webhook".to_string(),
            client_state: "secret".to_string(),
        }
    }

    #[test]
    fn table_message_output_has_headers_and_flags() {
        let rendered = format_messages(&[sample_message()], false);
        assert!(rendered.contains("From"));
        assert!(rendered.contains("Subject"));
        assert!(rendered.contains("2h ago"));
        assert!(rendered.contains("*@"));
        assert!(rendered.contains('…'));
    }

    #[test]
    fn detailed_listing_contains_body() {
        let rendered = format_messages(&[sample_message()], true);
        assert!(rendered.contains("Body\n----\nBody"));
        assert!(rendered.contains("To: owner@example.com"));
    }

    #[test]
    fn new_message_preview_is_truncated() {
        let mut message = sample_message();
        message.body_preview = Some("word ".repeat(60));
        let rendered = format_new_message(&message);
        assert!(rendered.contains("NEW EMAIL"));
        let preview = rendered
            .lines()
            .find_map(|line| line.strip_prefix("Preview: "))
            .expect("preview line");
        assert!(UnicodeWidthStr::width(preview) <= 100);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn links_skip_messages_without_urls() {
        let rendered = format_links(&[
            MessageLinks {
                message_id: "msg-1".to_string(),
                subject: Some("Invoice".to_string()),
                sender: Some("billing@example.com".to_string()),
                urls: vec!["https://pay.example.com".to_string()],
            },
            MessageLinks {
                message_id: "msg-2".to_string(),
                subject: Some("Plain".to_string()),
                sender: None,
                urls: Vec::new(),
            },
        ]);
        assert!(rendered.contains("  https://pay.example.com"));
        assert!(!rendered.contains("Plain"));
        assert_eq!(format_links(&[]), "No links found.");
    }

    #[test]
    fn subscription_shows_remaining_time() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap();
        let rendered = format_subscription(Some(&sample_subscription()), now);
        assert!(rendered.contains("sub-1"));
        assert!(rendered.contains("2026-10-20T12:00:00Z"));
        assert!(rendered.contains("in 2d 2h"));
        assert_eq!(format_subscription(None, now), "No active subscription.");
    }

    #[test]
    fn tick_failures_show_detail() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap();
        assert_eq!(
            format_tick(&TickOutcome::Failed("remote down".to_string()), now),
            "Tick failed: remote down"
        );
        assert!(format_tick(&TickOutcome::Renewed(sample_subscription()), now)
            .starts_with("Tick renewed\nID:"));
    }

    #[test]
    fn remaining_and_relative_dates() {
        assert_eq!(format_remaining(Duration::seconds(-5)), "expired");
        assert_eq!(format_remaining(Duration::minutes(90)), "in 1h 30m");
        assert_eq!(format_remaining(Duration::seconds(20)), "in 1m");

        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        assert_eq!(relative_date("2026-10-18T11:15:00Z", now), "45m ago");
        assert_eq!(relative_date("2026-10-17T11:00:00Z", now), "yesterday");
        assert_eq!(relative_date("not a date", now), "not a date");
    }

    #[test]
    fn truncation_respects_wide_characters() {
        let truncated = truncate_for_width("日本語のテキストです", 7);
        assert!(UnicodeWidthStr::width(truncated.as_str()) <= 7);
        assert!(truncated.ends_with('…'));
    }
}

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::graph::{GraphBody, GraphClient, GraphMessage};
use crate::output::{self, OutputFormat};

pub mod links;

pub use links::{extract_urls, links_for_message, MessageLinks};

const HTML_RENDER_WIDTH: usize = 120;

/// Flattened view of one message for display.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MessageSummary {
    pub id: String,
    pub subject: Option<String>,
    pub sender_name: Option<String>,
    pub sender_address: Option<String>,
    pub to_addresses: Vec<String>,
    pub received_at: Option<String>,
    pub body_text: Option<String>,
    pub body_preview: Option<String>,
    pub is_read: Option<bool>,
    pub has_attachments: Option<bool>,
    pub web_link: Option<String>,
}

impl MessageSummary {
    pub fn from_graph(message: &GraphMessage) -> Self {
        Self {
            id: message.id.clone().unwrap_or_default(),
            subject: message.subject.clone(),
            sender_name: message.sender_name().map(str::to_string),
            sender_address: message.sender_address().map(str::to_string),
            to_addresses: message
                .to_recipients
                .iter()
                .filter_map(|recipient| recipient.address())
                .map(str::to_string)
                .collect(),
            received_at: message.received_date_time.clone(),
            body_text: message.body.as_ref().and_then(body_as_text),
            body_preview: message
                .body_preview
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            is_read: message.is_read,
            has_attachments: message.has_attachments,
            web_link: message.web_link.clone(),
        }
    }
}

/// Plain text of a message body; HTML bodies are rendered to text.
fn body_as_text(body: &GraphBody) -> Option<String> {
    let content = body
        .content
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())?;

    if !body.is_html() {
        return Some(content.to_string());
    }

    let plain = std::panic::catch_unwind(|| {
        html2text::from_read(content.as_bytes(), HTML_RENDER_WIDTH)
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    })
    .unwrap_or_default();
    if plain.is_empty() {
        None
    } else {
        Some(plain)
    }
}

/// Read access to one mailbox.
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn recent_messages(&self, limit: usize) -> Result<Vec<GraphMessage>>;

    async fn message(&self, message_id: &str) -> Result<GraphMessage>;
}

pub struct GraphMailbox {
    graph: Arc<GraphClient>,
    user_email: String,
}

impl GraphMailbox {
    pub fn new(graph: Arc<GraphClient>, user_email: impl Into<String>) -> Self {
        Self {
            graph,
            user_email: user_email.into(),
        }
    }
}

#[async_trait]
impl Mailbox for GraphMailbox {
    async fn recent_messages(&self, limit: usize) -> Result<Vec<GraphMessage>> {
        self.graph.list_inbox(&self.user_email, limit).await
    }

    async fn message(&self, message_id: &str) -> Result<GraphMessage> {
        self.graph.get_message(&self.user_email, message_id).await
    }
}

/// Fetches and reports messages announced by the webhook.
pub struct EmailProcessor {
    mailbox: Arc<dyn Mailbox>,
    format: OutputFormat,
}

impl EmailProcessor {
    pub fn new(mailbox: Arc<dyn Mailbox>, format: OutputFormat) -> Self {
        Self { mailbox, format }
    }

    pub async fn process(&self, message_id: &str) -> Result<MessageSummary> {
        let message = self.mailbox.message(message_id).await?;
        let mut summary = MessageSummary::from_graph(&message);
        if summary.id.is_empty() {
            summary.id = message_id.to_string();
        }
        Ok(summary)
    }

    /// Drains the dispatch queue until every sender is gone. Fetch failures
    /// are logged and skipped.
    pub async fn run(self, mut incoming: mpsc::Receiver<String>) {
        info!("email processor started");
        while let Some(message_id) = incoming.recv().await {
            match self.process(&message_id).await {
                Ok(summary) => {
                    info!(
                        message_id = %summary.id,
                        sender = summary.sender_address.as_deref().unwrap_or("-"),
                        "new email"
                    );
                    match output::format_new_message(self.format, &summary) {
                        Ok(rendered) => println!("{rendered}"),
                        Err(error) => warn!(error = %error, "failed to render new email"),
                    }
                }
                Err(error) => warn!(
                    message_id = %message_id,
                    error = %format!("{error:#}"),
                    "failed to fetch notified message"
                ),
            }
        }
        info!("email processor stopped");
    }
}

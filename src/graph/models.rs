use serde::{Deserialize, Serialize};

pub const MESSAGE_SELECT_FIELDS: &str = concat!(
    "id,subject,from,sender,toRecipients,receivedDateTime,",
    "body,bodyPreview,isRead,hasAttachments,webLink"
);

#[derive(Debug, Clone, Deserialize)]
pub struct GraphMessagesPage {
    pub value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphMessage {
    pub id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<GraphRecipient>,
    pub sender: Option<GraphRecipient>,
    #[serde(rename = "toRecipients", default)]
    pub to_recipients: Vec<GraphRecipient>,
    #[serde(rename = "receivedDateTime")]
    pub received_date_time: Option<String>,
    pub body: Option<GraphBody>,
    #[serde(rename = "bodyPreview")]
    pub body_preview: Option<String>,
    #[serde(rename = "isRead")]
    pub is_read: Option<bool>,
    #[serde(rename = "hasAttachments")]
    pub has_attachments: Option<bool>,
    #[serde(rename = "webLink")]
    pub web_link: Option<String>,
}

impl GraphMessage {
    /// Address the message appears to come from, preferring `sender`.
    pub fn sender_address(&self) -> Option<&str> {
        self.sender
            .as_ref()
            .and_then(GraphRecipient::address)
            .or_else(|| self.from.as_ref().and_then(GraphRecipient::address))
    }

    pub fn sender_name(&self) -> Option<&str> {
        self.sender
            .as_ref()
            .and_then(GraphRecipient::name)
            .or_else(|| self.from.as_ref().and_then(GraphRecipient::name))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    pub email_address: Option<GraphEmailAddress>,
}

impl GraphRecipient {
    pub fn address(&self) -> Option<&str> {
        self.email_address
            .as_ref()
            .and_then(|email| email.address.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.email_address
            .as_ref()
            .and_then(|email| email.name.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphEmailAddress {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphBody {
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    pub content: Option<String>,
}

impl GraphBody {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case("html"))
    }
}

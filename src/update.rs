//! Inbound webhook payloads.
//!
//! The body is decoded as a teloxide [`Update`] and narrowed to the few
//! shapes the dispatcher reacts to.

use teloxide::types::{Message, Update, UpdateKind};

/// What the dispatcher needs to know about one message or channel post.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub message_id: i32,
    pub text: String,
    pub has_media: bool,
    /// Sender's first name in private chats, chat title otherwise.
    pub participant_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(IncomingMessage),
    PreCheckout { query_id: String, payer_id: i64 },
    Other,
}

fn participant_name(msg: &Message) -> String {
    if msg.chat.is_private() {
        msg.from
            .as_ref()
            .map(|user| user.first_name.clone())
            .or_else(|| msg.chat.first_name().map(str::to_string))
            .unwrap_or_default()
    } else {
        msg.chat.title().map(str::to_string).unwrap_or_default()
    }
}

impl From<&Message> for IncomingMessage {
    fn from(msg: &Message) -> Self {
        Self {
            chat_id: msg.chat.id.0,
            message_id: msg.id.0,
            text: msg.text().unwrap_or_default().to_string(),
            has_media: msg.photo().is_some() || msg.video().is_some() || msg.poll().is_some(),
            participant_name: participant_name(msg),
        }
    }
}

impl From<Update> for InboundEvent {
    fn from(update: Update) -> Self {
        match update.kind {
            UpdateKind::PreCheckoutQuery(query) => InboundEvent::PreCheckout {
                query_id: query.id.to_string(),
                payer_id: query.from.id.0 as i64,
            },
            UpdateKind::Message(msg) | UpdateKind::ChannelPost(msg) => {
                InboundEvent::Message(IncomingMessage::from(&msg))
            }
            _ => InboundEvent::Other,
        }
    }
}

impl InboundEvent {
    pub fn from_json(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice::<Update>(body).map(Into::into)
    }
}

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, LabeledPrice, MessageId, ParseMode, ReactionType,
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct InlineButton {
    pub text: String,
    pub url: String,
}

impl InlineButton {
    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    pub title: String,
    pub description: String,
    pub payload: String,
    /// Empty for Telegram Stars.
    pub provider_token: String,
    pub currency: String,
    pub prices: Vec<LabeledPrice>,
}

/// The Bot API calls the relay needs. Every call is addressed by the bot
/// token so a single client serves all configured bots.
#[async_trait]
pub trait TelegramApi: Send + Sync {
    async fn send_message(
        &self,
        token: &str,
        chat_id: i64,
        text: &str,
        keyboard: &[Vec<InlineButton>],
    ) -> Result<()>;

    async fn set_message_reaction(
        &self,
        token: &str,
        chat_id: i64,
        message_id: i32,
        emoji: &str,
    ) -> Result<()>;

    async fn send_invoice(&self, token: &str, chat_id: i64, invoice: &Invoice) -> Result<()>;

    async fn answer_pre_checkout_query(&self, token: &str, query_id: &str, ok: bool)
        -> Result<()>;

    async fn set_webhook(&self, token: &str, url: &str, drop_pending_updates: bool)
        -> Result<()>;
}

/// [`TelegramApi`] backed by teloxide. One HTTP client is shared by every
/// bot; a [`Bot`] handle is cheap to build per call.
pub struct TeloxideApi {
    client: reqwest::Client,
    api_url: reqwest::Url,
}

impl TeloxideApi {
    pub fn new(api_base: &str) -> Result<Self> {
        let api_url: reqwest::Url = api_base
            .parse()
            .with_context(|| format!("Invalid Telegram API URL: {api_base}"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, api_url })
    }

    fn bot(&self, token: &str) -> Bot {
        Bot::with_client(token, self.client.clone()).set_api_url(self.api_url.clone())
    }
}

fn inline_keyboard(rows: &[Vec<InlineButton>]) -> Result<InlineKeyboardMarkup> {
    let mut keyboard = Vec::with_capacity(rows.len());
    for row in rows {
        let mut buttons = Vec::with_capacity(row.len());
        for button in row {
            let url: reqwest::Url = button
                .url
                .parse()
                .with_context(|| format!("Invalid button URL: {}", button.url))?;
            buttons.push(InlineKeyboardButton::url(button.text.clone(), url));
        }
        keyboard.push(buttons);
    }
    Ok(InlineKeyboardMarkup::new(keyboard))
}

#[async_trait]
impl TelegramApi for TeloxideApi {
    async fn send_message(
        &self,
        token: &str,
        chat_id: i64,
        text: &str,
        keyboard: &[Vec<InlineButton>],
    ) -> Result<()> {
        debug!("sendMessage to chat {}", chat_id);
        // Legacy Markdown: welcome templates are written for it
        #[allow(deprecated)]
        let mut request = self
            .bot(token)
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Markdown)
            .disable_notification(true);
        if !keyboard.is_empty() {
            request = request.reply_markup(inline_keyboard(keyboard)?);
        }
        request.await.context("sendMessage failed")?;
        Ok(())
    }

    async fn set_message_reaction(
        &self,
        token: &str,
        chat_id: i64,
        message_id: i32,
        emoji: &str,
    ) -> Result<()> {
        debug!("setMessageReaction on {}/{}", chat_id, message_id);
        self.bot(token)
            .set_message_reaction(ChatId(chat_id), MessageId(message_id))
            .reaction(vec![ReactionType::Emoji {
                emoji: emoji.to_string(),
            }])
            .await
            .context("setMessageReaction failed")?;
        Ok(())
    }

    async fn send_invoice(&self, token: &str, chat_id: i64, invoice: &Invoice) -> Result<()> {
        debug!("sendInvoice to chat {}", chat_id);
        let mut request = self.bot(token).send_invoice(
            ChatId(chat_id),
            invoice.title.clone(),
            invoice.description.clone(),
            invoice.payload.clone(),
            invoice.currency.clone(),
            invoice.prices.clone(),
        );
        if !invoice.provider_token.is_empty() {
            request.provider_token = Some(invoice.provider_token.clone());
        }
        request.await.context("sendInvoice failed")?;
        Ok(())
    }

    async fn answer_pre_checkout_query(
        &self,
        token: &str,
        query_id: &str,
        ok: bool,
    ) -> Result<()> {
        self.bot(token)
            .answer_pre_checkout_query(teloxide::types::PreCheckoutQueryId(query_id.to_string()), ok)
            .await
            .context("answerPreCheckoutQuery failed")?;
        Ok(())
    }

    async fn set_webhook(
        &self,
        token: &str,
        url: &str,
        drop_pending_updates: bool,
    ) -> Result<()> {
        let url: reqwest::Url = url
            .parse()
            .with_context(|| format!("Invalid webhook URL: {url}"))?;
        self.bot(token)
            .set_webhook(url)
            .drop_pending_updates(drop_pending_updates)
            .await
            .context("setWebhook failed")?;
        Ok(())
    }
}

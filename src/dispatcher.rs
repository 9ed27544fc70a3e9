//! Turns one inbound event into the Bot API calls it warrants.
//!
//! Classification is pure apart from the random emoji and delay, so
//! [`Dispatcher::classify`] can be inspected directly; [`Dispatcher::dispatch`]
//! performs the resulting actions. Reactions are sent from a tracked task
//! after a humanizing delay and never hold up the webhook response;
//! [`Dispatcher::shutdown`] drains them.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use teloxide::types::LabeledPrice;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::{BotIdentity, Config, DonationConfig, ReactionsConfig, WelcomeConfig};
use crate::telegram::{InlineButton, Invoice, TelegramApi};
use crate::update::{InboundEvent, IncomingMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SendText {
        chat_id: i64,
        text: String,
        keyboard: Vec<Vec<InlineButton>>,
    },
    React {
        chat_id: i64,
        message_id: i32,
        emoji: String,
    },
    SendInvoice {
        chat_id: i64,
        invoice: Invoice,
    },
    AnswerPreCheckout {
        query_id: String,
        ok: bool,
    },
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::SendText { .. } => "sendMessage",
            Action::React { .. } => "setMessageReaction",
            Action::SendInvoice { .. } => "sendInvoice",
            Action::AnswerPreCheckout { .. } => "answerPreCheckoutQuery",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ignore,
    /// Performed in order; each call is attempted after the previous one
    /// has finished.
    Now(Vec<Action>),
    Delayed { delay: Duration, action: Action },
}

pub struct Dispatcher {
    api: Arc<dyn TelegramApi>,
    reactions: ReactionsConfig,
    welcome: WelcomeConfig,
    donation: DonationConfig,
    pending: TaskTracker,
}

impl Dispatcher {
    pub fn new(config: &Config, api: Arc<dyn TelegramApi>) -> Self {
        Self {
            api,
            reactions: config.reactions.clone(),
            welcome: config.welcome.clone(),
            donation: config.donation.clone(),
            pending: TaskTracker::new(),
        }
    }

    pub fn classify(&self, bot: &BotIdentity, event: &InboundEvent) -> Reply {
        match event {
            InboundEvent::PreCheckout { query_id, payer_id } => Reply::Now(vec![
                Action::AnswerPreCheckout {
                    query_id: query_id.clone(),
                    ok: true,
                },
                Action::SendText {
                    chat_id: *payer_id,
                    text: self.donation.thank_you.clone(),
                    keyboard: Vec::new(),
                },
            ]),
            InboundEvent::Message(msg) => self.classify_message(bot, msg),
            InboundEvent::Other => Reply::Ignore,
        }
    }

    fn classify_message(&self, bot: &BotIdentity, msg: &IncomingMessage) -> Reply {
        let text = msg.text.as_str();

        if is_start_command(text, &bot.username) {
            let body = self
                .welcome
                .template
                .replacen("{name}", &escape_markdown(&msg.participant_name), 1);
            return Reply::Now(vec![Action::SendText {
                chat_id: msg.chat_id,
                text: body,
                keyboard: self.welcome_keyboard(&bot.username),
            }]);
        }

        if text == "/reactions" {
            return Reply::Now(vec![Action::SendText {
                chat_id: msg.chat_id,
                text: format!(
                    "✅ Enabled Reactions : \n\n{}",
                    self.reactions.emojis.join(", ")
                ),
                keyboard: Vec::new(),
            }]);
        }

        if text == "/donate" || text == "/start donate" {
            return Reply::Now(vec![Action::SendInvoice {
                chat_id: msg.chat_id,
                invoice: self.donation_invoice(),
            }]);
        }

        if !text.is_empty() || msg.has_media {
            let mut rng = rand::thread_rng();
            let Some(emoji) = self.reactions.emojis.choose(&mut rng) else {
                return Reply::Ignore;
            };
            let delay = Duration::from_millis(
                rng.gen_range(self.reactions.min_delay_ms..self.reactions.max_delay_ms),
            );
            return Reply::Delayed {
                delay,
                action: Action::React {
                    chat_id: msg.chat_id,
                    message_id: msg.message_id,
                    emoji: emoji.clone(),
                },
            };
        }

        Reply::Ignore
    }

    fn welcome_keyboard(&self, username: &str) -> Vec<Vec<InlineButton>> {
        let handle = username.trim_start_matches('@');
        vec![
            vec![
                InlineButton::url(
                    "➕ Add to Channel ➕",
                    format!("https://t.me/{handle}?startchannel=botstart"),
                ),
                InlineButton::url(
                    "➕ Add to Group ➕",
                    format!("https://t.me/{handle}?startgroup=botstart"),
                ),
            ],
            vec![InlineButton::url(
                "Contact the owner",
                self.welcome.owner_url.clone(),
            )],
            vec![InlineButton::url(
                "💝 Support Us - Donate 🤝",
                self.welcome.donate_url.clone(),
            )],
        ]
    }

    fn donation_invoice(&self) -> Invoice {
        Invoice {
            title: self.donation.title.clone(),
            description: self.donation.description.clone(),
            payload: self.donation.payload.clone(),
            provider_token: self.donation.provider_token.clone(),
            currency: self.donation.currency.clone(),
            prices: vec![LabeledPrice {
                label: self.donation.price_label.clone(),
                amount: self.donation.amount,
            }],
        }
    }

    /// Classify and act. Immediate actions are awaited in order; a delayed
    /// reaction is spawned on the pending tracker and fires on its own.
    pub async fn dispatch(&self, bot: &Arc<BotIdentity>, event: &InboundEvent) {
        match self.classify(bot, event) {
            Reply::Ignore => {
                debug!("@{}: nothing to do for this update", bot.username);
            }
            Reply::Now(actions) => {
                for action in &actions {
                    perform(self.api.as_ref(), bot, action).await;
                }
            }
            Reply::Delayed { delay, action } => {
                debug!(
                    "@{}: scheduling {} in {}ms",
                    bot.username,
                    action.name(),
                    delay.as_millis()
                );
                let api = Arc::clone(&self.api);
                let bot = Arc::clone(bot);
                self.pending.spawn(async move {
                    tokio::time::sleep(delay).await;
                    perform(api.as_ref(), &bot, &action).await;
                });
            }
        }
    }

    /// Stop accepting new reactions and wait for the scheduled ones to fire.
    pub async fn shutdown(&self) {
        self.pending.close();
        if !self.pending.is_empty() {
            info!("Waiting for {} pending reaction(s)", self.pending.len());
        }
        self.pending.wait().await;
    }
}

/// Backslash-escape the characters legacy Markdown treats as markup.
fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '[' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn is_start_command(text: &str, username: &str) -> bool {
    if text == "/start" {
        return true;
    }
    text.strip_prefix("/start@")
        .is_some_and(|handle| handle == username.trim_start_matches('@'))
}

/// Issue one action. Failures are logged and dropped.
async fn perform(api: &dyn TelegramApi, bot: &BotIdentity, action: &Action) {
    let token = bot.token.as_str();
    let result = match action {
        Action::SendText {
            chat_id,
            text,
            keyboard,
        } => api.send_message(token, *chat_id, text, keyboard).await,
        Action::React {
            chat_id,
            message_id,
            emoji,
        } => {
            api.set_message_reaction(token, *chat_id, *message_id, emoji)
                .await
        }
        Action::SendInvoice { chat_id, invoice } => {
            api.send_invoice(token, *chat_id, invoice).await
        }
        Action::AnswerPreCheckout { query_id, ok } => {
            api.answer_pre_checkout_query(token, query_id, *ok).await
        }
    };

    match result {
        Ok(()) => info!("@{}: {} done", bot.username, action.name()),
        Err(e) => error!("@{}: {} failed: {:#}", bot.username, action.name(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::mock::{Call, RecordingApi};

    fn test_config() -> Config {
        let mut config = Config::from_toml("").unwrap();
        config.welcome.template = "Hello *{name}*!".to_string();
        config
    }

    fn bot() -> Arc<BotIdentity> {
        Arc::new(BotIdentity {
            token: "111:secret".to_string(),
            webhook_url: "https://example.com".to_string(),
            username: "ReactBot".to_string(),
        })
    }

    fn message(text: &str) -> InboundEvent {
        InboundEvent::Message(IncomingMessage {
            chat_id: 42,
            message_id: 7,
            text: text.to_string(),
            has_media: false,
            participant_name: "Alice".to_string(),
        })
    }

    fn dispatcher(api: Arc<RecordingApi>) -> Dispatcher {
        Dispatcher::new(&test_config(), api)
    }

    #[test]
    fn test_start_command_variants() {
        assert!(is_start_command("/start", "ReactBot"));
        assert!(is_start_command("/start@ReactBot", "ReactBot"));
        assert!(is_start_command("/start@ReactBot", "@ReactBot"));
        assert!(!is_start_command("/start@OtherBot", "ReactBot"));
        assert!(!is_start_command("/start donate", "ReactBot"));
        assert!(!is_start_command("/starting", "ReactBot"));
    }

    #[test]
    fn test_start_sends_welcome_with_keyboard() {
        let d = dispatcher(Arc::new(RecordingApi::default()));
        for text in ["/start", "/start@ReactBot"] {
            let reply = d.classify(&bot(), &message(text));
            let Reply::Now(actions) = reply else {
                panic!("expected immediate reply for {text}");
            };
            assert_eq!(actions.len(), 1);
            let Action::SendText {
                chat_id,
                text: body,
                keyboard,
            } = &actions[0]
            else {
                panic!("expected text");
            };
            assert_eq!(*chat_id, 42);
            assert_eq!(body, "Hello *Alice*!");
            assert_eq!(keyboard.len(), 3);
            assert_eq!(keyboard[0].len(), 2);
            assert_eq!(
                keyboard[0][0],
                InlineButton::url(
                    "➕ Add to Channel ➕",
                    "https://t.me/ReactBot?startchannel=botstart"
                )
            );
            assert_eq!(
                keyboard[0][1],
                InlineButton::url(
                    "➕ Add to Group ➕",
                    "https://t.me/ReactBot?startgroup=botstart"
                )
            );
            assert_eq!(
                keyboard[1],
                vec![InlineButton::url("Contact the owner", "https://t.me/medatt00")]
            );
            assert_eq!(
                keyboard[2],
                vec![InlineButton::url(
                    "💝 Support Us - Donate 🤝",
                    "https://t.me/bot1reactbot?start=donate"
                )]
            );
        }
    }

    #[test]
    fn test_default_template_substitutes_name() {
        let d = Dispatcher::new(
            &Config::from_toml("").unwrap(),
            Arc::new(RecordingApi::default()),
        );
        let Reply::Now(actions) = d.classify(&bot(), &message("/start")) else {
            panic!("expected immediate reply");
        };
        let Action::SendText { text, .. } = &actions[0] else {
            panic!("expected text");
        };
        assert!(text.contains("*Alice*"));
        assert!(!text.contains("{name}"));
    }

    #[test]
    fn test_reactions_lists_emojis_in_order() {
        let d = dispatcher(Arc::new(RecordingApi::default()));
        let reply = d.classify(&bot(), &message("/reactions"));
        assert_eq!(
            reply,
            Reply::Now(vec![Action::SendText {
                chat_id: 42,
                text: "✅ Enabled Reactions : \n\n👍, ❤️, 🔥, 👏, 🤩, 🎉, 💯".to_string(),
                keyboard: Vec::new(),
            }])
        );
    }

    #[test]
    fn test_donate_sends_invoice() {
        let d = dispatcher(Arc::new(RecordingApi::default()));
        for text in ["/donate", "/start donate"] {
            let Reply::Now(actions) = d.classify(&bot(), &message(text)) else {
                panic!("expected immediate reply for {text}");
            };
            let [Action::SendInvoice { chat_id, invoice }] = actions.as_slice() else {
                panic!("expected a single invoice");
            };
            assert_eq!(*chat_id, 42);
            assert_eq!(invoice.payload, "donate");
            assert_eq!(invoice.currency, "XTR");
            assert_eq!(invoice.prices.len(), 1);
            assert_eq!(invoice.prices[0].amount, 1);
        }
    }

    #[test]
    fn test_plain_text_and_media_get_delayed_reaction() {
        let d = dispatcher(Arc::new(RecordingApi::default()));
        let config = test_config();

        let media = InboundEvent::Message(IncomingMessage {
            chat_id: 9,
            message_id: 3,
            text: String::new(),
            has_media: true,
            participant_name: String::new(),
        });

        for event in [message("hello there"), message("/unknown"), media] {
            for _ in 0..200 {
                let Reply::Delayed { delay, action } = d.classify(&bot(), &event) else {
                    panic!("expected delayed reaction");
                };
                assert!(delay >= Duration::from_millis(1_000));
                assert!(delay < Duration::from_millis(11_000));
                let Action::React { emoji, .. } = action else {
                    panic!("expected reaction");
                };
                assert!(config.reactions.emojis.contains(&emoji));
            }
        }
    }

    #[test]
    fn test_empty_message_and_other_updates_ignored() {
        let d = dispatcher(Arc::new(RecordingApi::default()));
        assert_eq!(d.classify(&bot(), &message("")), Reply::Ignore);
        assert_eq!(d.classify(&bot(), &InboundEvent::Other), Reply::Ignore);
    }

    #[tokio::test]
    async fn test_pre_checkout_acknowledges_then_thanks() {
        let api = Arc::new(RecordingApi::default());
        let d = dispatcher(api.clone());
        let event = InboundEvent::PreCheckout {
            query_id: "q-9".to_string(),
            payer_id: 77,
        };

        d.dispatch(&bot(), &event).await;

        assert_eq!(
            api.calls(),
            vec![
                Call::AnswerPreCheckoutQuery {
                    query_id: "q-9".to_string(),
                    ok: true
                },
                Call::SendMessage {
                    chat_id: 77,
                    text: "Thank you for your donation! 💝".to_string(),
                    keyboard: Vec::new(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_outbound_failures_are_swallowed() {
        let api = Arc::new(RecordingApi::failing());
        let d = dispatcher(api.clone());
        let event = InboundEvent::PreCheckout {
            query_id: "q-1".to_string(),
            payer_id: 1,
        };

        d.dispatch(&bot(), &event).await;

        // The thank-you is still attempted after a failed acknowledgement.
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaction_fires_after_delay() {
        let api = Arc::new(RecordingApi::default());
        let d = dispatcher(api.clone());
        let started = tokio::time::Instant::now();

        d.dispatch(&bot(), &message("nice")).await;
        assert!(api.calls().is_empty(), "reaction must not be immediate");

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(api.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let calls = api.timed_calls();
        assert_eq!(calls.len(), 1);
        let (token, call, at) = &calls[0];
        assert_eq!(token, "111:secret");
        assert!(matches!(
            call,
            Call::SetMessageReaction {
                chat_id: 42,
                message_id: 7,
                ..
            }
        ));
        assert!(at.duration_since(started) >= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_pending_reactions_each_fire_once() {
        let api = Arc::new(RecordingApi::default());
        let d = dispatcher(api.clone());

        for i in 0..50 {
            let event = InboundEvent::Message(IncomingMessage {
                chat_id: 1_000 + i64::from(i),
                message_id: i,
                text: "hi".to_string(),
                has_media: false,
                participant_name: String::new(),
            });
            d.dispatch(&bot(), &event).await;
        }
        // Same event twice: two independent attempts.
        d.dispatch(&bot(), &message("again")).await;
        d.dispatch(&bot(), &message("again")).await;

        tokio::time::sleep(Duration::from_millis(11_000)).await;

        let calls = api.calls();
        assert_eq!(calls.len(), 52);
        let mut targets: Vec<(i64, i32)> = calls
            .iter()
            .filter_map(|call| match call {
                Call::SetMessageReaction {
                    chat_id,
                    message_id,
                    ..
                } => Some((*chat_id, *message_id)),
                _ => None,
            })
            .collect();
        targets.sort();
        let mut expected: Vec<(i64, i32)> = (0..50).map(|i| (1_000 + i64::from(i), i)).collect();
        expected.push((42, 7));
        expected.push((42, 7));
        expected.sort();
        assert_eq!(targets, expected);
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("Alice"), "Alice");
        assert_eq!(escape_markdown("john_doe"), "john\\_doe");
        assert_eq!(escape_markdown("*[`x`]*"), "\\*\\[\\`x\\`]\\*");
    }

    #[test]
    fn test_welcome_escapes_participant_name() {
        let d = dispatcher(Arc::new(RecordingApi::default()));
        let event = InboundEvent::Message(IncomingMessage {
            chat_id: 42,
            message_id: 1,
            text: "/start".to_string(),
            has_media: false,
            participant_name: "john_doe*".to_string(),
        });
        let Reply::Now(actions) = d.classify(&bot(), &event) else {
            panic!("expected immediate reply");
        };
        let Action::SendText { text, .. } = &actions[0] else {
            panic!("expected text");
        };
        assert_eq!(text, "Hello *john\\_doe\\**!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_pending_reaction() {
        let api = Arc::new(RecordingApi::default());
        let d = dispatcher(api.clone());

        d.dispatch(&bot(), &message("hi")).await;
        assert!(api.calls().is_empty());

        d.shutdown().await;

        assert!(matches!(
            api.calls().as_slice(),
            [Call::SetMessageReaction {
                chat_id: 42,
                message_id: 7,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_shutdown_with_nothing_pending_returns() {
        let d = dispatcher(Arc::new(RecordingApi::default()));
        d.shutdown().await;
    }
}

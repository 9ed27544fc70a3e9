use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// One configured bot account: its token, public handle and the base URL
/// Telegram should deliver its updates to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BotIdentity {
    pub token: String,
    pub webhook_url: String,
    pub username: String,
}

impl BotIdentity {
    /// Public part of the token (the numeric bot id before the `:`).
    /// Used to name the webhook route without exposing the secret half.
    pub fn route_key(&self) -> &str {
        self.token.split(':').next().unwrap_or(&self.token)
    }

    pub fn webhook_path(&self) -> String {
        format!("/webhook{}", self.route_key())
    }

    /// Full callback URL registered with Telegram.
    pub fn webhook_endpoint(&self) -> String {
        format!(
            "{}{}",
            self.webhook_url.trim_end_matches('/'),
            self.webhook_path()
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReactionsConfig {
    #[serde(default = "default_emojis")]
    pub emojis: Vec<String>,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Exclusive upper bound.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WelcomeConfig {
    /// `{name}` is replaced with the participant name.
    #[serde(default = "default_welcome_template")]
    pub template: String,
    #[serde(default = "default_owner_url")]
    pub owner_url: String,
    #[serde(default = "default_donate_url")]
    pub donate_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DonationConfig {
    #[serde(default = "default_donation_title")]
    pub title: String,
    #[serde(default = "default_donation_description")]
    pub description: String,
    #[serde(default = "default_donation_payload")]
    pub payload: String,
    /// Empty for payments in Telegram Stars.
    #[serde(default)]
    pub provider_token: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_price_label")]
    pub price_label: String,
    #[serde(default = "default_amount")]
    pub amount: u32,
    #[serde(default = "default_thank_you")]
    pub thank_you: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server_config")]
    pub server: ServerConfig,
    #[serde(default = "default_reactions_config")]
    pub reactions: ReactionsConfig,
    #[serde(default = "default_welcome_config")]
    pub welcome: WelcomeConfig,
    #[serde(default = "default_donation_config")]
    pub donation: DonationConfig,
    #[serde(default)]
    pub bots: Vec<BotIdentity>,
}

fn default_port() -> u16 {
    3000
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_emojis() -> Vec<String> {
    ["👍", "❤️", "🔥", "👏", "🤩", "🎉", "💯"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn default_min_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    11_000
}

fn default_welcome_template() -> String {
    "\n👋 Salut *{name}* ! Je suis un bot de réactions automatiques.\n\n\
     ✨ Envoie un message dans un groupe ou un canal où je suis administrateur, \
     et je réagirai avec un emoji aléatoire.\n\
     @Reactionxaabot\n\n@breactionxa\n\n@Dbreactioncbot\n\n@Dbreactiondbot\n\n@Dbreactionebot\n\
     👉 Utilise les boutons ci-dessous pour m'ajouter à ton groupe ou canal !\n"
        .to_string()
}

fn default_owner_url() -> String {
    "https://t.me/medatt00".to_string()
}

fn default_donate_url() -> String {
    "https://t.me/bot1reactbot?start=donate".to_string()
}

fn default_donation_title() -> String {
    "Donate to Auto Reaction Bot ✨".to_string()
}

fn default_donation_description() -> String {
    "Merci pour votre soutien !".to_string()
}

fn default_donation_payload() -> String {
    "donate".to_string()
}

fn default_currency() -> String {
    "XTR".to_string()
}

fn default_price_label() -> String {
    "Pay ⭐️1".to_string()
}

fn default_amount() -> u32 {
    1
}

fn default_thank_you() -> String {
    "Thank you for your donation! 💝".to_string()
}

fn default_server_config() -> ServerConfig {
    ServerConfig {
        port: default_port(),
        api_base: default_api_base(),
    }
}

fn default_reactions_config() -> ReactionsConfig {
    ReactionsConfig {
        emojis: default_emojis(),
        min_delay_ms: default_min_delay_ms(),
        max_delay_ms: default_max_delay_ms(),
    }
}

fn default_welcome_config() -> WelcomeConfig {
    WelcomeConfig {
        template: default_welcome_template(),
        owner_url: default_owner_url(),
        donate_url: default_donate_url(),
    }
}

fn default_donation_config() -> DonationConfig {
    DonationConfig {
        title: default_donation_title(),
        description: default_donation_description(),
        payload: default_donation_payload(),
        provider_token: String::new(),
        currency: default_currency(),
        price_label: default_price_label(),
        amount: default_amount(),
        thank_you: default_thank_you(),
    }
}

/// Collect `BOT_TOKEN_<n>` / `WEBHOOK_URL_<n>` / `BOT_USERNAME_<n>` triples,
/// starting at 1 and stopping at the first index with none of them set.
pub fn identities_from_env<F>(lookup: F) -> Result<Vec<BotIdentity>>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let mut bots = Vec::new();
    for n in 1.. {
        let token_key = format!("BOT_TOKEN_{n}");
        let url_key = format!("WEBHOOK_URL_{n}");
        let username_key = format!("BOT_USERNAME_{n}");

        let (token, webhook_url, username) = (get(&token_key), get(&url_key), get(&username_key));
        if token.is_none() && webhook_url.is_none() && username.is_none() {
            break;
        }

        let token = token.with_context(|| format!("{token_key} is missing"))?;
        let webhook_url = webhook_url.with_context(|| format!("{url_key} is missing"))?;
        let username = username.with_context(|| format!("{username_key} is missing"))?;
        bots.push(BotIdentity {
            token,
            webhook_url,
            username,
        });
    }
    Ok(bots)
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Load the optional TOML file, then append identities from the
    /// environment and validate. A missing file means all defaults.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    pub fn load_with<F>(path: &Path, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&content)?
        } else {
            Self::from_toml("")?
        };

        if let Some(port) = lookup("PORT").filter(|p| !p.trim().is_empty()) {
            config.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT value: {port}"))?;
        }

        config.bots.extend(identities_from_env(&lookup)?);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bots.is_empty() {
            bail!("No bots configured: set BOT_TOKEN_1, WEBHOOK_URL_1 and BOT_USERNAME_1");
        }

        let mut keys = HashSet::new();
        for (index, bot) in self.bots.iter().enumerate() {
            let n = index + 1;
            if bot.token.trim().is_empty() {
                bail!("Bot #{n}: token is missing");
            }
            match bot.token.split_once(':') {
                Some((id, secret)) if !id.is_empty() && !secret.is_empty() => {}
                _ => bail!("Bot #{n}: token must look like <bot id>:<secret>"),
            }
            if bot.webhook_url.trim().is_empty() {
                bail!("Bot #{n}: webhook_url is missing");
            }
            if bot.username.trim().is_empty() {
                bail!("Bot #{n}: username is missing");
            }
            if !keys.insert(bot.route_key()) {
                bail!(
                    "Bot #{n} ({}): another bot already uses webhook path {}",
                    bot.username,
                    bot.webhook_path()
                );
            }
        }

        if self.reactions.emojis.is_empty() {
            bail!("[reactions] emojis must not be empty");
        }
        if self.reactions.min_delay_ms >= self.reactions.max_delay_ms {
            bail!(
                "[reactions] min_delay_ms ({}) must be below max_delay_ms ({})",
                self.reactions.min_delay_ms,
                self.reactions.max_delay_ms
            );
        }
        Ok(())
    }
}

//! Configuration
//!
//! Settings are read from an optional YAML file and then overridden by
//! environment variables (a `.env` file is loaded first), so the service can
//! run on a host that only provides `TELEGRAM_TOKEN`, `MONGODB_URI`,
//! `MONGODB_DB` and `WEBHOOK_DOMAIN`.

use std::{net::SocketAddr, path::Path, str::FromStr};

use chrono::FixedOffset;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{service::auto_delete::MessageKind, utils, Error};

/// Configuration of the whole bot.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BotConfig {
    /// Telegram bot configuration
    pub telegram: TelegramConfig,
    /// Health check and webhook listener
    pub server: ServerConfig,
    /// MongoDB configuration
    pub mongo: MongoConfig,
    /// Client configuration, such as proxy
    pub client: ClientConfig,
    /// Hours east of UTC used for statistic dates and broadcast times
    pub timezone_offset: i32,
    /// User ids that are promoted to superadmin at startup
    pub superadmins: Vec<i64>,
    /// Groups authorised at startup with every permission
    pub groups: Vec<GroupSeed>,
    pub stats: StatsConfig,
    pub broadcast: BroadcastConfig,
    pub keyword: KeywordConfig,
    pub auto_delete: AutoDeleteConfig,
    pub schedule: ScheduleConfig,
    /// Seconds a half-filled form survives without input
    pub state_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: String,
    /// Public host name. Updates are received by long polling when unset.
    pub webhook_domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MongoConfig {
    pub connection_string: String,
    pub database: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ClientConfig {
    proxy: Option<String>,
    no_proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GroupSeed {
    pub group_id: i64,
    #[serde(default)]
    pub name: String,
}

/// Defaults applied to groups that have not changed their statistic settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StatsConfig {
    /// Messages smaller than this are not counted
    pub min_bytes: u64,
    /// Whether media messages are counted
    pub count_media: bool,
    pub daily_rank_size: u32,
    pub monthly_rank_size: u32,
    /// Statistics older than this many days are removed by the cleanup job
    pub cleanup_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Minutes
    pub min_interval: i64,
    /// Minutes
    pub max_interval: i64,
    /// Per group
    pub max_broadcasts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct KeywordConfig {
    /// Per group
    pub max_keywords: u64,
    pub max_pattern_length: usize,
    pub max_response_length: usize,
    pub max_buttons: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AutoDeleteConfig {
    /// Global switch. Groups still have to opt in.
    pub enabled: bool,
    pub default_timeout: u64,
    pub min_timeout: u64,
    pub max_timeout: u64,
    /// Seconds before a bot message of each kind is deleted
    pub timeouts: KindTimeouts,
    /// User commands starting with these are never deleted
    pub exempt_command_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct KindTimeouts {
    pub keyword: u64,
    pub broadcast: u64,
    pub ranking: u64,
    pub command: u64,
    pub default: u64,
}

/// Cron expressions with seconds, e.g. `0 * * * * *`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ScheduleConfig {
    pub broadcast: String,
    pub cleanup: String,
    pub keepalive: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            server: ServerConfig::default(),
            mongo: MongoConfig::default(),
            client: ClientConfig::default(),
            timezone_offset: 8,
            superadmins: Vec::new(),
            groups: Vec::new(),
            stats: StatsConfig::default(),
            broadcast: BroadcastConfig::default(),
            keyword: KeywordConfig::default(),
            auto_delete: AutoDeleteConfig::default(),
            schedule: ScheduleConfig::default(),
            state_timeout_secs: 300,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            connection_string: "mongodb://localhost:27017".to_string(),
            database: "telegram_bot".to_string(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            min_bytes: 0,
            count_media: false,
            daily_rank_size: 15,
            monthly_rank_size: 15,
            cleanup_days: 30,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            min_interval: 5,
            max_interval: 10080,
            max_broadcasts: 10,
        }
    }
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            max_keywords: 100,
            max_pattern_length: 100,
            max_response_length: 1000,
            max_buttons: 10,
        }
    }
}

impl Default for AutoDeleteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_timeout: 300,
            min_timeout: 10,
            max_timeout: 86400,
            timeouts: KindTimeouts::default(),
            exempt_command_prefixes: ["/start", "/help", "/settings", "/tongji", "/tongji30"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for KindTimeouts {
    fn default() -> Self {
        Self {
            keyword: 1800,
            broadcast: 3600,
            ranking: 7200,
            command: 300,
            default: 300,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            broadcast: "0 * * * * *".to_string(),
            cleanup: "0 0 4 * * *".to_string(),
            keepalive: "0 */5 * * * *".to_string(),
        }
    }
}

impl KindTimeouts {
    pub fn get(&self, kind: MessageKind) -> u64 {
        match kind {
            MessageKind::Keyword => self.keyword,
            MessageKind::Broadcast => self.broadcast,
            MessageKind::Ranking => self.ranking,
            MessageKind::Command => self.command,
            MessageKind::Default => self.default,
        }
    }
}

impl BotConfig {
    /// Read `path` if it exists, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            serde_yaml::from_reader(std::fs::File::open(path)?)?
        } else {
            BotConfig::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields with the variables returned by `var`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(token) = var("TELEGRAM_TOKEN") {
            self.telegram.token = token;
        }
        if let Some(domain) = var("WEBHOOK_DOMAIN") {
            self.telegram.webhook_domain = Some(domain);
        }
        if let Some(uri) = var("MONGODB_URI") {
            self.mongo.connection_string = uri;
        }
        if let Some(database) = var("MONGODB_DB") {
            self.mongo.database = database;
        }
        if let Some(host) = var("WEB_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PORT") {
            self.server.port = port.trim().parse()?;
        }
        if let Some(offset) = var("TZ_OFFSET_HOURS") {
            self.timezone_offset = offset.trim().parse()?;
        }
        if let Some(ids) = var("SUPERADMINS") {
            for id in ids.split(',').map(str::trim).filter(|id| !id.is_empty()) {
                let id = id.parse()?;
                if !self.superadmins.contains(&id) {
                    self.superadmins.push(id);
                }
            }
        }
        if let Some(proxy) = var("ALL_PROXY") {
            self.client.proxy.get_or_insert(proxy);
        }
        Ok(())
    }

    /// Every problem that would prevent the bot from running correctly.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.telegram.token.trim().is_empty() {
            problems.push("TELEGRAM_TOKEN is not set".to_string());
        }
        if self.superadmins.is_empty() {
            problems.push("at least one superadmin is required".to_string());
        }
        if self.timezone_offset.abs() > 14 {
            problems.push(format!(
                "timezone offset {} is out of range",
                self.timezone_offset
            ));
        }

        let auto_delete = &self.auto_delete;
        if auto_delete.min_timeout > auto_delete.max_timeout {
            problems.push("auto delete min_timeout is greater than max_timeout".to_string());
        }
        let in_range = |timeout: u64| {
            (auto_delete.min_timeout..=auto_delete.max_timeout).contains(&timeout)
        };
        if !in_range(auto_delete.default_timeout) {
            problems.push("auto delete default_timeout is out of range".to_string());
        }
        for kind in MessageKind::ALL {
            if !in_range(auto_delete.timeouts.get(kind)) {
                problems.push(format!("auto delete timeout of {} is out of range", kind));
            }
        }

        if self.broadcast.min_interval < 1 {
            problems.push("broadcast min_interval must be at least 1 minute".to_string());
        }
        if self.broadcast.min_interval > self.broadcast.max_interval {
            problems.push("broadcast min_interval is greater than max_interval".to_string());
        }

        for (name, expression) in [
            ("broadcast", &self.schedule.broadcast),
            ("cleanup", &self.schedule.cleanup),
            ("keepalive", &self.schedule.keepalive),
        ] {
            if let Err(err) = cron::Schedule::from_str(expression) {
                problems.push(format!("{name} schedule `{expression}` is invalid: {err}"));
            }
        }

        if let Some(domain) = &self.telegram.webhook_domain {
            if let Err(err) = self.webhook_url(domain) {
                problems.push(format!("webhook domain `{domain}` is invalid: {err}"));
            }
        }

        problems
    }

    pub fn timezone(&self) -> FixedOffset {
        utils::offset_from_hours(self.timezone_offset)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, Error> {
        Ok(format!("{}:{}", self.server.host, self.server.port).parse()?)
    }

    /// `https://{domain}/webhook/{token}`
    pub fn webhook_url(&self, domain: &str) -> Result<url::Url, Error> {
        let domain = domain
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        Ok(url::Url::parse(&format!(
            "https://{domain}/webhook/{}",
            self.telegram.token
        ))?)
    }
}

impl BotConfig {
    /// Connect to Telegram and the database.
    pub async fn build(self) -> Result<crate::service::BotService, Error> {
        let client = self.client.build()?;
        let bot = self.telegram.build(client);
        let database = crate::database::Database::connect(&self.mongo).await?;
        Ok(crate::service::BotService::new(bot, database, self))
    }
}

impl MongoConfig {
    pub async fn build(&self) -> Result<mongodb::Database, mongodb::error::Error> {
        let client = mongodb::Client::with_uri_str(&self.connection_string).await?;
        Ok(client.database(&self.database))
    }
}

impl ClientConfig {
    pub fn build(&self) -> Result<reqwest::Client, Error> {
        let mut client = teloxide::net::default_reqwest_settings().user_agent(crate::user_agent());

        if let Some(proxy) = &self.proxy {
            let proxy = reqwest::Proxy::all(proxy)?;
            let proxy = match &self.no_proxy {
                Some(no_proxy) => proxy.no_proxy(reqwest::NoProxy::from_string(no_proxy)),
                None => proxy.no_proxy(reqwest::NoProxy::from_env()),
            };
            info!("Using proxy {:?}", proxy);
            client = client.proxy(proxy);
        }

        Ok(client.build()?)
    }
}

impl TelegramConfig {
    pub fn build(&self, client: reqwest::Client) -> teloxide::Bot {
        teloxide::Bot::with_client(self.token.to_owned(), client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, fs::File};

    fn fixture() -> BotConfig {
        let config = File::open("tests/config.yaml").unwrap();
        serde_yaml::from_reader(config).unwrap()
    }

    #[test]
    fn test_deserialize_bot_config() {
        let config = fixture();

        assert_eq!(
            config.telegram.token,
            "123456789:ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz".to_string()
        );
        assert_eq!(config.telegram.webhook_domain, Some("bot.example.com".to_string()));
        assert_eq!(config.client.proxy, Some("127.0.0.1:8565".to_string()));
        assert_eq!(config.mongo.database, "test".to_string());
        assert_eq!(config.superadmins, vec![10001, 10002]);
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].group_id, -1001234567890);
        assert_eq!(config.stats.daily_rank_size, 10);
        assert_eq!(config.auto_delete.timeouts.keyword, 600);
        // untouched sections keep their defaults
        assert_eq!(config.broadcast.min_interval, 5);
        assert_eq!(config.keyword.max_keywords, 100);
        assert_eq!(config.auto_delete.timeouts.ranking, 7200);
        assert!(config.validate().is_empty(), "{:?}", config.validate());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TELEGRAM_TOKEN", "42:env-token"),
            ("MONGODB_URI", "mongodb://db:27017"),
            ("MONGODB_DB", "prod"),
            ("WEBHOOK_DOMAIN", "https://bot.onrender.com/"),
            ("PORT", "10000"),
            ("SUPERADMINS", "1, 2,,3"),
            ("WEB_HOST", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = BotConfig::default();
        config
            .apply_env(|key| env.get(key).map(|value| value.to_string()))
            .unwrap();

        assert_eq!(config.telegram.token, "42:env-token");
        assert_eq!(config.mongo.connection_string, "mongodb://db:27017");
        assert_eq!(config.mongo.database, "prod");
        assert_eq!(config.server.port, 10000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.superadmins, vec![1, 2, 3]);
        assert_eq!(
            config.listen_addr().unwrap(),
            "0.0.0.0:10000".parse().unwrap()
        );
        assert_eq!(
            config
                .webhook_url(config.telegram.webhook_domain.as_deref().unwrap())
                .unwrap()
                .as_str(),
            "https://bot.onrender.com/webhook/42:env-token"
        );
    }

    #[test]
    fn test_env_rejects_bad_port() {
        let mut config = BotConfig::default();
        let result = config.apply_env(|key| (key == "PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        let config = BotConfig::default();
        let problems = config.validate();
        assert_eq!(problems.len(), 2, "{problems:?}");

        let mut config = BotConfig::default();
        config.telegram.token = "1:abc".to_string();
        config.superadmins = vec![1];
        assert!(config.validate().is_empty());

        config.auto_delete.min_timeout = 600;
        config.broadcast.min_interval = 0;
        config.schedule.cleanup = "every day".to_string();
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("default_timeout")));
        assert!(problems.iter().any(|p| p.contains("min_interval")));
        assert!(problems.iter().any(|p| p.contains("cleanup schedule")));
    }

    #[test]
    fn test_build_schedule() {
        let config = BotConfig::default();
        let job = tokio_cron_scheduler::Job::new(config.schedule.broadcast.as_str(), |_uuid, _lock| {});
        assert!(job.is_ok());
    }
}

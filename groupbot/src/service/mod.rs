//! Service module
//!
//! The [`database`](crate::database) module only reads and writes documents,
//! this layer holds the rules: who may manage which group, what a valid keyword
//! or broadcast is, when a statistic counts and when a message goes away.
//! [`BotService`] bundles every service so chat handlers receive a single
//! dependency.

pub mod auto_delete;
pub mod broadcast;
pub mod keyword;
pub mod stats;

use std::sync::Arc;

use chrono::{FixedOffset, Utc};
use tracing::{info, warn};

use crate::{
    config::BotConfig,
    database::{Database, Group, GroupPermission, GroupSettings, UserRole},
    server::HealthState,
    Error,
};

use self::{
    auto_delete::AutoDeleteService, broadcast::BroadcastService, keyword::KeywordService,
    stats::StatsService,
};

#[derive(Clone)]
pub struct BotService {
    pub bot: teloxide::Bot,
    pub database: Database,
    pub config: Arc<BotConfig>,
    pub keywords: KeywordService,
    pub stats: StatsService,
    pub broadcasts: BroadcastService,
    pub auto_delete: AutoDeleteService,
    pub health: HealthState,
}

impl BotService {
    pub fn new(bot: teloxide::Bot, database: Database, config: BotConfig) -> Self {
        let offset = config.timezone();
        let auto_delete = AutoDeleteService::new(Arc::new(bot.clone()), config.auto_delete.clone());
        let keywords = KeywordService::new(database.keywords.clone(), config.keyword.clone());
        let stats = StatsService::new(database.stats.clone(), database.users.clone(), offset);
        let broadcasts = BroadcastService::new(
            database.broadcasts.clone(),
            database.groups.clone(),
            Arc::new(bot.clone()),
            auto_delete.clone(),
            config.broadcast.clone(),
            offset,
        );

        Self {
            bot,
            database,
            config: Arc::new(config),
            keywords,
            stats,
            broadcasts,
            auto_delete,
            health: HealthState::default(),
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.config.timezone()
    }

    /// Promote configured superadmins and authorise configured groups.
    pub async fn seed(&self) -> Result<(), Error> {
        for &user_id in &self.config.superadmins {
            self.database.users.set_role(user_id, UserRole::SuperAdmin).await?;
        }
        for seed in &self.config.groups {
            let existing = self.database.groups.get(seed.group_id).await?;
            if existing.is_none() {
                self.authorize_group(seed.group_id, &seed.name).await?;
            }
        }
        info!(
            "Seeded {} superadmins and {} groups",
            self.config.superadmins.len(),
            self.config.groups.len()
        );
        Ok(())
    }

    /// Grant every permission with default settings and add default keywords.
    ///
    /// Settings of a group that was authorised before are kept.
    pub async fn authorize_group(&self, group_id: i64, name: &str) -> Result<usize, Error> {
        let settings = GroupSettings::from_config(&self.config);
        self.database
            .groups
            .upsert(group_id, name, &GroupPermission::ALL, &settings)
            .await?;
        let added = self.keywords.add_defaults(group_id).await?;
        info!("Authorised group {group_id} ({name}), {added} default keywords added");
        Ok(added)
    }

    pub async fn deauthorize_group(&self, group_id: i64) -> Result<bool, Error> {
        Ok(self.database.remove_group(group_id).await?)
    }

    pub async fn role_of(&self, user_id: i64) -> Result<UserRole, Error> {
        Ok(self.database.users.role_of(user_id).await?)
    }

    pub async fn require_superadmin(&self, user_id: i64) -> Result<(), Error> {
        match self.role_of(user_id).await? {
            UserRole::SuperAdmin => Ok(()),
            _ => Err(Error::PermissionDenied),
        }
    }

    pub async fn require_admin(&self, user_id: i64) -> Result<UserRole, Error> {
        match self.role_of(user_id).await? {
            role if role.is_admin() => Ok(role),
            _ => Err(Error::PermissionDenied),
        }
    }

    /// The group, if it is authorised and `user_id` may manage it.
    pub async fn managed_group(&self, user_id: i64, group_id: i64) -> Result<Group, Error> {
        let group = self
            .database
            .groups
            .get(group_id)
            .await?
            .ok_or(Error::UnknownGroup(group_id))?;
        if !self.database.can_manage_group(user_id, group_id).await? {
            warn!("User {user_id} tried to manage group {group_id}");
            return Err(Error::PermissionDenied);
        }
        Ok(group)
    }

    /// Ping the database and remember the outcome for the health endpoint.
    pub async fn keepalive(&self) -> bool {
        let healthy = match self.database.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!("Database ping failed: {err}");
                false
            }
        };
        self.health.set(healthy);
        healthy
    }

    /// Daily removal of old statistics and finished broadcasts.
    pub async fn cleanup(&self) -> Result<(), Error> {
        let now = Utc::now();
        self.stats.cleanup(self.config.stats.cleanup_days, now).await?;
        self.broadcasts.cleanup(now).await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.auto_delete.shutdown();
    }
}

use std::{collections::HashMap, fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc},
    options::{FindOptions, UpdateOptions},
    Collection,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{config::BotConfig, service::auto_delete::MessageKind};

/// Feature a group can be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPermission {
    Keywords,
    Stats,
    Broadcast,
}

impl GroupPermission {
    pub const ALL: [GroupPermission; 3] = [
        GroupPermission::Keywords,
        GroupPermission::Stats,
        GroupPermission::Broadcast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupPermission::Keywords => "keywords",
            GroupPermission::Stats => "stats",
            GroupPermission::Broadcast => "broadcast",
        }
    }
}

impl Display for GroupPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            GroupPermission::Keywords => "关键词",
            GroupPermission::Stats => "统计",
            GroupPermission::Broadcast => "轮播",
        };
        f.write_str(label)
    }
}

impl FromStr for GroupPermission {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GroupPermission::ALL
            .into_iter()
            .find(|permission| permission.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("unknown permission {s}")))
    }
}

/// Per group settings edited from the settings menu.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    pub min_bytes: u64,
    pub count_media: bool,
    pub daily_rank_size: u32,
    pub monthly_rank_size: u32,
    pub auto_delete: bool,
    /// Seconds, used for messages without a more specific timeout
    pub auto_delete_timeout: u64,
    /// Seconds, keyed by [`MessageKind::as_str`]
    pub auto_delete_timeouts: HashMap<String, u64>,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self::from_config(&BotConfig::default())
    }
}

impl GroupSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            min_bytes: config.stats.min_bytes,
            count_media: config.stats.count_media,
            daily_rank_size: config.stats.daily_rank_size,
            monthly_rank_size: config.stats.monthly_rank_size,
            auto_delete: false,
            auto_delete_timeout: config.auto_delete.default_timeout,
            auto_delete_timeouts: HashMap::new(),
        }
    }

    pub fn timeout_override(&self, kind: MessageKind) -> Option<u64> {
        self.auto_delete_timeouts.get(kind.as_str()).copied()
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub group_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<GroupPermission>,
    #[serde(default)]
    pub settings: GroupSettings,
    /// Switches keyed by [`GroupPermission::as_str`]. Missing means on.
    #[serde(default)]
    pub feature_switches: HashMap<String, bool>,
    #[serde_as(as = "Option<mongodb::bson::DateTime>")]
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde_as(as = "Option<mongodb::bson::DateTime>")]
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Group {
    pub fn new(group_id: i64, name: impl Into<String>) -> Self {
        Self {
            group_id,
            name: name.into(),
            permissions: Vec::new(),
            settings: GroupSettings::default(),
            feature_switches: HashMap::new(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn switch_on(&self, permission: GroupPermission) -> bool {
        self.feature_switches
            .get(permission.as_str())
            .copied()
            .unwrap_or(true)
    }

    /// Granted and not switched off.
    pub fn has_permission(&self, permission: GroupPermission) -> bool {
        self.permissions.contains(&permission) && self.switch_on(permission)
    }

    pub fn title(&self) -> String {
        if self.name.is_empty() {
            format!("群组 {}", self.group_id)
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupCollection(pub Collection<Group>);

impl GroupCollection {
    pub fn groups(&self) -> Collection<Group> {
        self.0.clone()
    }

    pub async fn get(&self, group_id: i64) -> Result<Option<Group>, mongodb::error::Error> {
        self.groups().find_one(doc! { "group_id": group_id }, None).await
    }

    pub async fn all(&self) -> Result<Vec<Group>, mongodb::error::Error> {
        self.groups()
            .find(
                None,
                FindOptions::builder().sort(doc! { "group_id": 1 }).build(),
            )
            .await?
            .try_collect()
            .await
    }

    /// Authorise a group. Existing settings and switches are kept.
    pub async fn upsert(
        &self,
        group_id: i64,
        name: &str,
        permissions: &[GroupPermission],
        settings: &GroupSettings,
    ) -> Result<(), crate::Error> {
        let now = Utc::now();
        let permissions: Vec<&str> = permissions.iter().map(|p| p.as_str()).collect();
        let settings = bson::to_bson(settings)?;
        self.groups()
            .update_one(
                doc! { "group_id": group_id },
                doc! {
                    "$set": {
                        "name": name,
                        "permissions": permissions,
                        "updated_at": now,
                    },
                    "$setOnInsert": {
                        "settings": settings,
                        "feature_switches": {},
                        "created_at": now,
                    },
                },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    pub async fn update_settings(
        &self,
        group_id: i64,
        settings: &GroupSettings,
    ) -> Result<(), crate::Error> {
        let settings = bson::to_bson(settings)?;
        self.groups()
            .update_one(
                doc! { "group_id": group_id },
                doc! { "$set": { "settings": settings, "updated_at": Utc::now() } },
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn set_feature_switch(
        &self,
        group_id: i64,
        permission: GroupPermission,
        on: bool,
    ) -> Result<(), mongodb::error::Error> {
        let mut set = doc! { "updated_at": Utc::now() };
        set.insert(format!("feature_switches.{}", permission.as_str()), on);
        self.groups()
            .update_one(doc! { "group_id": group_id }, doc! { "$set": set }, None)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, group_id: i64) -> Result<bool, mongodb::error::Error> {
        let result = self
            .groups()
            .delete_one(doc! { "group_id": group_id }, None)
            .await?;
        Ok(result.deleted_count > 0)
    }
}

/// An admin allowed to manage a group.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminGroup {
    pub admin_id: i64,
    pub group_id: i64,
    #[serde_as(as = "Option<mongodb::bson::DateTime>")]
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AdminGroupCollection(pub Collection<AdminGroup>);

impl AdminGroupCollection {
    pub fn relations(&self) -> Collection<AdminGroup> {
        self.0.clone()
    }

    pub async fn add(&self, admin_id: i64, group_id: i64) -> Result<(), mongodb::error::Error> {
        self.relations()
            .update_one(
                doc! { "admin_id": admin_id, "group_id": group_id },
                doc! { "$setOnInsert": { "created_at": Utc::now() } },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    pub async fn remove(&self, admin_id: i64, group_id: i64) -> Result<bool, mongodb::error::Error> {
        let result = self
            .relations()
            .delete_one(doc! { "admin_id": admin_id, "group_id": group_id }, None)
            .await?;
        Ok(result.deleted_count > 0)
    }

    pub async fn exists(&self, admin_id: i64, group_id: i64) -> Result<bool, mongodb::error::Error> {
        let count = self
            .relations()
            .count_documents(doc! { "admin_id": admin_id, "group_id": group_id }, None)
            .await?;
        Ok(count > 0)
    }

    pub async fn groups_of(&self, admin_id: i64) -> Result<Vec<i64>, mongodb::error::Error> {
        let relations: Vec<AdminGroup> = self
            .relations()
            .find(doc! { "admin_id": admin_id }, None)
            .await?
            .try_collect()
            .await?;
        Ok(relations.into_iter().map(|r| r.group_id).collect())
    }

    pub async fn delete_by_admin(&self, admin_id: i64) -> Result<u64, mongodb::error::Error> {
        let result = self
            .relations()
            .delete_many(doc! { "admin_id": admin_id }, None)
            .await?;
        Ok(result.deleted_count)
    }

    pub async fn delete_by_group(&self, group_id: i64) -> Result<u64, mongodb::error::Error> {
        let result = self
            .relations()
            .delete_many(doc! { "group_id": group_id }, None)
            .await?;
        Ok(result.deleted_count)
    }
}

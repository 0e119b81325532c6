use std::fmt::Display;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, oid::ObjectId, Bson},
    options::FindOptions,
    Collection,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::message::{Media, Reply, UrlButton};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatType {
    #[default]
    Once,
    Hourly,
    Daily,
    Custom,
}

impl RepeatType {
    pub const ALL: [RepeatType; 4] = [
        RepeatType::Once,
        RepeatType::Hourly,
        RepeatType::Daily,
        RepeatType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RepeatType::Once => "once",
            RepeatType::Hourly => "hourly",
            RepeatType::Daily => "daily",
            RepeatType::Custom => "custom",
        }
    }

    /// Interval in minutes used when none is given.
    pub fn default_interval(&self) -> i64 {
        match self {
            RepeatType::Once => 0,
            RepeatType::Hourly => 60,
            RepeatType::Daily => 1440,
            RepeatType::Custom => 30,
        }
    }
}

impl Display for RepeatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RepeatType::Once => "单次",
            RepeatType::Hourly => "每小时",
            RepeatType::Daily => "每天",
            RepeatType::Custom => "自定义间隔",
        })
    }
}

/// A scheduled message posted to a group.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub group_id: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<Media>,
    #[serde(default)]
    pub buttons: Vec<UrlButton>,
    #[serde(default)]
    pub repeat_type: RepeatType,
    /// Minutes between two posts
    #[serde(default)]
    pub interval: i64,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub end_time: DateTime<Utc>,
    /// Post at the wall clock time in `schedule_time` instead of counting from the last post
    #[serde(default)]
    pub use_fixed_time: bool,
    /// Local `HH:MM`
    #[serde(default)]
    pub schedule_time: Option<String>,
    #[serde_as(as = "Option<mongodb::bson::DateTime>")]
    #[serde(default)]
    pub last_broadcast: Option<DateTime<Utc>>,
    #[serde_as(as = "Option<mongodb::bson::DateTime>")]
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde_as(as = "Option<mongodb::bson::DateTime>")]
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Broadcast {
    pub fn has_content(&self) -> bool {
        self.text.as_deref().map_or(false, |t| !t.trim().is_empty())
            || self.media.is_some()
            || !self.buttons.is_empty()
    }

    pub fn reply(&self) -> Reply {
        Reply {
            text: self.text.clone(),
            media: self.media.clone(),
            buttons: self.buttons.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastCollection(pub Collection<Broadcast>);

impl BroadcastCollection {
    pub fn broadcasts(&self) -> Collection<Broadcast> {
        self.0.clone()
    }

    pub async fn insert(&self, broadcast: &Broadcast) -> Result<Option<ObjectId>, mongodb::error::Error> {
        let result = self.broadcasts().insert_one(broadcast, None).await?;
        Ok(match result.inserted_id {
            Bson::ObjectId(id) => Some(id),
            _ => None,
        })
    }

    pub async fn get(&self, id: ObjectId) -> Result<Option<Broadcast>, mongodb::error::Error> {
        self.broadcasts().find_one(doc! { "_id": id }, None).await
    }

    /// Replace the stored document with the same id and group.
    pub async fn replace(&self, broadcast: &Broadcast) -> Result<bool, mongodb::error::Error> {
        let Some(id) = broadcast.id else {
            return Ok(false);
        };
        let result = self
            .broadcasts()
            .replace_one(doc! { "_id": id, "group_id": broadcast.group_id }, broadcast, None)
            .await?;
        Ok(result.matched_count > 0)
    }

    pub async fn remove(&self, group_id: i64, id: ObjectId) -> Result<bool, mongodb::error::Error> {
        let result = self
            .broadcasts()
            .delete_one(doc! { "_id": id, "group_id": group_id }, None)
            .await?;
        Ok(result.deleted_count > 0)
    }

    pub async fn of_group(&self, group_id: i64) -> Result<Vec<Broadcast>, mongodb::error::Error> {
        self.broadcasts()
            .find(
                doc! { "group_id": group_id },
                FindOptions::builder().sort(doc! { "start_time": 1 }).build(),
            )
            .await?
            .try_collect()
            .await
    }

    pub async fn count(&self, group_id: i64) -> Result<u64, mongodb::error::Error> {
        self.broadcasts()
            .count_documents(doc! { "group_id": group_id }, None)
            .await
    }

    /// Started broadcasts that may still post: not ended, or one-off and never sent.
    pub async fn active(&self, now: DateTime<Utc>) -> Result<Vec<Broadcast>, mongodb::error::Error> {
        let filter = doc! {
            "start_time": { "$lte": now },
            "$or": [
                { "end_time": { "$gte": now } },
                { "repeat_type": RepeatType::Once.as_str(), "last_broadcast": Bson::Null },
            ],
        };
        tracing::trace!("{filter:?}");
        self.broadcasts()
            .find(filter, None)
            .await?
            .try_collect()
            .await
    }

    pub async fn mark_sent(&self, id: ObjectId, at: DateTime<Utc>) -> Result<(), mongodb::error::Error> {
        self.broadcasts()
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "last_broadcast": at, "updated_at": Utc::now() } },
                None,
            )
            .await?;
        Ok(())
    }

    /// Remove broadcasts that ended before `cutoff` and will never post again.
    pub async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, mongodb::error::Error> {
        let result = self
            .broadcasts()
            .delete_many(
                doc! {
                    "end_time": { "$lt": cutoff },
                    "$or": [
                        { "repeat_type": { "$ne": RepeatType::Once.as_str() } },
                        { "last_broadcast": { "$ne": Bson::Null } },
                    ],
                },
                None,
            )
            .await?;
        Ok(result.deleted_count)
    }

    pub async fn delete_by_group(&self, group_id: i64) -> Result<u64, mongodb::error::Error> {
        let result = self
            .broadcasts()
            .delete_many(doc! { "group_id": group_id }, None)
            .await?;
        Ok(result.deleted_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mongodb::bson;

    #[test]
    fn test_broadcast_round_trip_keeps_times() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let broadcast: Broadcast = bson::from_document(doc! {
            "group_id": -100_i64,
            "text": "hello",
            "repeat_type": "hourly",
            "interval": 60_i64,
            "start_time": start,
            "end_time": start + chrono::Duration::days(1),
        })
        .unwrap();
        assert_eq!(broadcast.repeat_type, RepeatType::Hourly);
        assert_eq!(broadcast.start_time, start);
        assert!(broadcast.last_broadcast.is_none());
        assert!(!broadcast.use_fixed_time);

        let document = bson::to_document(&broadcast).unwrap();
        assert!(matches!(document.get("start_time"), Some(Bson::DateTime(_))));
    }

    #[test]
    fn test_default_interval() {
        assert_eq!(RepeatType::Once.default_interval(), 0);
        assert_eq!(RepeatType::Hourly.default_interval(), 60);
        assert_eq!(RepeatType::Daily.default_interval(), 1440);
        assert_eq!(RepeatType::Custom.default_interval(), 30);
    }
}

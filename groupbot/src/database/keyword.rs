use std::fmt::Display;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, oid::ObjectId},
    options::{FindOptions, UpdateOptions},
    Collection,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::message::{Media, Reply, UrlButton};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    #[default]
    Exact,
    Regex,
}

impl Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MatchType::Exact => "精确匹配",
            MatchType::Regex => "正则匹配",
        })
    }
}

/// An automatic reply triggered by a group message.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyword {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub group_id: i64,
    pub pattern: String,
    #[serde(rename = "type", default)]
    pub match_type: MatchType,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub media: Option<Media>,
    #[serde(default)]
    pub buttons: Vec<UrlButton>,
    /// Runs `command` instead of replying
    #[serde(default)]
    pub is_command: bool,
    #[serde(default)]
    pub command: Option<String>,
    #[serde_as(as = "Option<mongodb::bson::DateTime>")]
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde_as(as = "Option<mongodb::bson::DateTime>")]
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Keyword {
    pub fn new(group_id: i64, pattern: impl Into<String>, match_type: MatchType) -> Self {
        Self {
            id: None,
            group_id,
            pattern: pattern.into(),
            match_type,
            response: None,
            media: None,
            buttons: Vec::new(),
            is_command: false,
            command: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// A keyword that runs a bot command, such as `/tongji`.
    pub fn command(group_id: i64, pattern: impl Into<String>, command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            response: Some(command.clone()),
            is_command: true,
            command: Some(command),
            ..Self::new(group_id, pattern, MatchType::Exact)
        }
    }

    pub fn has_content(&self) -> bool {
        self.response.as_deref().map_or(false, |r| !r.trim().is_empty())
            || self.media.is_some()
            || !self.buttons.is_empty()
    }

    pub fn reply(&self) -> Reply {
        Reply {
            text: self.response.clone(),
            media: self.media.clone(),
            buttons: self.buttons.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeywordCollection(pub Collection<Keyword>);

impl KeywordCollection {
    pub fn keywords(&self) -> Collection<Keyword> {
        self.0.clone()
    }

    /// Insert or replace the keyword with the same group and pattern.
    pub async fn upsert(&self, keyword: &Keyword) -> Result<(), crate::Error> {
        let now = Utc::now();
        let mut set = bson::to_document(keyword)?;
        set.remove("_id");
        set.remove("created_at");
        set.insert("updated_at", now);

        self.keywords()
            .update_one(
                doc! { "group_id": keyword.group_id, "pattern": keyword.pattern.as_str() },
                doc! { "$set": set, "$setOnInsert": { "created_at": now } },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    /// Overwrite the keyword `id`, which may change its pattern.
    pub async fn replace(&self, id: ObjectId, keyword: &Keyword) -> Result<bool, crate::Error> {
        let mut set = bson::to_document(keyword)?;
        set.remove("_id");
        set.remove("created_at");
        set.insert("updated_at", Utc::now());

        let result = self
            .keywords()
            .update_one(
                doc! { "_id": id, "group_id": keyword.group_id },
                doc! { "$set": set },
                None,
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    /// Whether another keyword of the group than `except` uses `pattern`.
    pub async fn pattern_taken(
        &self,
        group_id: i64,
        pattern: &str,
        except: ObjectId,
    ) -> Result<bool, mongodb::error::Error> {
        let count = self
            .keywords()
            .count_documents(
                doc! { "group_id": group_id, "pattern": pattern, "_id": { "$ne": except } },
                None,
            )
            .await?;
        Ok(count > 0)
    }

    pub async fn exists(&self, group_id: i64, pattern: &str) -> Result<bool, mongodb::error::Error> {
        let count = self
            .keywords()
            .count_documents(doc! { "group_id": group_id, "pattern": pattern }, None)
            .await?;
        Ok(count > 0)
    }

    pub async fn remove(&self, group_id: i64, id: ObjectId) -> Result<bool, mongodb::error::Error> {
        let result = self
            .keywords()
            .delete_one(doc! { "_id": id, "group_id": group_id }, None)
            .await?;
        Ok(result.deleted_count > 0)
    }

    /// Keywords of a group in creation order.
    pub async fn of_group(&self, group_id: i64) -> Result<Vec<Keyword>, mongodb::error::Error> {
        self.keywords()
            .find(
                doc! { "group_id": group_id },
                FindOptions::builder().sort(doc! { "_id": 1 }).build(),
            )
            .await?
            .try_collect()
            .await
    }

    pub async fn count(&self, group_id: i64) -> Result<u64, mongodb::error::Error> {
        self.keywords()
            .count_documents(doc! { "group_id": group_id }, None)
            .await
    }

    /// Look up by object id, falling back to the pattern.
    pub async fn find(
        &self,
        group_id: i64,
        id_or_pattern: &str,
    ) -> Result<Option<Keyword>, mongodb::error::Error> {
        if let Ok(id) = ObjectId::parse_str(id_or_pattern) {
            let found = self
                .keywords()
                .find_one(doc! { "_id": id, "group_id": group_id }, None)
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }
        self.keywords()
            .find_one(doc! { "group_id": group_id, "pattern": id_or_pattern }, None)
            .await
    }

    pub async fn delete_by_group(&self, group_id: i64) -> Result<u64, mongodb::error::Error> {
        let result = self
            .keywords()
            .delete_many(doc! { "group_id": group_id }, None)
            .await?;
        Ok(result.deleted_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MediaKind;

    #[test]
    fn test_keyword_document_shape() {
        let mut keyword = Keyword::new(-100, "hello", MatchType::Regex);
        keyword.media = Some(Media {
            kind: MediaKind::Photo,
            file_id: "file".to_string(),
        });
        let document = bson::to_document(&keyword).unwrap();
        assert!(!document.contains_key("_id"));
        assert_eq!(document.get_str("type").unwrap(), "regex");
        assert_eq!(
            document.get_document("media").unwrap().get_str("type").unwrap(),
            "photo"
        );
    }

    #[test]
    fn test_command_keyword() {
        let keyword = Keyword::command(-100, "日排行", "/tongji");
        assert!(keyword.is_command);
        assert!(keyword.has_content());
        assert_eq!(keyword.command.as_deref(), Some("/tongji"));
        assert_eq!(keyword.match_type, MatchType::Exact);
    }

    #[test]
    fn test_has_content() {
        let mut keyword = Keyword::new(-100, "x", MatchType::Exact);
        assert!(!keyword.has_content());
        keyword.response = Some("  ".to_string());
        assert!(!keyword.has_content());
        keyword.buttons.push(UrlButton {
            text: "a".to_string(),
            url: "https://a.com".to_string(),
        });
        assert!(keyword.has_content());
    }
}

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, Bson, Document},
    Collection,
};
use serde::{Deserialize, Serialize};

use crate::message::MediaKind;

/// One counted group message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStat {
    pub group_id: i64,
    pub user_id: i64,
    /// Local date, `YYYY-MM-DD`
    pub date: String,
    pub total_messages: i64,
    pub total_size: i64,
    #[serde(default)]
    pub media_type: Option<MediaKind>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

/// Aggregated message count of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
    #[serde(rename = "_id")]
    pub user_id: i64,
    pub total_messages: i64,
    #[serde(default)]
    pub total_size: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SummaryRow {
    total_messages: i64,
    total_size: i64,
    days: Vec<String>,
    users: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatSummary {
    pub total_messages: i64,
    pub total_size: i64,
    pub days_active: i64,
    pub unique_users: i64,
    /// Rounded to two decimals
    pub avg_per_day: f64,
}

impl From<SummaryRow> for StatSummary {
    fn from(row: SummaryRow) -> Self {
        let days_active = row.days.len() as i64;
        let avg_per_day = if days_active > 0 {
            (row.total_messages as f64 / days_active as f64 * 100.0).round() / 100.0
        } else {
            0.0
        };
        Self {
            total_messages: row.total_messages,
            total_size: row.total_size,
            days_active,
            unique_users: row.users.len() as i64,
            avg_per_day,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsCollection(pub Collection<MessageStat>);

impl StatsCollection {
    pub fn stats(&self) -> Collection<MessageStat> {
        self.0.clone()
    }

    pub async fn insert(&self, stat: &MessageStat) -> Result<(), mongodb::error::Error> {
        self.stats().insert_one(stat, None).await?;
        Ok(())
    }

    /// Users of a group ordered by message count, for dates in `[start, end]`.
    pub async fn ranking(
        &self,
        group_id: i64,
        start: &str,
        end: &str,
    ) -> Result<Vec<RankEntry>, crate::Error> {
        let pipeline = vec![
            doc! { "$match": { "group_id": group_id, "date": { "$gte": start, "$lte": end } } },
            doc! { "$group": {
                "_id": "$user_id",
                "total_messages": { "$sum": "$total_messages" },
                "total_size": { "$sum": "$total_size" },
            } },
            doc! { "$sort": { "total_messages": -1, "_id": 1 } },
        ];
        let rows: Vec<Document> = self.stats().aggregate(pipeline, None).await?.try_collect().await?;
        rows.into_iter()
            .map(|row| Ok(bson::from_document(row)?))
            .collect()
    }

    async fn summary(&self, filter: Document) -> Result<StatSummary, crate::Error> {
        let pipeline = vec![
            doc! { "$match": filter },
            doc! { "$group": {
                "_id": Bson::Null,
                "total_messages": { "$sum": "$total_messages" },
                "total_size": { "$sum": "$total_size" },
                "days": { "$addToSet": "$date" },
                "users": { "$addToSet": "$user_id" },
            } },
        ];
        let rows: Vec<Document> = self.stats().aggregate(pipeline, None).await?.try_collect().await?;
        let row = match rows.into_iter().next() {
            Some(row) => bson::from_document::<SummaryRow>(row)?,
            None => SummaryRow::default(),
        };
        Ok(row.into())
    }

    pub async fn user_summary(
        &self,
        group_id: i64,
        user_id: i64,
        start: &str,
        end: &str,
    ) -> Result<StatSummary, crate::Error> {
        self.summary(doc! {
            "group_id": group_id,
            "user_id": user_id,
            "date": { "$gte": start, "$lte": end },
        })
        .await
    }

    pub async fn group_summary(
        &self,
        group_id: i64,
        start: &str,
        end: &str,
    ) -> Result<StatSummary, crate::Error> {
        self.summary(doc! { "group_id": group_id, "date": { "$gte": start, "$lte": end } })
            .await
    }

    pub async fn delete_before(&self, date: &str) -> Result<u64, mongodb::error::Error> {
        let result = self
            .stats()
            .delete_many(doc! { "date": { "$lt": date } }, None)
            .await?;
        Ok(result.deleted_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_from_row() {
        let summary = StatSummary::from(SummaryRow {
            total_messages: 10,
            total_size: 300,
            days: vec!["2024-01-01".into(), "2024-01-02".into(), "2024-01-03".into()],
            users: vec![1, 2],
        });
        assert_eq!(summary.days_active, 3);
        assert_eq!(summary.unique_users, 2);
        assert_eq!(summary.avg_per_day, 3.33);

        assert_eq!(StatSummary::from(SummaryRow::default()).avg_per_day, 0.0);
    }

    #[test]
    fn test_rank_entry_from_group_stage() {
        let entry: RankEntry = bson::from_document(doc! {
            "_id": 5_i64,
            "total_messages": 3_i32,
            "total_size": 42_i64,
        })
        .unwrap();
        assert_eq!(
            entry,
            RankEntry {
                user_id: 5,
                total_messages: 3,
                total_size: 42
            }
        );
    }
}

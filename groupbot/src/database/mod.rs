mod broadcast;
mod group;
mod keyword;
mod stats;
mod user;

pub use broadcast::{Broadcast, BroadcastCollection, RepeatType};
pub use group::{AdminGroup, AdminGroupCollection, Group, GroupCollection, GroupPermission, GroupSettings};
pub use keyword::{Keyword, KeywordCollection, MatchType};
pub use stats::{MessageStat, RankEntry, StatSummary, StatsCollection};
pub use user::{User, UserCollection, UserRole};

use mongodb::{
    bson::{doc, Document},
    options::IndexOptions,
    IndexModel,
};
use tracing::{debug, info};

use crate::config::MongoConfig;

/// All collections used by the bot.
#[derive(Debug, Clone)]
pub struct Database {
    pub database: mongodb::Database,
    pub users: UserCollection,
    pub groups: GroupCollection,
    pub admin_groups: AdminGroupCollection,
    pub keywords: KeywordCollection,
    pub broadcasts: BroadcastCollection,
    pub stats: StatsCollection,
}

impl Database {
    pub fn new(database: mongodb::Database) -> Self {
        Self {
            users: UserCollection(database.collection("users")),
            groups: GroupCollection(database.collection("groups")),
            admin_groups: AdminGroupCollection(database.collection("admin_groups")),
            keywords: KeywordCollection(database.collection("keywords")),
            broadcasts: BroadcastCollection(database.collection("broadcasts")),
            stats: StatsCollection(database.collection("message_stats")),
            database,
        }
    }

    /// Connect, check the server answers and make sure indexes exist.
    pub async fn connect(config: &MongoConfig) -> Result<Self, mongodb::error::Error> {
        let database = Self::new(config.build().await?);
        database.ping().await?;
        info!("Connected to database {}", database.database.name());
        database.ensure_indexes().await?;
        Ok(database)
    }

    pub async fn ping(&self) -> Result<(), mongodb::error::Error> {
        self.database.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    pub async fn ensure_indexes(&self) -> Result<(), mongodb::error::Error> {
        fn index(keys: Document, unique: bool) -> IndexModel {
            IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(unique).build())
                .build()
        }

        self.users
            .users()
            .create_index(index(doc! { "user_id": 1 }, true), None)
            .await?;
        self.groups
            .groups()
            .create_index(index(doc! { "group_id": 1 }, true), None)
            .await?;
        self.admin_groups
            .relations()
            .create_index(index(doc! { "admin_id": 1, "group_id": 1 }, true), None)
            .await?;
        self.keywords
            .keywords()
            .create_index(index(doc! { "group_id": 1, "pattern": 1 }, false), None)
            .await?;
        self.broadcasts
            .broadcasts()
            .create_index(index(doc! { "group_id": 1, "end_time": 1 }, false), None)
            .await?;
        self.stats
            .stats()
            .create_index(
                index(doc! { "group_id": 1, "user_id": 1, "date": 1 }, false),
                None,
            )
            .await?;
        debug!("Indexes are ready");
        Ok(())
    }

    /// Delete a user together with its group assignments.
    pub async fn remove_user(&self, user_id: i64) -> Result<bool, mongodb::error::Error> {
        let removed = self.users.delete(user_id).await?;
        let relations = self.admin_groups.delete_by_admin(user_id).await?;
        debug!("Removed user {user_id}: {removed}, {relations} group assignments");
        Ok(removed)
    }

    /// Delete a group together with its assignments, keywords and broadcasts.
    pub async fn remove_group(&self, group_id: i64) -> Result<bool, mongodb::error::Error> {
        let removed = self.groups.delete(group_id).await?;
        let relations = self.admin_groups.delete_by_group(group_id).await?;
        let keywords = self.keywords.delete_by_group(group_id).await?;
        let broadcasts = self.broadcasts.delete_by_group(group_id).await?;
        info!(
            "Removed group {group_id}: {relations} assignments, {keywords} keywords, {broadcasts} broadcasts"
        );
        Ok(removed)
    }

    /// Superadmins manage every group, admins only the ones assigned to them.
    pub async fn can_manage_group(
        &self,
        user_id: i64,
        group_id: i64,
    ) -> Result<bool, mongodb::error::Error> {
        match self.users.role_of(user_id).await? {
            UserRole::SuperAdmin => Ok(true),
            UserRole::Admin => self.admin_groups.exists(user_id, group_id).await,
            UserRole::User => Ok(false),
        }
    }

    pub async fn manageable_groups(&self, user_id: i64) -> Result<Vec<Group>, mongodb::error::Error> {
        match self.users.role_of(user_id).await? {
            UserRole::SuperAdmin => self.groups.all().await,
            UserRole::Admin => {
                let ids = self.admin_groups.groups_of(user_id).await?;
                let groups = self.groups.all().await?;
                Ok(groups
                    .into_iter()
                    .filter(|group| ids.contains(&group.group_id))
                    .collect())
            }
            UserRole::User => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Needs a running MongoDB, see `MONGODB_URI`.
    pub async fn init_db() -> Result<Database, mongodb::error::Error> {
        let uri = std::env::var("MONGODB_URI").unwrap_or("mongodb://localhost:27017".to_string());
        let client = mongodb::Client::with_uri_str(uri).await?;
        let db = client.database("groupbot_test_only_delete_me");
        db.drop(None).await?;
        let database = Database::new(db);
        database.ensure_indexes().await?;
        Ok(database)
    }

    #[tokio::test]
    #[ignore = "requires MongoDB"]
    async fn test_manage_permissions() {
        let db = init_db().await.unwrap();
        db.groups
            .upsert(-1, "one", &GroupPermission::ALL, &GroupSettings::default())
            .await
            .unwrap();
        db.groups
            .upsert(-2, "two", &GroupPermission::ALL, &GroupSettings::default())
            .await
            .unwrap();
        db.users.set_role(1, UserRole::SuperAdmin).await.unwrap();
        db.users.set_role(2, UserRole::Admin).await.unwrap();
        db.admin_groups.add(2, -2).await.unwrap();

        assert!(db.can_manage_group(1, -1).await.unwrap());
        assert!(!db.can_manage_group(2, -1).await.unwrap());
        assert!(db.can_manage_group(2, -2).await.unwrap());
        assert!(!db.can_manage_group(3, -2).await.unwrap());
        assert_eq!(db.manageable_groups(1).await.unwrap().len(), 2);
        assert_eq!(db.manageable_groups(2).await.unwrap()[0].group_id, -2);

        db.remove_user(2).await.unwrap();
        assert!(!db.can_manage_group(2, -2).await.unwrap());
        assert!(db.users.by_role(UserRole::Admin).await.unwrap().is_empty());

        db.remove_group(-1).await.unwrap();
        assert_eq!(db.manageable_groups(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires MongoDB"]
    async fn test_keyword_upsert_and_ranking() {
        let db = init_db().await.unwrap();
        let mut keyword = Keyword::new(-1, "hi", MatchType::Exact);
        keyword.response = Some("hello".to_string());
        db.keywords.upsert(&keyword).await.unwrap();
        keyword.response = Some("hello again".to_string());
        db.keywords.upsert(&keyword).await.unwrap();

        let keywords = db.keywords.of_group(-1).await.unwrap();
        assert_eq!(keywords.len(), 1);
        assert_eq!(keywords[0].response.as_deref(), Some("hello again"));
        let id = keywords[0].id.unwrap().to_hex();
        assert!(db.keywords.find(-1, &id).await.unwrap().is_some());
        assert!(db.keywords.find(-1, "hi").await.unwrap().is_some());

        for (user_id, count) in [(10, 3), (11, 5)] {
            for _ in 0..count {
                db.stats
                    .insert(&MessageStat {
                        group_id: -1,
                        user_id,
                        date: "2024-01-01".to_string(),
                        total_messages: 1,
                        total_size: 4,
                        media_type: None,
                        created_at: chrono::Utc::now(),
                    })
                    .await
                    .unwrap();
            }
        }
        let ranking = db.stats.ranking(-1, "2024-01-01", "2024-01-01").await.unwrap();
        assert_eq!(ranking[0].user_id, 11);
        assert_eq!(ranking[0].total_messages, 5);
        assert_eq!(ranking[1].total_size, 12);
        assert_eq!(db.stats.delete_before("2024-01-02").await.unwrap(), 8);
    }

    #[tokio::test]
    #[ignore = "requires MongoDB"]
    async fn test_edit_stored_documents() {
        let db = init_db().await.unwrap();
        for pattern in ["hi", "bye"] {
            let mut keyword = Keyword::new(-1, pattern, MatchType::Exact);
            keyword.response = Some(pattern.to_string());
            db.keywords.upsert(&keyword).await.unwrap();
        }
        let mut keyword = db.keywords.find(-1, "hi").await.unwrap().unwrap();
        let id = keyword.id.unwrap();
        assert!(db.keywords.pattern_taken(-1, "bye", id).await.unwrap());
        assert!(!db.keywords.pattern_taken(-1, "hi", id).await.unwrap());

        keyword.pattern = "hello".to_string();
        assert!(db.keywords.replace(id, &keyword).await.unwrap());
        assert_eq!(db.keywords.count(-1).await.unwrap(), 2);
        assert!(db.keywords.find(-1, "hi").await.unwrap().is_none());
        assert_eq!(
            db.keywords.find(-1, &id.to_hex()).await.unwrap().unwrap().pattern,
            "hello"
        );
        keyword.group_id = -2;
        assert!(!db.keywords.replace(id, &keyword).await.unwrap());

        let now = chrono::Utc::now();
        let mut broadcast = crate::service::broadcast::BroadcastDraft {
            text: Some("old".to_string()),
            ..crate::service::broadcast::BroadcastDraft::new(-1)
        }
        .normalize(&Default::default(), now, crate::utils::offset_from_hours(8))
        .unwrap();
        broadcast.id = db.broadcasts.insert(&broadcast).await.unwrap();
        broadcast.text = Some("new".to_string());
        assert!(db.broadcasts.replace(&broadcast).await.unwrap());
        let stored = db.broadcasts.get(broadcast.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.text.as_deref(), Some("new"));
    }
}

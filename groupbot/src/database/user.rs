use std::fmt::Display;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{bson::doc, options::UpdateOptions, Collection};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    User,
    Admin,
    SuperAdmin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
            UserRole::SuperAdmin => "superadmin",
        }
    }

    /// Admins and superadmins
    pub fn is_admin(&self) -> bool {
        *self >= UserRole::Admin
    }
}

impl Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            UserRole::User => "普通用户",
            UserRole::Admin => "管理员",
            UserRole::SuperAdmin => "超级管理员",
        };
        f.write_str(label)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub is_banned: bool,
    #[serde(default)]
    pub total_messages: i64,
    #[serde_as(as = "Option<mongodb::bson::DateTime>")]
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde_as(as = "Option<mongodb::bson::DateTime>")]
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(user_id: i64, role: UserRole) -> Self {
        Self {
            user_id,
            role,
            username: None,
            first_name: None,
            last_name: None,
            is_banned: false,
            total_messages: 0,
            created_at: None,
            updated_at: None,
        }
    }

    /// `first last`, then first name, then username, then a placeholder.
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name, &self.username) {
            (Some(first), Some(last), _) if !last.is_empty() => format!("{first} {last}"),
            (Some(first), _, _) if !first.is_empty() => first.clone(),
            (_, _, Some(username)) if !username.is_empty() => username.clone(),
            _ => format!("用户{}", self.user_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserCollection(pub Collection<User>);

impl UserCollection {
    pub fn users(&self) -> Collection<User> {
        self.0.clone()
    }

    pub async fn get(&self, user_id: i64) -> Result<Option<User>, mongodb::error::Error> {
        self.users().find_one(doc! { "user_id": user_id }, None).await
    }

    pub async fn role_of(&self, user_id: i64) -> Result<UserRole, mongodb::error::Error> {
        Ok(self
            .get(user_id)
            .await?
            .map(|user| user.role)
            .unwrap_or_default())
    }

    pub async fn by_role(&self, role: UserRole) -> Result<Vec<User>, mongodb::error::Error> {
        self.users()
            .find(doc! { "role": role.as_str() }, None)
            .await?
            .try_collect()
            .await
    }

    pub async fn is_banned(&self, user_id: i64) -> Result<bool, mongodb::error::Error> {
        Ok(self.get(user_id).await?.map_or(false, |user| user.is_banned))
    }

    /// Refresh profile fields of a user seen in a chat, creating the record if needed.
    pub async fn upsert_profile(
        &self,
        user: &teloxide::types::User,
    ) -> Result<(), mongodb::error::Error> {
        let now = Utc::now();
        self.users()
            .update_one(
                doc! { "user_id": user.id.0 as i64 },
                doc! {
                    "$set": {
                        "username": user.username.clone(),
                        "first_name": user.first_name.clone(),
                        "last_name": user.last_name.clone(),
                        "updated_at": now,
                    },
                    "$setOnInsert": {
                        "role": UserRole::User.as_str(),
                        "is_banned": false,
                        "created_at": now,
                    },
                },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    pub async fn set_role(&self, user_id: i64, role: UserRole) -> Result<(), mongodb::error::Error> {
        let now = Utc::now();
        self.users()
            .update_one(
                doc! { "user_id": user_id },
                doc! {
                    "$set": { "role": role.as_str(), "updated_at": now },
                    "$setOnInsert": { "is_banned": false, "created_at": now },
                },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    /// Count one message of `user`, refreshing its profile on the way.
    pub async fn count_message(
        &self,
        user: &teloxide::types::User,
    ) -> Result<(), mongodb::error::Error> {
        let now = Utc::now();
        self.users()
            .update_one(
                doc! { "user_id": user.id.0 as i64 },
                doc! {
                    "$inc": { "total_messages": 1_i64 },
                    "$set": {
                        "username": user.username.clone(),
                        "first_name": user.first_name.clone(),
                        "last_name": user.last_name.clone(),
                        "updated_at": now,
                    },
                    "$setOnInsert": {
                        "role": UserRole::User.as_str(),
                        "is_banned": false,
                        "created_at": now,
                    },
                },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    pub async fn delete(&self, user_id: i64) -> Result<bool, mongodb::error::Error> {
        let result = self
            .users()
            .delete_one(doc! { "user_id": user_id }, None)
            .await?;
        Ok(result.deleted_count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_order() {
        assert!(UserRole::SuperAdmin.is_admin());
        assert!(UserRole::Admin.is_admin());
        assert!(!UserRole::User.is_admin());
        assert!(UserRole::SuperAdmin > UserRole::Admin);
    }

    #[test]
    fn test_missing_role_defaults_to_user() {
        let user: User = mongodb::bson::from_document(doc! { "user_id": 7_i64 }).unwrap();
        assert_eq!(user.role, UserRole::User);
        assert_eq!(user.total_messages, 0);
        assert!(user.created_at.is_none());
    }

    #[test]
    fn test_display_name() {
        let mut user = User::new(42, UserRole::User);
        assert_eq!(user.display_name(), "用户42");
        user.username = Some("kiru".to_string());
        assert_eq!(user.display_name(), "kiru");
        user.first_name = Some("Kiruya".to_string());
        assert_eq!(user.display_name(), "Kiruya");
        user.last_name = Some("Momochi".to_string());
        assert_eq!(user.display_name(), "Kiruya Momochi");
    }
}

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::repo_types::{NewUser, ProfileChanges, User};

const USER_COLUMNS: &str = "id, email, password_hash, google_id, first_name, last_name, \
                            avatar_url, is_active, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// A unique constraint (email or provider id) rejected the write.
    #[error("duplicate value violates {0}")]
    Duplicate(String),
    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                let constraint = db.constraint().unwrap_or("unique constraint").to_string();
                return RepoError::Duplicate(constraint);
            }
        }
        RepoError::Database(e)
    }
}

/// Credential store. Emails are expected to be normalized by the caller.
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, RepoError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepoError>;
    async fn find_by_google_id(&self, google_id: &str) -> Result<Option<User>, RepoError>;
    async fn create(&self, user: NewUser) -> Result<User, RepoError>;
    /// Attach a provider id to an existing record, filling the avatar if it has none.
    async fn link_google(
        &self,
        id: Uuid,
        google_id: &str,
        avatar_url: Option<&str>,
    ) -> Result<User, RepoError>;
    async fn update_profile(
        &self,
        id: Uuid,
        changes: ProfileChanges,
    ) -> Result<Option<User>, RepoError>;
}

#[derive(Clone)]
pub struct PgUserRepo {
    db: PgPool,
}

impl PgUserRepo {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn find_one(&self, column: &str, value: &str) -> Result<Option<User>, RepoError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(value)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }
}

#[async_trait]
impl UserRepo for PgUserRepo {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, RepoError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepoError> {
        self.find_one("email", email).await
    }

    async fn find_by_google_id(&self, google_id: &str) -> Result<Option<User>, RepoError> {
        self.find_one("google_id", google_id).await
    }

    async fn create(&self, user: NewUser) -> Result<User, RepoError> {
        let sql = format!(
            r#"
            INSERT INTO users (email, password_hash, google_id, first_name, last_name, avatar_url)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {USER_COLUMNS}
            "#
        );
        let created = sqlx::query_as::<_, User>(&sql)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.google_id)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.avatar_url)
            .fetch_one(&self.db)
            .await?;
        Ok(created)
    }

    async fn link_google(
        &self,
        id: Uuid,
        google_id: &str,
        avatar_url: Option<&str>,
    ) -> Result<User, RepoError> {
        let sql = format!(
            r#"
            UPDATE users
               SET google_id = $2,
                   avatar_url = COALESCE(avatar_url, $3),
                   updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(google_id)
            .bind(avatar_url)
            .fetch_one(&self.db)
            .await?;
        Ok(user)
    }

    async fn update_profile(
        &self,
        id: Uuid,
        changes: ProfileChanges,
    ) -> Result<Option<User>, RepoError> {
        let sql = format!(
            r#"
            UPDATE users
               SET first_name = COALESCE($2, first_name),
                   last_name = CASE WHEN $3 THEN $4 ELSE last_name END,
                   avatar_url = CASE WHEN $5 THEN $6 ELSE avatar_url END,
                   updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(changes.first_name)
            .bind(changes.last_name.is_some())
            .bind(changes.last_name.flatten())
            .bind(changes.avatar_url.is_some())
            .bind(changes.avatar_url.flatten())
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryUserRepo;
    use super::*;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.into(),
            password_hash: Some("hash".into()),
            google_id: None,
            first_name: "A".into(),
            last_name: None,
            avatar_url: None,
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let repo = MemoryUserRepo::default();
        repo.create(new_user("a@b.com")).await.unwrap();
        let err = repo.create(new_user("a@b.com")).await.unwrap_err();
        assert!(matches!(err, RepoError::Duplicate(_)));
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn link_google_keeps_existing_avatar() {
        let repo = MemoryUserRepo::default();
        let mut nu = new_user("a@b.com");
        nu.avatar_url = Some("mine.png".into());
        let user = repo.create(nu).await.unwrap();

        let linked = repo
            .link_google(user.id, "g-1", Some("google.png"))
            .await
            .unwrap();
        assert_eq!(linked.google_id.as_deref(), Some("g-1"));
        assert_eq!(linked.avatar_url.as_deref(), Some("mine.png"));
        assert!(repo.find_by_google_id("g-1").await.unwrap().is_some());
    }
}

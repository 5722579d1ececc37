//! Database repository for subjects.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tracing::instrument;
use uuid::Uuid;

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
};
use crate::identity::{NewSubject, Subject, SubjectFilter, SubjectUpdate};
use crate::types::{SubjectId, abbrev_uuid};

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct SubjectRow {
    id: SubjectId,
    email: String,
    username: String,
    password_digest: String,
    display_name: Option<String>,
    active: bool,
    verified: bool,
    last_login: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SubjectRow> for Subject {
    fn from(row: SubjectRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            username: row.username,
            password_digest: row.password_digest,
            display_name: row.display_name,
            active: row.active,
            verified: row.verified,
            last_login: row.last_login,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const SUBJECT_COLUMNS: &str =
    "id, email, username, password_digest, display_name, active, verified, last_login, created_at, updated_at";

/// Escape `%`, `_` and `\` for use inside a LIKE pattern.
fn like_pattern(needle: &str) -> String {
    let escaped = needle.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    format!("%{escaped}%")
}

const FILTER_CLAUSE: &str = r#"
    ($1::BOOLEAN IS NULL OR s.active = $1)
    AND ($2::TEXT IS NULL OR s.email LIKE $2 OR LOWER(s.username) LIKE $2)
    AND ($3::TEXT IS NULL OR EXISTS (
        SELECT 1 FROM subject_roles sr JOIN roles r ON r.id = sr.role_id
        WHERE sr.subject_id = s.id AND r.name = $3
    ))
"#;

pub struct Subjects<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Subjects<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, email), err)]
    pub async fn get_by_email(&mut self, email: &str) -> Result<Option<Subject>> {
        let row = sqlx::query_as::<_, SubjectRow>(&format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE email = $1"))
            .bind(email)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(row.map(Subject::from))
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_username(&mut self, username: &str) -> Result<Option<Subject>> {
        let row = sqlx::query_as::<_, SubjectRow>(&format!(
            "SELECT {SUBJECT_COLUMNS} FROM subjects WHERE LOWER(username) = LOWER($1)"
        ))
        .bind(username)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(row.map(Subject::from))
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &SubjectFilter) -> Result<i64> {
        let filter = filter.normalized();
        let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM subjects s WHERE {FILTER_CLAUSE}"))
            .bind(filter.active)
            .bind(filter.search.as_deref().map(like_pattern))
            .bind(filter.role.as_deref())
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self), fields(subject_id = %abbrev_uuid(&id)), err)]
    pub async fn touch_last_login(&mut self, id: SubjectId) -> Result<()> {
        let result = sqlx::query("UPDATE subjects SET last_login = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Subjects<'c> {
    type CreateRequest = NewSubject;
    type UpdateRequest = SubjectUpdate;
    type Response = Subject;
    type Id = SubjectId;
    type Filter = SubjectFilter;

    #[instrument(skip(self, request), fields(username = %request.username), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let row = sqlx::query_as::<_, SubjectRow>(&format!(
            r#"
            INSERT INTO subjects (id, email, username, password_digest, display_name)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {SUBJECT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&request.email)
        .bind(&request.username)
        .bind(&request.password_digest)
        .bind(&request.display_name)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(row.into())
    }

    #[instrument(skip(self), fields(subject_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let row = sqlx::query_as::<_, SubjectRow>(&format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(row.map(Subject::from))
    }

    #[instrument(skip(self, filter), fields(skip = filter.skip, limit = filter.limit), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let filter = filter.normalized();
        let rows = sqlx::query_as::<_, SubjectRow>(&format!(
            r#"
            SELECT {SUBJECT_COLUMNS} FROM subjects s
            WHERE {FILTER_CLAUSE}
            ORDER BY s.created_at DESC, s.id
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.active)
        .bind(filter.search.as_deref().map(like_pattern))
        .bind(filter.role.as_deref())
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(rows.into_iter().map(Subject::from).collect())
    }

    /// Soft delete: flips `active` off. Returns whether the subject exists.
    #[instrument(skip(self), fields(subject_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("UPDATE subjects SET active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(subject_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let row = sqlx::query_as::<_, SubjectRow>(&format!(
            r#"
            UPDATE subjects SET
                email = COALESCE($2, email),
                username = COALESCE($3, username),
                password_digest = COALESCE($4, password_digest),
                display_name = CASE WHEN $5 THEN $6 ELSE display_name END,
                active = COALESCE($7, active),
                verified = COALESCE($8, verified),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {SUBJECT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&request.email)
        .bind(&request.username)
        .bind(&request.password_digest)
        .bind(request.display_name.is_some())
        .bind(request.display_name.clone().flatten())
        .bind(request.active)
        .bind(request.verified)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(row.into())
    }
}

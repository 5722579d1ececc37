//! Postgres identity store over [`DbPools`].
//!
//! Writes and point reads go to the primary. `list` and `count` tolerate replication
//! lag and are routed to the replica when one is configured.

use async_trait::async_trait;
use tracing::instrument;

use super::{IdentityStore, NewSubject, Role, RoleAssignment, Subject, SubjectFilter, SubjectUpdate};
use crate::db::{
    errors::{DbError, Result},
    handlers::{Repository, Roles, Subjects},
    pools::DbPools,
    transaction::{RetryPolicy, with_retry_transaction, within_transaction},
};
use crate::types::SubjectId;

#[derive(Clone, Debug)]
pub struct PgIdentityStore {
    pools: DbPools,
    retry: RetryPolicy,
}

impl PgIdentityStore {
    pub fn new(pools: DbPools) -> Self {
        Self {
            pools,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pools(&self) -> &DbPools {
        &self.pools
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn get_by_id(&self, id: SubjectId) -> Result<Option<Subject>> {
        let mut conn = self.pools.write().acquire().await?;
        Subjects::new(&mut conn).get_by_id(id).await
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<Subject>> {
        let mut conn = self.pools.write().acquire().await?;
        Subjects::new(&mut conn).get_by_email(email).await
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<Subject>> {
        let mut conn = self.pools.write().acquire().await?;
        Subjects::new(&mut conn).get_by_username(username).await
    }

    #[instrument(skip_all, fields(username = %subject.username), err)]
    async fn create(&self, subject: NewSubject, roles: &[String]) -> Result<Subject> {
        with_retry_transaction(self.pools.write(), &self.retry, |conn| {
            let subject = subject.clone();
            let roles = roles.to_vec();
            Box::pin(async move {
                let created = Subjects::new(&mut *conn).create(&subject).await?;
                let mut repo = Roles::new(&mut *conn);
                for role in &roles {
                    repo.assign(created.id, role, None).await?;
                }
                Ok(created)
            })
        })
        .await
    }

    async fn update(&self, id: SubjectId, update: SubjectUpdate) -> Result<Subject> {
        let mut conn = self.pools.write().acquire().await?;
        Subjects::new(&mut conn).update(id, &update).await
    }

    async fn delete(&self, id: SubjectId) -> Result<()> {
        let mut conn = self.pools.write().acquire().await?;
        if Subjects::new(&mut conn).delete(id).await? {
            Ok(())
        } else {
            Err(DbError::NotFound)
        }
    }

    async fn list(&self, filter: &SubjectFilter) -> Result<Vec<Subject>> {
        let mut conn = self.pools.read().acquire().await?;
        Subjects::new(&mut conn).list(filter).await
    }

    async fn count(&self, filter: &SubjectFilter) -> Result<i64> {
        let mut conn = self.pools.read().acquire().await?;
        Subjects::new(&mut conn).count(filter).await
    }

    async fn update_last_login(&self, id: SubjectId) -> Result<()> {
        let mut conn = self.pools.write().acquire().await?;
        Subjects::new(&mut conn).touch_last_login(id).await
    }

    async fn roles_of_subject(&self, id: SubjectId) -> Result<Vec<String>> {
        let mut conn = self.pools.write().acquire().await?;
        Roles::new(&mut conn).roles_of_subject(id).await
    }

    async fn assign_role(&self, subject_id: SubjectId, role: &str, assigned_by: Option<SubjectId>) -> Result<RoleAssignment> {
        within_transaction(self.pools.write(), |conn| {
            let role = role.to_string();
            Box::pin(async move { Roles::new(conn).assign(subject_id, &role, assigned_by).await })
        })
        .await
    }

    async fn remove_role(&self, subject_id: SubjectId, role: &str) -> Result<bool> {
        let mut conn = self.pools.write().acquire().await?;
        Roles::new(&mut conn).remove(subject_id, role).await
    }

    async fn permissions_of_subject(&self, id: SubjectId) -> Result<Vec<String>> {
        let mut conn = self.pools.write().acquire().await?;
        Roles::new(&mut conn).permissions_of_subject(id).await
    }

    async fn get_role(&self, name: &str) -> Result<Option<Role>> {
        let mut conn = self.pools.write().acquire().await?;
        Roles::new(&mut conn).get(name).await
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        let mut conn = self.pools.write().acquire().await?;
        Roles::new(&mut conn).list().await
    }

    #[instrument(skip(self, permissions), err)]
    async fn create_role(&self, name: &str, description: &str, permissions: &[String]) -> Result<Role> {
        within_transaction(self.pools.write(), |conn| {
            let (name, description, permissions) = (name.to_string(), description.to_string(), permissions.to_vec());
            Box::pin(async move { Roles::new(conn).create(&name, &description, &permissions).await })
        })
        .await
    }

    #[instrument(skip(self, permissions), err)]
    async fn set_role_permissions(&self, role: &str, permissions: &[String]) -> Result<Role> {
        with_retry_transaction(self.pools.write(), &self.retry, |conn| {
            let (role, permissions) = (role.to_string(), permissions.to_vec());
            Box::pin(async move { Roles::new(conn).set_permissions(&role, &permissions).await })
        })
        .await
    }

    async fn subjects_with_role(&self, role: &str) -> Result<Vec<SubjectId>> {
        let mut conn = self.pools.write().acquire().await?;
        Roles::new(&mut conn).subjects_with_role(role).await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pools.write()).await?;
        Ok(())
    }
}

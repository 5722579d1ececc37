//! In-process identity store.
//!
//! Holds everything in one `RwLock`ed map set. The lock is never held across an
//! `.await`. Uniqueness failures carry the same constraint names as the Postgres schema
//! so error mapping is identical for both stores.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{
    RwLock,
    atomic::{AtomicBool, Ordering},
};
use uuid::Uuid;

use super::{IdentityStore, NewSubject, Role, RoleAssignment, Subject, SubjectFilter, SubjectUpdate, canonical};
use crate::db::errors::{DbError, Result};
use crate::types::SubjectId;

#[derive(Default)]
struct State {
    subjects: HashMap<SubjectId, Subject>,
    roles: BTreeMap<String, Role>,
    /// subject -> role name -> assignment
    assignments: HashMap<SubjectId, BTreeMap<String, RoleAssignment>>,
}

impl State {
    fn check_unique(&self, id: Option<SubjectId>, email: Option<&str>, username: Option<&str>) -> Result<()> {
        for other in self.subjects.values().filter(|s| Some(s.id) != id) {
            if email.is_some_and(|e| e == other.email) {
                return Err(unique("subjects_email_key", "subjects"));
            }
            if username.is_some_and(|u| u.eq_ignore_ascii_case(&other.username)) {
                return Err(unique("subjects_username_key", "subjects"));
            }
        }
        Ok(())
    }

    fn roles_of(&self, id: SubjectId) -> Vec<String> {
        self.assignments
            .get(&id)
            .map(|roles| roles.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn matches(&self, subject: &Subject, filter: &SubjectFilter) -> bool {
        filter.active.is_none_or(|active| subject.active == active)
            && filter.search.as_ref().is_none_or(|needle| {
                subject.email.contains(needle.as_str()) || subject.username.to_lowercase().contains(needle.as_str())
            })
            && filter
                .role
                .as_ref()
                .is_none_or(|role| self.assignments.get(&subject.id).is_some_and(|roles| roles.contains_key(role)))
    }
}

fn unique(constraint: &str, table: &str) -> DbError {
    DbError::UniqueViolation {
        constraint: Some(constraint.to_string()),
        table: Some(table.to_string()),
        message: format!("duplicate key value violates unique constraint \"{constraint}\""),
    }
}

fn poisoned() -> DbError {
    DbError::Other(anyhow::anyhow!("identity store lock poisoned"))
}

/// Identity store kept in process memory.
#[derive(Default)]
pub struct MemoryIdentityStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
    #[cfg(test)]
    interleaved_grants: std::sync::Mutex<Vec<(SubjectId, String)>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`DbError::Unavailable`] until switched back.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Grant `role` to `subject_id` right before the next role permission update lands,
    /// as a concurrent writer would.
    #[cfg(test)]
    pub(crate) fn grant_during_next_role_update(&self, subject_id: SubjectId, role: &str) {
        if let Ok(mut grants) = self.interleaved_grants.lock() {
            grants.push((subject_id, role.to_string()));
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("memory identity store switched off".to_string()));
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> Result<T>) -> Result<T> {
        self.ensure_available()?;
        let state = self.state.read().map_err(|_| poisoned())?;
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        self.ensure_available()?;
        let mut state = self.state.write().map_err(|_| poisoned())?;
        f(&mut state)
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get_by_id(&self, id: SubjectId) -> Result<Option<Subject>> {
        self.read(|state| Ok(state.subjects.get(&id).cloned()))
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<Subject>> {
        self.read(|state| Ok(state.subjects.values().find(|s| s.email == email).cloned()))
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<Subject>> {
        self.read(|state| {
            Ok(state
                .subjects
                .values()
                .find(|s| s.username.eq_ignore_ascii_case(username))
                .cloned())
        })
    }

    async fn create(&self, new: NewSubject, roles: &[String]) -> Result<Subject> {
        self.write(|state| {
            state.check_unique(None, Some(&new.email), Some(&new.username))?;
            if roles.iter().any(|r| !state.roles.contains_key(r)) {
                return Err(DbError::NotFound);
            }

            let now = Utc::now();
            let subject = Subject {
                id: Uuid::new_v4(),
                email: new.email,
                username: new.username,
                password_digest: new.password_digest,
                display_name: new.display_name,
                active: true,
                verified: false,
                last_login: None,
                created_at: now,
                updated_at: now,
            };
            let assignments = roles
                .iter()
                .map(|role| {
                    (
                        role.clone(),
                        RoleAssignment {
                            subject_id: subject.id,
                            role: role.clone(),
                            assigned_at: now,
                            assigned_by: None,
                        },
                    )
                })
                .collect();
            state.assignments.insert(subject.id, assignments);
            state.subjects.insert(subject.id, subject.clone());
            Ok(subject)
        })
    }

    async fn update(&self, id: SubjectId, update: SubjectUpdate) -> Result<Subject> {
        self.write(|state| {
            state.check_unique(Some(id), update.email.as_deref(), update.username.as_deref())?;
            let subject = state.subjects.get_mut(&id).ok_or(DbError::NotFound)?;
            if let Some(email) = update.email {
                subject.email = email;
            }
            if let Some(username) = update.username {
                subject.username = username;
            }
            if let Some(digest) = update.password_digest {
                subject.password_digest = digest;
            }
            if let Some(display_name) = update.display_name {
                subject.display_name = display_name;
            }
            if let Some(active) = update.active {
                subject.active = active;
            }
            if let Some(verified) = update.verified {
                subject.verified = verified;
            }
            subject.updated_at = Utc::now();
            Ok(subject.clone())
        })
    }

    async fn delete(&self, id: SubjectId) -> Result<()> {
        self.write(|state| {
            let subject = state.subjects.get_mut(&id).ok_or(DbError::NotFound)?;
            subject.active = false;
            subject.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn list(&self, filter: &SubjectFilter) -> Result<Vec<Subject>> {
        let filter = filter.normalized();
        self.read(|state| {
            let mut subjects: Vec<Subject> = state.subjects.values().filter(|s| state.matches(s, &filter)).cloned().collect();
            subjects.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(subjects
                .into_iter()
                .skip(filter.skip as usize)
                .take(filter.limit as usize)
                .collect())
        })
    }

    async fn count(&self, filter: &SubjectFilter) -> Result<i64> {
        let filter = filter.normalized();
        self.read(|state| Ok(state.subjects.values().filter(|s| state.matches(s, &filter)).count() as i64))
    }

    async fn update_last_login(&self, id: SubjectId) -> Result<()> {
        self.write(|state| {
            let subject = state.subjects.get_mut(&id).ok_or(DbError::NotFound)?;
            subject.last_login = Some(Utc::now());
            Ok(())
        })
    }

    async fn roles_of_subject(&self, id: SubjectId) -> Result<Vec<String>> {
        self.read(|state| Ok(state.roles_of(id)))
    }

    async fn assign_role(&self, subject_id: SubjectId, role: &str, assigned_by: Option<SubjectId>) -> Result<RoleAssignment> {
        self.write(|state| {
            if !state.subjects.contains_key(&subject_id) || !state.roles.contains_key(role) {
                return Err(DbError::NotFound);
            }
            let assignment = state
                .assignments
                .entry(subject_id)
                .or_default()
                .entry(role.to_string())
                .or_insert_with(|| RoleAssignment {
                    subject_id,
                    role: role.to_string(),
                    assigned_at: Utc::now(),
                    assigned_by,
                });
            Ok(assignment.clone())
        })
    }

    async fn remove_role(&self, subject_id: SubjectId, role: &str) -> Result<bool> {
        self.write(|state| {
            Ok(state
                .assignments
                .get_mut(&subject_id)
                .is_some_and(|roles| roles.remove(role).is_some()))
        })
    }

    async fn permissions_of_subject(&self, id: SubjectId) -> Result<Vec<String>> {
        self.read(|state| {
            let permissions = state
                .roles_of(id)
                .iter()
                .filter_map(|role| state.roles.get(role))
                .flat_map(|role| role.permissions.iter().cloned())
                .collect();
            Ok(canonical(permissions))
        })
    }

    async fn get_role(&self, name: &str) -> Result<Option<Role>> {
        self.read(|state| Ok(state.roles.get(name).cloned()))
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        self.read(|state| Ok(state.roles.values().cloned().collect()))
    }

    async fn create_role(&self, name: &str, description: &str, permissions: &[String]) -> Result<Role> {
        self.write(|state| {
            if state.roles.contains_key(name) {
                return Err(unique("roles_name_key", "roles"));
            }
            let role = Role {
                id: Uuid::new_v4(),
                name: name.to_string(),
                description: description.to_string(),
                permissions: canonical(permissions.to_vec()),
            };
            state.roles.insert(name.to_string(), role.clone());
            Ok(role)
        })
    }

    async fn set_role_permissions(&self, role: &str, permissions: &[String]) -> Result<Role> {
        #[cfg(test)]
        {
            let grants: Vec<_> = self.interleaved_grants.lock().map_err(|_| poisoned())?.drain(..).collect();
            for (subject_id, granted) in grants {
                self.assign_role(subject_id, &granted, None).await?;
            }
        }
        self.write(|state| {
            let role = state.roles.get_mut(role).ok_or(DbError::NotFound)?;
            role.permissions = canonical(permissions.to_vec());
            Ok(role.clone())
        })
    }

    async fn subjects_with_role(&self, role: &str) -> Result<Vec<SubjectId>> {
        self.read(|state| {
            Ok(state
                .assignments
                .iter()
                .filter(|(_, roles)| roles.contains_key(role))
                .map(|(id, _)| *id)
                .collect())
        })
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_roles() -> MemoryIdentityStore {
        let store = MemoryIdentityStore::new();
        store
            .create_role("user", "Default role", &["products.read".to_string()])
            .await
            .unwrap();
        store
            .create_role("editor", "Can write products", &["products.write".to_string(), "products.read".to_string()])
            .await
            .unwrap();
        store
    }

    fn new_subject(email: &str, username: &str) -> NewSubject {
        NewSubject {
            email: email.to_string(),
            username: username.to_string(),
            password_digest: "$argon2id$stub".to_string(),
            display_name: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_roles() {
        let store = store_with_roles().await;
        let subject = store.create(new_subject("a@example.com", "alice"), &["user".to_string()]).await.unwrap();

        assert!(subject.active);
        assert!(!subject.verified);
        assert_eq!(store.roles_of_subject(subject.id).await.unwrap(), vec!["user"]);
        assert!(store.exists_by_email("a@example.com").await.unwrap());
        assert!(store.exists_by_username("ALICE").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_is_atomic_on_unknown_role() {
        let store = store_with_roles().await;
        let result = store.create(new_subject("a@example.com", "alice"), &["ghost".to_string()]).await;
        assert!(matches!(result, Err(DbError::NotFound)));
        assert!(!store.exists_by_email("a@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_uniqueness_constraints() {
        let store = store_with_roles().await;
        store.create(new_subject("a@example.com", "alice"), &[]).await.unwrap();

        let dup_email = store.create(new_subject("a@example.com", "other"), &[]).await.unwrap_err();
        assert!(matches!(dup_email, DbError::UniqueViolation { constraint: Some(ref c), .. } if c == "subjects_email_key"));

        let dup_username = store.create(new_subject("b@example.com", "Alice"), &[]).await.unwrap_err();
        assert!(matches!(dup_username, DbError::UniqueViolation { constraint: Some(ref c), .. } if c == "subjects_username_key"));
    }

    #[tokio::test]
    async fn test_permissions_are_union_of_roles() {
        let store = store_with_roles().await;
        let subject = store.create(new_subject("a@example.com", "alice"), &["user".to_string()]).await.unwrap();
        assert_eq!(store.permissions_of_subject(subject.id).await.unwrap(), vec!["products.read"]);

        store.assign_role(subject.id, "editor", None).await.unwrap();
        assert_eq!(
            store.permissions_of_subject(subject.id).await.unwrap(),
            vec!["products.read", "products.write"]
        );
        assert!(store.user_has_all(subject.id, &["products.read", "products.write"]).await.unwrap());
        assert!(!store.user_has_any(subject.id, &["orders.read"]).await.unwrap());

        assert!(store.remove_role(subject.id, "editor").await.unwrap());
        assert!(!store.remove_role(subject.id, "editor").await.unwrap());
        assert_eq!(store.permissions_of_subject(subject.id).await.unwrap(), vec!["products.read"]);
    }

    #[tokio::test]
    async fn test_soft_delete_and_filters() {
        let store = store_with_roles().await;
        let a = store.create(new_subject("a@example.com", "alice"), &["user".to_string()]).await.unwrap();
        store.create(new_subject("b@example.com", "bob"), &["editor".to_string()]).await.unwrap();

        store.delete(a.id).await.unwrap();
        assert!(!store.get_by_id(a.id).await.unwrap().unwrap().active);

        let active = SubjectFilter {
            active: Some(true),
            ..Default::default()
        };
        assert_eq!(store.count(&active).await.unwrap(), 1);

        let editors = SubjectFilter {
            role: Some("editor".to_string()),
            ..Default::default()
        };
        assert_eq!(store.list(&editors).await.unwrap()[0].username, "bob");

        let search = SubjectFilter {
            search: Some("ALI".to_string()),
            ..Default::default()
        };
        assert_eq!(store.count(&search).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_outage_toggle() {
        let store = store_with_roles().await;
        store.set_available(false);
        assert!(matches!(store.ping().await, Err(DbError::Unavailable(_))));
        assert!(matches!(store.get_by_email("a@example.com").await, Err(DbError::Unavailable(_))));
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}

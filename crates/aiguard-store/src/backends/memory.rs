//! In-memory store backed by `Arc<Mutex<…>>` maps.
//!
//! Suitable for tests and local development. All five repository contracts
//! are implemented on one handle; counter updates happen under the single
//! lock, which makes them atomic with respect to each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use aiguard_types::{
    AuditLog, PersonalAccessToken, Project, ProjectCredential, ProjectMember, Provider,
    QuotaLimits, UsageBucket, UsageRecord, User, UserStatus,
};

use crate::repo::{AuditRepo, ProjectRepo, StoreError, TokenRepo, UsageRepo, UserRepo};

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    tokens: HashMap<String, PersonalAccessToken>,
    projects: HashMap<String, Project>,
    usage: Vec<UsageRecord>,
    audit: Vec<AuditLog>,
}

/// Thread-safe in-memory store. `Clone` shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user without `await`, for test setup.
    pub fn seed_user(&self, user: User) {
        self.inner.lock().unwrap().users.insert(user.id.clone(), user);
    }

    /// Seed a token without `await`, for test setup.
    pub fn seed_token(&self, token: PersonalAccessToken) {
        self.inner.lock().unwrap().tokens.insert(token.id.clone(), token);
    }

    /// Seed a project without `await`, for test setup.
    pub fn seed_project(&self, project: Project) {
        self.inner
            .lock()
            .unwrap()
            .projects
            .insert(project.id.clone(), project);
    }

    /// Number of usage records written so far.
    pub fn usage_count(&self) -> usize {
        self.inner.lock().unwrap().usage.len()
    }

    /// Snapshot of all audit entries, for assertions.
    pub fn audit_entries(&self) -> Vec<AuditLog> {
        self.inner.lock().unwrap().audit.clone()
    }

    /// Snapshot of all usage records, for assertions.
    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.inner.lock().unwrap().usage.clone()
    }
}

#[async_trait::async_trait]
impl UserRepo for MemoryStore {
    async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let email_taken = inner.users.values().any(|u| {
            u.status != UserStatus::Deleted && u.email == user.email && u.id != user.id
        });
        if email_taken {
            return Err(StoreError::Duplicate(format!("email {}", user.email)));
        }
        inner.users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().unwrap().users.get(id).cloned())
    }

    async fn user_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .users
            .values()
            .find(|u| u.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = email.to_lowercase();
        Ok(self
            .inner
            .lock()
            .unwrap()
            .users
            .values()
            .find(|u| u.status != UserStatus::Deleted && u.email == email)
            .cloned())
    }

    async fn update_user(&self, user: &User) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .users
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn touch_last_login(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(user) = self.inner.lock().unwrap().users.get_mut(id) {
            user.last_login_at = Some(at);
            user.updated_at = at;
        }
        Ok(())
    }

    async fn set_user_status(&self, id: &str, status: UserStatus) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.users.get_mut(id) {
            Some(user) => {
                user.status = status;
                user.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let mut users: Vec<User> = self.inner.lock().unwrap().users.values().cloned().collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(users)
    }
}

#[async_trait::async_trait]
impl TokenRepo for MemoryStore {
    async fn insert_token(&self, token: PersonalAccessToken) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let name_taken = inner
            .tokens
            .values()
            .any(|t| t.user_id == token.user_id && t.name == token.name && t.id != token.id);
        if name_taken {
            return Err(StoreError::Duplicate(format!("token name {}", token.name)));
        }
        inner.tokens.insert(token.id.clone(), token);
        Ok(())
    }

    async fn token_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<PersonalAccessToken>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tokens
            .values()
            .find(|t| t.identifier == identifier)
            .cloned())
    }

    async fn token_by_id(&self, id: &str) -> Result<Option<PersonalAccessToken>, StoreError> {
        Ok(self.inner.lock().unwrap().tokens.get(id).cloned())
    }

    async fn tokens_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<PersonalAccessToken>, StoreError> {
        let mut tokens: Vec<PersonalAccessToken> = self
            .inner
            .lock()
            .unwrap()
            .tokens
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tokens)
    }

    async fn touch_last_used(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(token) = self.inner.lock().unwrap().tokens.get_mut(id) {
            token.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn revoke_token(&self, id: &str) -> Result<bool, StoreError> {
        match self.inner.lock().unwrap().tokens.get_mut(id) {
            Some(token) => {
                token.revoked = true;
                token.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_all_for_user(&self, user_id: &str) -> Result<u64, StoreError> {
        let mut count = 0;
        for token in self.inner.lock().unwrap().tokens.values_mut() {
            if token.user_id == user_id && !token.revoked {
                token.revoked = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn replace_token_secret(
        &self,
        id: &str,
        identifier: &str,
        token_hash: &str,
    ) -> Result<bool, StoreError> {
        match self.inner.lock().unwrap().tokens.get_mut(id) {
            Some(token) => {
                token.identifier = identifier.to_string();
                token.token_hash = token_hash.to_string();
                token.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait::async_trait]
impl ProjectRepo for MemoryStore {
    async fn insert_project(&self, project: Project) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .projects
            .insert(project.id.clone(), project);
        Ok(())
    }

    async fn project_by_id(&self, id: &str) -> Result<Option<Project>, StoreError> {
        Ok(self.inner.lock().unwrap().projects.get(id).cloned())
    }

    async fn projects_for_user(&self, user_id: &str) -> Result<Vec<Project>, StoreError> {
        let mut projects: Vec<Project> = self
            .inner
            .lock()
            .unwrap()
            .projects
            .values()
            .filter(|p| p.members.iter().any(|m| m.user_id == user_id))
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }

    async fn delete_project(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().unwrap().projects.remove(id).is_some())
    }

    async fn add_credential(
        &self,
        project_id: &str,
        credential: ProjectCredential,
    ) -> Result<bool, StoreError> {
        match self.inner.lock().unwrap().projects.get_mut(project_id) {
            Some(project) => {
                for existing in &mut project.credentials {
                    if existing.provider == credential.provider {
                        existing.active = false;
                    }
                }
                project.credentials.push(credential);
                project.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_credential(
        &self,
        project_id: &str,
        provider: Provider,
    ) -> Result<bool, StoreError> {
        match self.inner.lock().unwrap().projects.get_mut(project_id) {
            Some(project) => {
                let before = project.credentials.len();
                project.credentials.retain(|c| c.provider != provider);
                Ok(project.credentials.len() != before)
            }
            None => Ok(false),
        }
    }

    async fn add_member(
        &self,
        project_id: &str,
        member: ProjectMember,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.projects.get_mut(project_id) {
            Some(project) => {
                if project.members.iter().any(|m| m.user_id == member.user_id) {
                    return Err(StoreError::Duplicate(format!("member {}", member.user_id)));
                }
                project.members.push(member);
                project.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_member(&self, project_id: &str, user_id: &str) -> Result<bool, StoreError> {
        match self.inner.lock().unwrap().projects.get_mut(project_id) {
            Some(project) => {
                let before = project.members.len();
                project.members.retain(|m| m.user_id != user_id);
                Ok(project.members.len() != before)
            }
            None => Ok(false),
        }
    }

    async fn set_quota(&self, project_id: &str, quota: QuotaLimits) -> Result<bool, StoreError> {
        match self.inner.lock().unwrap().projects.get_mut(project_id) {
            Some(project) => {
                project.settings.quota = Some(quota);
                project.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn increment_usage(
        &self,
        project_id: &str,
        tokens: u64,
        cost: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(project) = inner.projects.get_mut(project_id) else {
            return Err(StoreError::Backend(format!("project {project_id} not found")));
        };
        for bucket in [
            &mut project.usage.total,
            &mut project.usage.current_month,
            &mut project.usage.current_day,
        ] {
            bucket.requests += 1;
            bucket.tokens += tokens;
            bucket.cost += cost;
        }
        project.usage.last_updated = at;
        Ok(())
    }

    async fn reset_daily_counters(&self, at: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut count = 0;
        for project in self.inner.lock().unwrap().projects.values_mut() {
            project.usage.current_day = UsageBucket::default();
            project.usage.last_updated = at;
            count += 1;
        }
        Ok(count)
    }

    async fn reset_monthly_counters(&self, at: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut count = 0;
        for project in self.inner.lock().unwrap().projects.values_mut() {
            project.usage.current_month = UsageBucket::default();
            project.usage.last_updated = at;
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait::async_trait]
impl UsageRepo for MemoryStore {
    async fn insert_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
        self.inner.lock().unwrap().usage.push(record);
        Ok(())
    }

    async fn usage_for_project(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .usage
            .iter()
            .rev()
            .filter(|r| r.project_id.as_deref() == Some(project_id))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl AuditRepo for MemoryStore {
    async fn append_audit(&self, log: AuditLog) -> Result<(), StoreError> {
        self.inner.lock().unwrap().audit.push(log);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aiguard_types::{MemberRole, ProjectSettings, UsageCounters};

    fn user(id: &str, email: &str) -> User {
        User {
            id: id.to_string(),
            external_id: None,
            email: email.to_string(),
            display_name: id.to_string(),
            status: UserStatus::Active,
            default_project_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_login_at: None,
        }
    }

    fn project(id: &str, owner: &str) -> Project {
        Project {
            id: id.to_string(),
            name: id.to_string(),
            owner_id: owner.to_string(),
            members: vec![ProjectMember {
                user_id: owner.to_string(),
                role: MemberRole::Owner,
                added_at: Utc::now(),
            }],
            credentials: vec![],
            settings: ProjectSettings::default(),
            usage: UsageCounters::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_live_email_is_rejected() {
        let store = MemoryStore::new();
        store.insert_user(user("u1", "a@example.com")).await.unwrap();
        let err = store.insert_user(user("u2", "a@example.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn deleted_user_frees_their_email() {
        let store = MemoryStore::new();
        store.insert_user(user("u1", "a@example.com")).await.unwrap();
        store.set_user_status("u1", UserStatus::Deleted).await.unwrap();
        store.insert_user(user("u2", "a@example.com")).await.unwrap();
        assert_eq!(
            store.user_by_email("a@example.com").await.unwrap().unwrap().id,
            "u2"
        );
    }

    #[tokio::test]
    async fn increment_updates_all_three_buckets() {
        let store = MemoryStore::new();
        store.insert_project(project("p1", "u1")).await.unwrap();

        store.increment_usage("p1", 120, 0.5, Utc::now()).await.unwrap();
        store.increment_usage("p1", 80, 0.25, Utc::now()).await.unwrap();

        let p = store.project_by_id("p1").await.unwrap().unwrap();
        for bucket in [p.usage.total, p.usage.current_month, p.usage.current_day] {
            assert_eq!(bucket.requests, 2);
            assert_eq!(bucket.tokens, 200);
            assert!((bucket.cost - 0.75).abs() < f64::EPSILON);
        }
    }

    #[tokio::test]
    async fn racing_increments_are_all_reflected() {
        let store = MemoryStore::new();
        store.insert_project(project("p1", "u1")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment_usage("p1", 1, 0.0, Utc::now()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let p = store.project_by_id("p1").await.unwrap().unwrap();
        assert_eq!(p.usage.current_day.requests, 32);
        assert_eq!(p.usage.total.requests, 32);
    }

    #[tokio::test]
    async fn daily_reset_leaves_month_and_total_alone() {
        let store = MemoryStore::new();
        store.insert_project(project("p1", "u1")).await.unwrap();
        store.increment_usage("p1", 10, 0.1, Utc::now()).await.unwrap();

        store.reset_daily_counters(Utc::now()).await.unwrap();

        let p = store.project_by_id("p1").await.unwrap().unwrap();
        assert_eq!(p.usage.current_day.requests, 0);
        assert_eq!(p.usage.current_month.requests, 1);
        assert_eq!(p.usage.total.requests, 1);
    }

    #[tokio::test]
    async fn adding_a_credential_deactivates_the_previous_one_for_that_provider() {
        let store = MemoryStore::new();
        store.insert_project(project("p1", "u1")).await.unwrap();
        let cred = |key_id: &str, provider: Provider| ProjectCredential {
            provider,
            envelope: "e".to_string(),
            key_id: key_id.to_string(),
            active: true,
            added_by: "u1".to_string(),
            added_at: Utc::now(),
        };

        store.add_credential("p1", cred("k-old", Provider::Anthropic)).await.unwrap();
        store.add_credential("p1", cred("k-openai", Provider::OpenAi)).await.unwrap();
        store.add_credential("p1", cred("k-new", Provider::Anthropic)).await.unwrap();

        let p = store.project_by_id("p1").await.unwrap().unwrap();
        let active: Vec<&str> = p
            .credentials
            .iter()
            .filter(|c| c.active && c.provider == Provider::Anthropic)
            .map(|c| c.key_id.as_str())
            .collect();
        assert_eq!(active, vec!["k-new"]);
        assert_eq!(
            p.active_credential(Provider::Anthropic).unwrap().key_id,
            "k-new"
        );
        // Other providers are untouched.
        assert_eq!(
            p.active_credential(Provider::OpenAi).unwrap().key_id,
            "k-openai"
        );
    }

    #[tokio::test]
    async fn revoke_all_counts_only_live_tokens() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let token = |id: &str, revoked: bool| PersonalAccessToken {
            id: id.to_string(),
            identifier: format!("pat_{id:0>16}"),
            token_hash: "h".to_string(),
            user_id: "u1".to_string(),
            project_id: None,
            name: id.to_string(),
            scopes: vec![],
            expires_at: None,
            revoked,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };
        store.seed_token(token("t1", false));
        store.seed_token(token("t2", false));
        store.seed_token(token("t3", true));

        assert_eq!(store.revoke_all_for_user("u1").await.unwrap(), 2);
        for t in store.tokens_for_user("u1").await.unwrap() {
            assert!(t.revoked);
        }
    }

    #[tokio::test]
    async fn duplicate_token_name_per_user_is_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mk = |id: &str, name: &str| PersonalAccessToken {
            id: id.to_string(),
            identifier: format!("pat_{id:0>16}"),
            token_hash: "h".to_string(),
            user_id: "u1".to_string(),
            project_id: None,
            name: name.to_string(),
            scopes: vec![],
            expires_at: None,
            revoked: false,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_token(mk("t1", "ci")).await.unwrap();
        assert!(matches!(
            store.insert_token(mk("t2", "ci")).await,
            Err(StoreError::Duplicate(_))
        ));
    }
}

//! In-memory implementations of the stores, settings and cache.
//!
//! Same observable semantics as the Postgres/Redis versions; used by tests
//! and for running the pipeline without infrastructure.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use tally_common::error::AppError;
use tally_common::types::{EnabledMember, Notification, NotificationType, PushSubscription};

use crate::cache::CacheClient;
use crate::notifications::{
    CreateNotificationParams, Cursor, NotificationContent, NotificationPage, NotificationStore,
    into_page, now_micros, page_size, retention_cutoff,
};
use crate::settings::SettingsProvider;
use crate::subscriptions::{RegisterSubscriptionParams, SubscriptionStore};

fn unavailable() -> AppError {
    AppError::Database(sqlx::Error::PoolTimedOut)
}

#[derive(Default)]
struct NotificationState {
    rows: Vec<Notification>,
    failing: bool,
    insert_calls: usize,
    purge_attempts: usize,
}

#[derive(Default)]
pub struct MemoryNotificationStore {
    state: Mutex<NotificationState>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the database were down.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Notification> {
        self.state.lock().rows.clone()
    }

    pub fn for_user(&self, user_id: Uuid) -> Vec<Notification> {
        self.state
            .lock()
            .rows
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Number of insert round trips performed.
    pub fn insert_calls(&self) -> usize {
        self.state.lock().insert_calls
    }

    pub fn purge_attempts(&self) -> usize {
        self.state.lock().purge_attempts
    }

    /// Insert a row as if it had been created `age` ago.
    pub fn insert_aged(
        &self,
        user_id: Uuid,
        content: &NotificationContent,
        age: chrono::Duration,
    ) -> Notification {
        let mut row = build(user_id, content);
        row.created_at = now_micros() - age;
        self.state.lock().rows.push(row.clone());
        row
    }
}

fn build(user_id: Uuid, content: &NotificationContent) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        user_id,
        workspace_id: content.workspace_id,
        kind: content.kind,
        title: content.title.clone(),
        body: content.body.clone(),
        is_read: false,
        data: content.data.clone(),
        created_at: now_micros(),
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn create_notification(
        &self,
        params: &CreateNotificationParams,
    ) -> Result<Notification, AppError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(unavailable());
        }
        state.insert_calls += 1;
        let row = build(params.user_id, &params.content);
        state.rows.push(row.clone());
        Ok(row)
    }

    async fn create_notifications(
        &self,
        user_ids: &[Uuid],
        content: &NotificationContent,
    ) -> Result<Vec<Notification>, AppError> {
        if user_ids.is_empty() {
            return Ok(vec![]);
        }
        let mut state = self.state.lock();
        if state.failing {
            return Err(unavailable());
        }
        state.insert_calls += 1;
        let rows: Vec<Notification> = user_ids.iter().map(|u| build(*u, content)).collect();
        state.rows.extend(rows.iter().cloned());
        Ok(rows)
    }

    async fn find_by_user_with_cursor(
        &self,
        user_id: Uuid,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<NotificationPage, AppError> {
        let limit = page_size(limit);
        let cursor = cursor.map(Cursor::decode).transpose()?;

        let state = self.state.lock();
        if state.failing {
            return Err(unavailable());
        }
        let mut rows: Vec<Notification> = state
            .rows
            .iter()
            .filter(|n| n.user_id == user_id)
            .filter(|n| cursor.is_none_or(|c| c.precedes(n)))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        rows.truncate(limit as usize + 1);

        Ok(into_page(rows, limit))
    }

    async fn has_unread(&self, user_id: Uuid) -> Result<bool, AppError> {
        let state = self.state.lock();
        if state.failing {
            return Err(unavailable());
        }
        Ok(state.rows.iter().any(|n| n.user_id == user_id && !n.is_read))
    }

    async fn count_unread(&self, user_id: Uuid) -> Result<i64, AppError> {
        let state = self.state.lock();
        if state.failing {
            return Err(unavailable());
        }
        Ok(state
            .rows
            .iter()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .count() as i64)
    }

    async fn mark_as_read(&self, id: Uuid, user_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(unavailable());
        }
        match state
            .rows
            .iter_mut()
            .find(|n| n.id == id && n.user_id == user_id)
        {
            Some(row) => {
                row.is_read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_all_as_read(&self, user_id: Uuid) -> Result<u64, AppError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(unavailable());
        }
        let mut affected = 0;
        for row in state
            .rows
            .iter_mut()
            .filter(|n| n.user_id == user_id && !n.is_read)
        {
            row.is_read = true;
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete_old_notifications(&self, retention_days: i64) -> Result<u64, AppError> {
        let cutoff = retention_cutoff(retention_days)?;
        let mut state = self.state.lock();
        state.purge_attempts += 1;
        if state.failing {
            return Err(unavailable());
        }
        let before = state.rows.len();
        state.rows.retain(|n| n.created_at >= cutoff);
        Ok((before - state.rows.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemorySubscriptionStore {
    rows: Mutex<Vec<PushSubscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn find_by_endpoint(&self, endpoint: &str) -> Result<Option<PushSubscription>, AppError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .find(|s| s.endpoint == endpoint)
            .cloned())
    }

    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<PushSubscription>, AppError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn upsert(
        &self,
        user_id: Uuid,
        params: &RegisterSubscriptionParams,
    ) -> Result<PushSubscription, AppError> {
        params.validate()?;

        let mut rows = self.rows.lock();
        if let Some(existing) = rows.iter_mut().find(|s| s.endpoint == params.endpoint) {
            existing.user_id = user_id;
            existing.p256dh = params.p256dh.clone();
            existing.auth = params.auth.clone();
            return Ok(existing.clone());
        }

        let sub = PushSubscription {
            id: Uuid::new_v4(),
            user_id,
            endpoint: params.endpoint.clone(),
            p256dh: params.p256dh.clone(),
            auth: params.auth.clone(),
            created_at: Utc::now(),
        };
        rows.push(sub.clone());
        Ok(sub)
    }

    async fn delete_by_endpoint(&self, endpoint: &str, user_id: Uuid) -> Result<bool, AppError> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|s| !(s.endpoint == endpoint && s.user_id == user_id));
        Ok(rows.len() < before)
    }

    async fn delete_by_ids(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|s| !ids.contains(&s.id));
        Ok((before - rows.len()) as u64)
    }
}

/// One member's settings row.
#[derive(Debug, Clone)]
pub struct MemberSettings {
    pub user_id: Uuid,
    pub web_push_enabled: bool,
    pub slack_enabled: bool,
    pub webhook_url: Option<String>,
    pub enabled_types: HashSet<NotificationType>,
}

#[derive(Default)]
pub struct MemorySettings {
    workspaces: Mutex<HashMap<Uuid, Vec<MemberSettings>>>,
    failing: Mutex<bool>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, workspace_id: Uuid, settings: MemberSettings) {
        let mut workspaces = self.workspaces.lock();
        let members = workspaces.entry(workspace_id).or_default();
        members.retain(|m| m.user_id != settings.user_id);
        members.push(settings);
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl SettingsProvider for MemorySettings {
    async fn find_enabled_members_for_notification(
        &self,
        workspace_id: Uuid,
        kind: NotificationType,
        exclude_user_id: Option<Uuid>,
    ) -> Result<Vec<EnabledMember>, AppError> {
        if *self.failing.lock() {
            return Err(unavailable());
        }
        let workspaces = self.workspaces.lock();
        let members = workspaces
            .get(&workspace_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.enabled_types.contains(&kind))
                    .filter(|m| Some(m.user_id) != exclude_user_id)
                    .map(|m| EnabledMember {
                        user_id: m.user_id,
                        web_push_enabled: m.web_push_enabled,
                        slack_enabled: m.slack_enabled,
                        webhook_url: m.webhook_url.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(members)
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn connect(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AppError> {
        self.entries.lock().clear();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), AppError> {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content() -> NotificationContent {
        NotificationContent {
            workspace_id: Some(Uuid::new_v4()),
            kind: NotificationType::SettlementCreated,
            title: "Settlement recorded".to_string(),
            body: "Alice paid Bob 20.00".to_string(),
            data: None,
        }
    }

    #[tokio::test]
    async fn test_bulk_insert_empty_short_circuits() {
        let store = MemoryNotificationStore::new();
        let rows = store.create_notifications(&[], &content()).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(store.insert_calls(), 0);
    }

    #[tokio::test]
    async fn test_cursor_pages_cover_every_row_once() {
        let store = MemoryNotificationStore::new();
        let user = Uuid::new_v4();
        for _ in 0..5 {
            store.create_notifications(&[user], &content()).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = store
                .find_by_user_with_cursor(user, cursor.as_deref(), Some(2))
                .await
                .unwrap();
            seen.extend(page.items.iter().map(|n| n.id));
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }

        let unique: HashSet<Uuid> = seen.iter().copied().collect();
        assert_eq!(seen.len(), 5);
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn test_mark_as_read_respects_owner() {
        let store = MemoryNotificationStore::new();
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let row = store.create_notifications(&[owner], &content()).await.unwrap().remove(0);

        assert!(!store.mark_as_read(row.id, stranger).await.unwrap());
        assert!(store.has_unread(owner).await.unwrap());

        assert!(store.mark_as_read(row.id, owner).await.unwrap());
        assert!(store.mark_as_read(row.id, owner).await.unwrap());
        assert!(!store.has_unread(owner).await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_dedups_by_endpoint() {
        let store = MemorySubscriptionStore::new();
        let params = RegisterSubscriptionParams {
            endpoint: "https://push.example.com/abc".to_string(),
            p256dh: "key".to_string(),
            auth: "auth".to_string(),
        };
        let first = store.upsert(Uuid::new_v4(), &params).await.unwrap();
        let new_owner = Uuid::new_v4();
        let second = store.upsert(new_owner, &params).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 1);
        assert_eq!(store.find_by_user_id(new_owner).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_entries_expire() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_millis(0)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        cache.delete("k").await.unwrap();
        assert!(!cache.contains("k"));
    }
}

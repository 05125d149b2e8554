//! Notification center: the newest notifications of the agency, live
//! inserts and short-lived toasts.

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::client::{NotificationStore, Realtime, RealtimeMessage, Subscription};
use crate::crm::feed::{ChangeEvent, ChangeFilter, ChangeKind, Table};
use crate::crm::models::Notification;
use crate::errors::CrmError;

/// How many notifications are kept.
pub const NOTIFICATION_LIMIT: usize = 50;

/// How long a toast stays up.
pub const TOAST_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Toast {
    pub notification: Notification,
    pub expires_at: Instant,
}

pub struct NotificationCenter<C> {
    client: C,
    items: Vec<Notification>,
    toasts: Vec<Toast>,
}

impl<C: NotificationStore> NotificationCenter<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            items: Vec::new(),
            toasts: Vec::new(),
        }
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn toasts(&self) -> &[Toast] {
        &self.toasts
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    pub async fn load(&mut self) -> Result<&[Notification], CrmError> {
        match self.client.list_notifications(NOTIFICATION_LIMIT).await {
            Ok(items) => {
                self.items = items;
                Ok(&self.items)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load notifications");
                Err(e)
            }
        }
    }

    /// Prepend an inserted notification and raise a toast for it.
    pub fn handle_change(&mut self, event: &ChangeEvent, now: Instant) -> Option<&Notification> {
        if event.table != Table::Notifications || event.kind != ChangeKind::Insert {
            return None;
        }
        let notification: Notification = match serde_json::from_value(event.record.clone()) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed notification event");
                return None;
            }
        };
        self.items.retain(|n| n.id != notification.id);
        self.items.insert(0, notification.clone());
        self.items.truncate(NOTIFICATION_LIMIT);
        self.toasts.push(Toast {
            notification,
            expires_at: now + TOAST_TTL,
        });
        self.items.first()
    }

    /// Apply one subscription message. Dropped inserts are recovered by
    /// reloading the list; no toasts are raised for them.
    pub async fn handle_message(&mut self, message: &RealtimeMessage, now: Instant) -> Result<bool, CrmError> {
        match message {
            RealtimeMessage::Change(event) => Ok(self.handle_change(event, now).is_some()),
            RealtimeMessage::Resync { .. } => {
                self.load().await?;
                Ok(true)
            }
        }
    }

    /// Drop expired toasts, returning how many went away.
    pub fn expire_toasts(&mut self, now: Instant) -> usize {
        let before = self.toasts.len();
        self.toasts.retain(|t| t.expires_at > now);
        before - self.toasts.len()
    }

    pub fn dismiss_toast(&mut self, id: Uuid) {
        self.toasts.retain(|t| t.notification.id != id);
    }

    /// Mark one notification read, undoing the local change on failure.
    pub async fn mark_as_read(&mut self, id: Uuid) -> Result<(), CrmError> {
        let Some(item) = self.items.iter_mut().find(|n| n.id == id) else {
            return Err(CrmError::not_found("Notification", id));
        };
        if item.read {
            return Ok(());
        }
        item.read = true;
        if let Err(e) = self.client.mark_read(vec![id]).await {
            tracing::warn!(notification_id = %id, error = %e, "failed to mark notification read");
            if let Some(item) = self.items.iter_mut().find(|n| n.id == id) {
                item.read = false;
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn mark_all_as_read(&mut self) -> Result<(), CrmError> {
        let unread: Vec<Uuid> = self.items.iter().filter(|n| !n.read).map(|n| n.id).collect();
        if unread.is_empty() {
            return Ok(());
        }
        for item in &mut self.items {
            item.read = true;
        }
        if let Err(e) = self.client.mark_all_read().await {
            tracing::warn!(error = %e, "failed to mark notifications read");
            for item in self.items.iter_mut().filter(|n| unread.contains(&n.id)) {
                item.read = false;
            }
            return Err(e);
        }
        Ok(())
    }
}

impl<C: NotificationStore + Realtime> NotificationCenter<C> {
    /// Subscribe to new notifications of `agency_id`.
    pub async fn watch(&self, agency_id: Uuid) -> Result<Subscription, CrmError> {
        self.client
            .subscribe(
                ChangeFilter::table(Table::Notifications)
                    .event(ChangeKind::Insert)
                    .agency(agency_id),
            )
            .await
    }
}

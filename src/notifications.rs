// Notification inbox and booking approval workflow

use log::{debug, info, warn};
use std::collections::HashMap;

use crate::error::{SyncError, ValidationError};
use crate::ledger::{Ledger, LedgerEntity};
use crate::models::{BookingDecision, Identity, Notification, NotificationId, TempId};

impl LedgerEntity for Notification {
    type Key = NotificationId;

    fn identity(&self) -> Identity<NotificationId> {
        Identity::Server(self.id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxAction {
    MarkRead,
    Delete,
    Respond(BookingDecision),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingInboxAction {
    pub temp_id: TempId,
    pub notification_id: NotificationId,
    pub action: InboxAction,
}

/// Marking read is optimistic. Deleting and answering a booking request only
/// remove the notification once the server has agreed.
#[derive(Default)]
pub struct NotificationInbox {
    items: Ledger<Notification>,
    in_flight: HashMap<TempId, PendingInboxAction>,
}

impl NotificationInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.items.values()
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.get_by_key(&id.to_string())
    }

    pub fn unread_count(&self) -> usize {
        self.items.values().filter(|n| !n.is_read).count()
    }

    /// Upsert a pushed notification. Returns true if it was not known before.
    pub fn receive(&mut self, notification: Notification) -> bool {
        let is_new = self.get(&notification.id).is_none();
        // A read flag never goes back to unread
        self.items.reconcile_external_with(notification, |current, mut incoming| {
            incoming.is_read |= current.is_read;
            incoming
        });
        is_new
    }

    /// Merge the full inbox as fetched from the server. The list also settles
    /// actions whose outcome was unknown: a notification that is gone was
    /// deleted or answered, one that shows as read was marked read.
    pub fn merge(&mut self, notifications: Vec<Notification>) {
        let listed: HashMap<NotificationId, bool> = notifications.iter().map(|n| (n.id.clone(), n.is_read)).collect();
        for notification in notifications {
            self.receive(notification);
        }
        self.settle_from_listing(&listed);
    }

    fn settle_from_listing(&mut self, listed: &HashMap<NotificationId, bool>) {
        let settled: Vec<PendingInboxAction> = self
            .in_flight
            .values()
            .filter(|p| match (p.action, listed.get(&p.notification_id)) {
                (_, None) => true,
                (InboxAction::MarkRead, Some(&is_read)) => is_read,
                _ => false,
            })
            .cloned()
            .collect();

        for pending in settled {
            self.in_flight.remove(&pending.temp_id);
            if listed.contains_key(&pending.notification_id) {
                self.items.confirm_in_place(pending.temp_id);
                debug!("Notification {} read, confirmed by fetch", pending.notification_id);
            } else if self.items.remove(&Identity::Server(pending.notification_id.clone())).is_some() {
                info!("Notification {} gone from the server after {:?}", pending.notification_id, pending.action);
            }
        }
    }

    fn require(&self, id: &str) -> Result<&Notification, ValidationError> {
        self.get(id)
            .ok_or_else(|| ValidationError::UnknownNotification(id.to_string()))
    }

    fn track(&mut self, id: &str, action: InboxAction) -> PendingInboxAction {
        let pending = PendingInboxAction {
            temp_id: TempId::new(),
            notification_id: id.to_string(),
            action,
        };
        self.in_flight.insert(pending.temp_id, pending.clone());
        pending
    }

    pub fn begin_mark_read(&mut self, id: &str) -> Result<PendingInboxAction, ValidationError> {
        self.require(id)?;
        let pending = self.track(id, InboxAction::MarkRead);
        self.items
            .begin_optimistic_update(pending.temp_id, &id.to_string(), |n: &mut Notification| n.is_read = true);
        Ok(pending)
    }

    pub fn begin_delete(&mut self, id: &str) -> Result<PendingInboxAction, ValidationError> {
        self.require(id)?;
        Ok(self.track(id, InboxAction::Delete))
    }

    pub fn begin_respond(&mut self, id: &str, decision: BookingDecision) -> Result<PendingInboxAction, ValidationError> {
        self.require(id)?;
        Ok(self.track(id, InboxAction::Respond(decision)))
    }

    pub fn settle(&mut self, temp_id: TempId, outcome: Result<(), SyncError>) -> Result<(), SyncError> {
        let Some(pending) = self.in_flight.get(&temp_id).cloned() else {
            debug!("Inbox action {} already settled", temp_id);
            return outcome;
        };
        let identity = Identity::Server(pending.notification_id.clone());

        match outcome {
            Ok(()) => {
                self.in_flight.remove(&temp_id);
                match pending.action {
                    InboxAction::MarkRead => {
                        self.items.confirm_in_place(temp_id);
                    }
                    InboxAction::Delete | InboxAction::Respond(_) => {
                        self.items.remove(&identity);
                        info!("Notification {} removed after {:?}", pending.notification_id, pending.action);
                    }
                }
                Ok(())
            }
            Err(e) if e.is_ambiguous() => {
                warn!("Notification {} {:?}: outcome unknown: {}", pending.notification_id, pending.action, e);
                Err(e)
            }
            Err(e) => {
                self.in_flight.remove(&temp_id);
                if pending.action == InboxAction::MarkRead {
                    self.items.reject(temp_id, &e.to_string());
                }
                warn!("Notification {} {:?} failed: {}", pending.notification_id, pending.action, e);
                Err(e)
            }
        }
    }
}

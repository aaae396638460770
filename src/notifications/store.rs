//! Pure state container for the notification feed.
//!
//! `reduce` is a total function from a state and an event to the next state.
//! It touches no IO and holds no locks, so every transition is trivially
//! testable and the unread count can never drift: it is computed from the
//! list, not stored beside it.

use crate::notifications::models::Notification;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedState {
    /// Notifications, newest first.
    pub notifications: Vec<Notification>,
    /// A history fetch is in flight.
    pub loading: bool,
    /// The push channel is currently connected.
    pub connected: bool,
}

impl FeedState {
    /// Number of unread notifications, derived from the list.
    pub fn unread_count(&self) -> usize {
        self.notifications.iter().filter(|n| !n.read).count()
    }
}

#[derive(Debug, Clone)]
pub enum FeedEvent {
    LoadingStarted,
    /// Replace the list with a freshly fetched history.
    HistoryLoaded(Vec<Notification>),
    LoadFailed,
    /// A notification arrived over the push channel.
    Push(Notification),
    MarkRead(String),
    MarkAllRead,
    ConnectionChanged(bool),
}

pub fn reduce(state: &FeedState, event: FeedEvent) -> FeedState {
    let mut next = state.clone();
    match event {
        FeedEvent::LoadingStarted => next.loading = true,
        FeedEvent::HistoryLoaded(mut notifications) => {
            notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            next.notifications = notifications;
            next.loading = false;
        }
        FeedEvent::LoadFailed => next.loading = false,
        FeedEvent::Push(notification) => {
            // A redelivery of a known id updates in place instead of
            // duplicating the entry.
            match next.notifications.iter_mut().find(|n| n.id == notification.id) {
                Some(existing) => *existing = notification,
                None => next.notifications.insert(0, notification),
            }
        }
        FeedEvent::MarkRead(id) => {
            if let Some(notification) = next.notifications.iter_mut().find(|n| n.id == id) {
                notification.read = true;
            }
        }
        FeedEvent::MarkAllRead => {
            for notification in &mut next.notifications {
                notification.read = true;
            }
        }
        FeedEvent::ConnectionChanged(connected) => next.connected = connected,
    }
    next
}

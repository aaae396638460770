//! Notification feed: REST history, push channel integration and read state.

pub mod api;
pub mod center;
pub mod models;
pub mod store;

pub use api::NotificationsApi;
pub use center::NotificationCenter;
pub use models::Notification;
pub use store::{reduce, FeedEvent, FeedState};

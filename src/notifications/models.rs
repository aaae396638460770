//! Notification wire model. Field names follow the backend's JSON casing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Parse a pushed payload that has already been normalized to its
    /// innermost JSON value.
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_wire_format() {
        let raw = r#"{
            "id": "n1",
            "title": "Incoming transfer",
            "content": "You received 250.00",
            "read": false,
            "createdAt": "2026-08-25T10:15:00Z"
        }"#;

        let notification: Notification = serde_json::from_str(raw).unwrap();
        assert_eq!(notification.id, "n1");
        assert_eq!(notification.title, "Incoming transfer");
        assert!(!notification.read);
        assert!(notification.created_at.is_some());
    }

    #[test]
    fn missing_optional_fields_default() {
        let raw = r#"{"id": "n2", "title": "Card blocked"}"#;
        let notification: Notification = serde_json::from_str(raw).unwrap();
        assert_eq!(notification.content, "");
        assert!(!notification.read);
        assert!(notification.created_at.is_none());
    }

    #[test]
    fn from_value_rejects_non_notification_shapes() {
        assert!(Notification::from_value(serde_json::json!("just a string")).is_none());
        assert!(Notification::from_value(serde_json::json!({"unrelated": true})).is_none());
    }
}

//! Work item definition

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An element that belongs to a group and knows when it was created
///
/// The queue layer only needs these two facts: the group decides which
/// per-group queue an element lands in, the creation time feeds the
/// oldest-item tracking used for staleness detection.
pub trait Groupable {
    /// Group key used to partition work
    fn group(&self) -> &str;

    /// Creation timestamp in epoch milliseconds
    fn created_at_millis(&self) -> i64;
}

/// A unit of work routed by group and executed by the worker pool
///
/// # Example
///
/// ```
/// use taskmesh_dispatch::WorkItem;
/// use serde_json::json;
///
/// let item = WorkItem::new("tenant-42", json!({"order_id": 7}));
/// assert_eq!(item.group, "tenant-42");
/// assert!(!item.recovered);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique, time-ordered identifier
    pub id: Uuid,

    /// Group key (fairness partition)
    pub group: String,

    /// Creation time in epoch milliseconds
    pub created_at_millis: i64,

    /// Caller-defined payload handed to the work handler
    pub payload: serde_json::Value,

    /// Set when the item was resubmitted by stale work recovery
    #[serde(default)]
    pub recovered: bool,

    /// Number of times the item went through ingestion
    #[serde(default)]
    pub submissions: u32,
}

impl WorkItem {
    /// Create a new work item stamped with the current time
    pub fn new(group: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            group: group.into(),
            created_at_millis: Utc::now().timestamp_millis(),
            payload,
            recovered: false,
            submissions: 0,
        }
    }

    /// Override the creation timestamp
    pub fn with_created_at(mut self, millis: i64) -> Self {
        self.created_at_millis = millis;
        self
    }

    /// Override the identifier
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Flag the item as a recovery resubmission
    pub fn mark_recovered(&mut self) {
        self.recovered = true;
    }

    /// Age of the item relative to `now_millis`
    pub fn age_millis(&self, now_millis: i64) -> i64 {
        (now_millis - self.created_at_millis).max(0)
    }

    pub(crate) fn record_submission(&mut self) {
        self.submissions = self.submissions.saturating_add(1);
    }
}

impl Groupable for WorkItem {
    fn group(&self) -> &str {
        &self.group
    }

    fn created_at_millis(&self) -> i64 {
        self.created_at_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_item_is_stamped_now() {
        let before = Utc::now().timestamp_millis();
        let item = WorkItem::new("a", json!({}));
        let after = Utc::now().timestamp_millis();

        assert!(item.created_at_millis >= before && item.created_at_millis <= after);
        assert_eq!(item.submissions, 0);
        assert!(!item.recovered);
    }

    #[test]
    fn test_ids_are_unique() {
        let first = WorkItem::new("a", json!(1));
        let second = WorkItem::new("a", json!(2));
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_age_never_negative() {
        let item = WorkItem::new("a", json!({})).with_created_at(1_000);
        assert_eq!(item.age_millis(1_500), 500);
        assert_eq!(item.age_millis(500), 0);
    }

    #[test]
    fn test_recovery_flags() {
        let mut item = WorkItem::new("a", json!({}));
        item.mark_recovered();
        item.record_submission();
        item.record_submission();

        assert!(item.recovered);
        assert_eq!(item.submissions, 2);
    }

    #[test]
    fn test_missing_flags_default_on_deserialize() {
        let raw = json!({
            "id": Uuid::nil(),
            "group": "g",
            "created_at_millis": 10,
            "payload": {"k": "v"}
        });

        let item: WorkItem = serde_json::from_value(raw).unwrap();
        assert_eq!(item.group(), "g");
        assert!(!item.recovered);
        assert_eq!(item.submissions, 0);
    }
}

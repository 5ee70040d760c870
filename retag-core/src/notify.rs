//! Typed parser notifications.
//!
//! Parsers report anomalies as notifications instead of failing outright:
//! a critical notification records a serious problem but does not by itself
//! stop processing. Each container keeps one list; sub-parsers keep their
//! own and fold them upward when their result is consumed.

use std::fmt;

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational message.
    Info,
    /// Unusual structure that could be handled.
    Warning,
    /// Serious problem; the affected entry may be wrong or missing.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A single parser message, keyed by a context description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Message severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// What the parser was doing, e.g. `"parsing Matroska container header"`.
    pub context: &'static str,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.context, self.message)
    }
}

/// Append-only list of notifications with a worst-severity aggregate.
#[derive(Debug, Clone, Default)]
pub struct NotificationList {
    entries: Vec<Notification>,
}

impl NotificationList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a notification.
    pub fn add(&mut self, severity: Severity, context: &'static str, message: impl Into<String>) {
        self.entries.push(Notification {
            severity,
            message: message.into(),
            context,
        });
    }

    /// Appends an informational message.
    pub fn info(&mut self, context: &'static str, message: impl Into<String>) {
        self.add(Severity::Info, context, message);
    }

    /// Appends a warning.
    pub fn warning(&mut self, context: &'static str, message: impl Into<String>) {
        self.add(Severity::Warning, context, message);
    }

    /// Appends a critical message.
    pub fn critical(&mut self, context: &'static str, message: impl Into<String>) {
        self.add(Severity::Critical, context, message);
    }

    /// Moves all notifications out of `other` into this list.
    pub fn take_from(&mut self, other: &mut NotificationList) {
        self.entries.append(&mut other.entries);
    }

    /// Returns the recorded notifications.
    pub fn entries(&self) -> &[Notification] {
        &self.entries
    }

    /// Returns the highest severity seen, if any notification was recorded.
    pub fn worst_severity(&self) -> Option<Severity> {
        self.entries.iter().map(|n| n.severity).max()
    }

    /// Returns whether any critical notification was recorded.
    pub fn has_critical(&self) -> bool {
        self.worst_severity() == Some(Severity::Critical)
    }

    /// Returns whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of recorded notifications.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes all notifications.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_severity() {
        let mut list = NotificationList::new();
        assert_eq!(list.worst_severity(), None);

        list.info("test", "a");
        assert_eq!(list.worst_severity(), Some(Severity::Info));

        list.critical("test", "b");
        list.warning("test", "c");
        assert_eq!(list.worst_severity(), Some(Severity::Critical));
        assert!(list.has_critical());
    }

    #[test]
    fn test_take_from() {
        let mut parent = NotificationList::new();
        let mut child = NotificationList::new();
        child.warning("child", "something odd");

        parent.take_from(&mut child);
        assert!(child.is_empty());
        assert_eq!(parent.len(), 1);
        assert_eq!(parent.entries()[0].context, "child");
    }

    #[test]
    fn test_display() {
        let mut list = NotificationList::new();
        list.critical("validating index", "cue points nowhere");
        assert_eq!(
            list.entries()[0].to_string(),
            "[critical] validating index: cue points nowhere"
        );
    }
}

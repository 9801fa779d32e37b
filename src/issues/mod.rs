//! Issues and notifications — the records the dispatcher projects job state onto.

pub mod model;

pub use model::{Issue, IssueStatus, NewIssue, NewNotification, Notification, NotificationKind};

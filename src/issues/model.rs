//! Issue and notification records written by the dispatcher.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest excerpt of agent output quoted in a notification message.
const MESSAGE_EXCERPT_CHARS: usize = 280;

/// Lifecycle state of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Completed,
    Closed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown issue status: {other}")),
        }
    }
}

/// A task a user opened for the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub id: i64,
    pub project_id: i64,
    /// Owner; notifications are addressed here.
    pub user_id: i64,
    pub title: String,
    pub body: Option<String>,
    pub status: IssueStatus,
    pub ai_session_id: Option<String>,
    pub ai_result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    /// Task description handed to the agent: title, then body.
    pub fn prompt(&self) -> String {
        match self.body.as_deref().map(str::trim) {
            Some(body) if !body.is_empty() => format!("{}\n\n{}", self.title, body),
            _ => self.title.clone(),
        }
    }
}

/// Fields for inserting an issue.
#[derive(Debug, Clone)]
pub struct NewIssue {
    pub project_id: i64,
    pub user_id: i64,
    pub title: String,
    pub body: Option<String>,
}

impl NewIssue {
    pub fn new(project_id: i64, user_id: i64, title: impl Into<String>) -> Self {
        Self {
            project_id,
            user_id,
            title: title.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Kind of lifecycle event a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    AiStarted,
    IssueCompleted,
    IssueFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiStarted => "ai_started",
            Self::IssueCompleted => "issue_completed",
            Self::IssueFailed => "issue_failed",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai_started" => Ok(Self::AiStarted),
            "issue_completed" => Ok(Self::IssueCompleted),
            "issue_failed" => Ok(Self::IssueFailed),
            other => Err(format!("unknown notification type: {other}")),
        }
    }
}

/// A persisted in-app notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub issue_id: Option<i64>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields for appending a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub user_id: i64,
    pub issue_id: Option<i64>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
}

impl NewNotification {
    pub fn ai_started(issue: &Issue, attempt: u32, max_attempts: u32) -> Self {
        Self {
            user_id: issue.user_id,
            issue_id: Some(issue.id),
            kind: NotificationKind::AiStarted,
            title: format!("AI started working on \"{}\"", issue.title),
            message: format!("Attempt {attempt} of {max_attempts} has started."),
        }
    }

    pub fn issue_completed(issue: &Issue, result: &str) -> Self {
        Self {
            user_id: issue.user_id,
            issue_id: Some(issue.id),
            kind: NotificationKind::IssueCompleted,
            title: format!("\"{}\" is done", issue.title),
            message: excerpt(result),
        }
    }

    pub fn issue_failed(issue: &Issue, attempts: u32, error: &str) -> Self {
        Self {
            user_id: issue.user_id,
            issue_id: Some(issue.id),
            kind: NotificationKind::IssueFailed,
            title: format!("\"{}\" could not be completed", issue.title),
            message: format!("Failed after {attempts} attempt(s): {}", excerpt(error)),
        }
    }
}

/// Cut text to a notification-sized excerpt on a char boundary.
fn excerpt(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= MESSAGE_EXCERPT_CHARS {
        text.to_string()
    } else {
        format!(
            "{}...",
            text.chars().take(MESSAGE_EXCERPT_CHARS).collect::<String>()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(body: Option<&str>) -> Issue {
        let now = Utc::now();
        Issue {
            id: 42,
            project_id: 1,
            user_id: 7,
            title: "Fix login".into(),
            body: body.map(String::from),
            status: IssueStatus::Open,
            ai_session_id: None,
            ai_result: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn prompt_joins_title_and_body() {
        assert_eq!(
            issue(Some("Users get a 500")).prompt(),
            "Fix login\n\nUsers get a 500"
        );
        assert_eq!(issue(None).prompt(), "Fix login");
        assert_eq!(issue(Some("   ")).prompt(), "Fix login");
    }

    #[test]
    fn notifications_address_issue_owner() {
        let i = issue(None);
        let n = NewNotification::ai_started(&i, 1, 3);
        assert_eq!(n.user_id, 7);
        assert_eq!(n.issue_id, Some(42));
        assert_eq!(n.kind, NotificationKind::AiStarted);
        assert!(n.message.contains("1 of 3"));
    }

    #[test]
    fn long_messages_are_excerpted() {
        let i = issue(None);
        let long = "é".repeat(1000);
        let n = NewNotification::issue_completed(&i, &long);
        assert!(n.message.ends_with("..."));
        assert_eq!(n.message.chars().count(), MESSAGE_EXCERPT_CHARS + 3);
    }

    #[test]
    fn kind_and_status_strings() {
        assert_eq!(NotificationKind::IssueFailed.as_str(), "issue_failed");
        assert_eq!(
            "in_progress".parse::<IssueStatus>().unwrap(),
            IssueStatus::InProgress
        );
        assert!("archived".parse::<IssueStatus>().is_err());
    }
}

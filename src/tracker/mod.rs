pub mod jira;
pub mod retry;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::AppConfig;
use crate::error::{ConfigError, TrackerError};
use crate::model::issue::{AttachmentRecord, IssueSnapshot, Side};

/// Filter for a bulk issue query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueQuery {
    pub project_key: String,
    pub issue_types: Vec<String>,
    /// Relative JQL window such as `1d`; only issues updated within it match.
    pub updated_within: Option<String>,
    /// Only issues where this field is set.
    pub require_field: Option<String>,
}

/// One issue-tracker instance as seen by the sync engine.
#[async_trait]
pub trait Tracker: Send + Sync {
    fn name(&self) -> &str;
    fn side(&self) -> Side;
    fn project_key(&self) -> &str;

    /// Verify credentials, returning the account's display name.
    async fn check_connection(&self) -> Result<String, TrackerError> {
        Ok(String::new())
    }

    async fn fetch_issues(&self, query: &IssueQuery) -> Result<Vec<IssueSnapshot>, TrackerError>;

    async fn fetch_issue_by_correlation_field(
        &self,
        field_id: &str,
        value: &str,
    ) -> Result<Option<IssueSnapshot>, TrackerError>;

    async fn write_field(&self, issue_key: &str, field_id: &str, value: &Value) -> Result<(), TrackerError>;

    async fn create_issue(
        &self,
        issue_type: &str,
        initial_fields: &Map<String, Value>,
    ) -> Result<IssueSnapshot, TrackerError>;

    async fn list_attachments(&self, issue_key: &str) -> Result<Vec<AttachmentRecord>, TrackerError>;

    async fn download_attachment(&self, record: &AttachmentRecord) -> Result<Vec<u8>, TrackerError>;

    async fn upload_attachment(
        &self,
        issue_key: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<(), TrackerError>;
}


pub fn create_trackers(config: &AppConfig) -> Result<(jira::JiraClient, jira::JiraClient), ConfigError> {
    let source = jira::JiraClient::new(Side::Source, &config.source, &config.run)?;
    let target = jira::JiraClient::new(Side::Target, &config.target, &config.run)?;
    Ok((source, target))
}

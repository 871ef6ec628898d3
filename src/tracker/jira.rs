use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::retry::{with_retry, RetryConfig};
use super::{IssueQuery, Tracker};
use crate::config::{AuthConfig, InstanceConfig, RunSettings};
use crate::error::{ConfigError, TrackerError};
use crate::model::issue::{parse_timestamp, AttachmentRecord, IssueSnapshot, Side};

const PAGE_SIZE: usize = 100;

/// Jira Cloud REST v3 client for one side of the sync.
pub struct JiraClient {
    side: Side,
    name: String,
    project_key: String,
    base_url: String,
    auth_header: String,
    client: reqwest::Client,
    permits: Semaphore,
    retry: RetryConfig,
}

impl JiraClient {
    pub fn new(side: Side, instance: &InstanceConfig, run: &RunSettings) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(run.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::InvalidInstance {
                instance: side.to_string(),
                message: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self {
            side,
            name: format!("{side} ({})", instance.project_key),
            project_key: instance.project_key.clone(),
            base_url: base_url(&instance.auth),
            auth_header: auth_header(&instance.auth),
            client,
            permits: Semaphore::new(run.max_in_flight_requests.max(1)),
            retry: RetryConfig::new(run.max_retries.saturating_add(1)),
        })
    }

    /// Send a request built fresh for every attempt, under the in-flight limit.
    async fn send<F>(&self, what: &str, build: F) -> Result<reqwest::Response, TrackerError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        self.send_with(&self.retry_policy(true), what, build).await
    }

    /// Single attempt for POSTs that add something: a lost response may still
    /// have created the issue or attachment.
    async fn send_once<F>(&self, what: &str, build: F) -> Result<reqwest::Response, TrackerError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        self.send_with(&self.retry_policy(false), what, build).await
    }

    fn retry_policy(&self, repeatable: bool) -> RetryConfig {
        if repeatable {
            self.retry
        } else {
            RetryConfig::new(1)
        }
    }

    async fn send_with<F>(&self, retry: &RetryConfig, what: &str, build: F) -> Result<reqwest::Response, TrackerError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TrackerError::Transient("request limiter closed".into()))?;
        with_retry(retry, what, || {
            let request = build()
                .header("Authorization", &self.auth_header)
                .header("Accept", "application/json");
            async move { ensure_success(request.send().await?).await }
        })
        .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, what: &str, url: &str) -> Result<T, TrackerError> {
        let resp = self.send(what, || self.client.get(url)).await?;
        resp.json::<T>()
            .await
            .map_err(|e| TrackerError::Decode(format!("{what}: {e}")))
    }

    async fn search(&self, jql: &str) -> Result<Vec<IssueSnapshot>, TrackerError> {
        let mut issues = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/search/jql?jql={}&maxResults={PAGE_SIZE}&fields=*all",
                self.base_url,
                urlencoding::encode(jql)
            );
            if let Some(token) = &page_token {
                url.push_str("&nextPageToken=");
                url.push_str(&urlencoding::encode(token));
            }
            let page: SearchResponse = self.get_json("search", &url).await?;
            for issue in page.issues {
                issues.push(issue.into_snapshot()?);
            }
            match page.next_page_token {
                Some(token) if !page.is_last.unwrap_or(false) => page_token = Some(token),
                _ => break,
            }
        }
        tracing::debug!(tracker = %self.name, count = issues.len(), "search finished");
        Ok(issues)
    }

    async fn get_issue(&self, key: &str, fields: &str) -> Result<JiraIssue, TrackerError> {
        let url = format!("{}/issue/{}?fields={fields}", self.base_url, urlencoding::encode(key));
        self.get_json("get issue", &url).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    issues: Vec<JiraIssue>,
    next_page_token: Option<String>,
    is_last: Option<bool>,
}

#[derive(Deserialize)]
struct JiraIssue {
    key: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl JiraIssue {
    fn into_snapshot(self) -> Result<IssueSnapshot, TrackerError> {
        let updated = self
            .fields
            .get("updated")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .ok_or_else(|| TrackerError::Decode(format!("{}: missing or unreadable `updated`", self.key)))?;
        let issue_type = self
            .fields
            .get("issuetype")
            .and_then(|t| t.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(IssueSnapshot {
            key: self.key,
            fields: self.fields,
            updated,
            issue_type,
        })
    }
}

#[derive(Deserialize)]
struct JiraAttachment {
    filename: String,
    content: String,
}

#[derive(Deserialize)]
struct CreatedIssue {
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Myself {
    display_name: Option<String>,
    account_id: Option<String>,
}

#[async_trait]
impl Tracker for JiraClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn side(&self) -> Side {
        self.side
    }

    fn project_key(&self) -> &str {
        &self.project_key
    }

    async fn check_connection(&self) -> Result<String, TrackerError> {
        let url = format!("{}/myself", self.base_url);
        let me: Myself = self.get_json("myself", &url).await?;
        Ok(me.display_name.or(me.account_id).unwrap_or_default())
    }

    async fn fetch_issues(&self, query: &IssueQuery) -> Result<Vec<IssueSnapshot>, TrackerError> {
        self.search(&build_jql(query)).await
    }

    async fn fetch_issue_by_correlation_field(
        &self,
        field_id: &str,
        value: &str,
    ) -> Result<Option<IssueSnapshot>, TrackerError> {
        let operator = if field_id.starts_with("customfield_") { "~" } else { "=" };
        let jql = format!(
            "project = {} AND {} {operator} {}",
            quote(&self.project_key),
            jql_field(field_id),
            quote(value)
        );
        // `~` is a text search, so confirm the exact value before trusting a hit.
        let found = self.search(&jql).await?.into_iter().find(|issue| {
            issue
                .field(field_id)
                .and_then(|v| v.as_str().or_else(|| v.get("value").and_then(Value::as_str)))
                .map_or(false, |stored| stored.trim() == value)
        });
        Ok(found)
    }

    async fn write_field(&self, issue_key: &str, field_id: &str, value: &Value) -> Result<(), TrackerError> {
        let url = format!("{}/issue/{}", self.base_url, urlencoding::encode(issue_key));
        let body = json!({ "fields": { field_id: value } });
        self.send("update issue", || self.client.put(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn create_issue(
        &self,
        issue_type: &str,
        initial_fields: &Map<String, Value>,
    ) -> Result<IssueSnapshot, TrackerError> {
        let mut fields = initial_fields.clone();
        fields.insert("project".into(), json!({ "key": self.project_key }));
        fields.insert("issuetype".into(), json!({ "name": issue_type }));
        let body = json!({ "fields": fields });
        let url = format!("{}/issue", self.base_url);

        let resp = self.send_once("create issue", || self.client.post(&url).json(&body)).await?;
        let created: CreatedIssue = resp
            .json()
            .await
            .map_err(|e| TrackerError::Decode(format!("create issue: {e}")))?;
        tracing::info!(tracker = %self.name, key = %created.key, "created issue");
        self.get_issue(&created.key, "*all").await?.into_snapshot()
    }

    async fn list_attachments(&self, issue_key: &str) -> Result<Vec<AttachmentRecord>, TrackerError> {
        let issue = self.get_issue(issue_key, "attachment").await?;
        let raw = issue.fields.get("attachment").cloned().unwrap_or(Value::Null);
        if raw.is_null() {
            return Ok(Vec::new());
        }
        let attachments: Vec<JiraAttachment> =
            serde_json::from_value(raw).map_err(|e| TrackerError::Decode(format!("attachments of {issue_key}: {e}")))?;
        Ok(attachments
            .into_iter()
            .map(|a| AttachmentRecord {
                owning_issue_key: issue_key.to_string(),
                filename: a.filename,
                bytes_ref: a.content,
                origin_side: self.side,
            })
            .collect())
    }

    async fn download_attachment(&self, record: &AttachmentRecord) -> Result<Vec<u8>, TrackerError> {
        let resp = self
            .send("download attachment", || self.client.get(&record.bytes_ref))
            .await?;
        let bytes = resp.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn upload_attachment(
        &self,
        issue_key: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<(), TrackerError> {
        let url = format!("{}/issue/{}/attachments", self.base_url, urlencoding::encode(issue_key));
        self.send_once("upload attachment", || {
            let part = reqwest::multipart::Part::bytes(content.clone()).file_name(filename.to_string());
            let form = reqwest::multipart::Form::new().part("file", part);
            self.client
                .post(&url)
                .header("X-Atlassian-Token", "no-check")
                .multipart(form)
        })
        .await?;
        Ok(())
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, TrackerError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail: String = body.chars().take(300).collect();
    Err(TrackerError::from_status(status.as_u16(), detail))
}

fn base_url(auth: &AuthConfig) -> String {
    match auth {
        AuthConfig::Basic { domain, .. } => {
            let domain = domain.trim().trim_end_matches('/');
            if domain.contains("://") {
                format!("{domain}/rest/api/3")
            } else if domain.contains('.') {
                format!("https://{domain}/rest/api/3")
            } else {
                format!("https://{domain}.atlassian.net/rest/api/3")
            }
        }
        AuthConfig::Bearer { cloud_id, .. } => {
            format!("https://api.atlassian.com/ex/jira/{}/rest/api/3", cloud_id.trim())
        }
    }
}

fn auth_header(auth: &AuthConfig) -> String {
    match auth {
        AuthConfig::Basic { email, api_token, .. } => {
            let creds = format!("{email}:{api_token}");
            let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
            format!("Basic {encoded}")
        }
        AuthConfig::Bearer { api_token, .. } => format!("Bearer {api_token}"),
    }
}

/// `customfield_10042` is addressed as `cf[10042]` in JQL.
fn jql_field(field_id: &str) -> String {
    match field_id.strip_prefix("customfield_") {
        Some(id) => format!("cf[{id}]"),
        None => field_id.to_string(),
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn build_jql(query: &IssueQuery) -> String {
    let mut clauses = vec![format!("project = {}", quote(&query.project_key))];
    if !query.issue_types.is_empty() {
        let types: Vec<String> = query.issue_types.iter().map(|t| quote(t)).collect();
        clauses.push(format!("issuetype in ({})", types.join(", ")));
    }
    if let Some(window) = &query.updated_within {
        clauses.push(format!("updated >= -{}", window.trim().trim_start_matches('-')));
    }
    if let Some(field) = &query.require_field {
        clauses.push(format!("{} is not EMPTY", jql_field(field)));
    }
    format!("{} ORDER BY created ASC", clauses.join(" AND "))
}

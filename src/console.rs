//! Network-analytics console REST client.
//!
//! Group membership lives in the console's "tag" documents (one host group
//! per tag). The session is cookie-based; we re-authenticate on a timer kept
//! safely below the console's idle timeout, and once more inline if a call
//! still comes back 401. The controller never sees any of that.
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::directory::{GroupDirectory, TagRecord, TagSummary};
use crate::error::{Result, SgtSyncError};
use crate::rate_meter::RateMeter;
use crate::settings::ConsoleSettings;

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

pub struct ConsoleClient {
    settings: ConsoleSettings,
    http: reqwest::Client,
    tag_list: Vec<TagSummary>,
    tenant_id: String,
    meter: RateMeter,
    last_auth: i64,
}

impl ConsoleClient {
    pub fn new(settings: ConsoleSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;
        // backdate so the first call authenticates
        let last_auth = Utc::now().timestamp() - 2 * settings.reauth_seconds;
        Ok(Self {
            settings,
            http,
            tag_list: Vec::new(),
            tenant_id: String::new(),
            meter: RateMeter::default(),
            last_auth,
        })
    }

    fn auth_url(&self) -> String {
        format!("https://{}/token/v2/authenticate", self.settings.host)
    }

    fn tenants_url(&self) -> String {
        format!("https://{}/sw-reporting/v1/tenants/", self.settings.host)
    }

    fn tags_url(&self) -> String {
        format!(
            "https://{}/smc-configuration/rest/v1/tenants/{}/tags",
            self.settings.host, self.tenant_id
        )
    }

    fn tag_url(&self, tag_id: &str) -> String {
        format!("{}/{}", self.tags_url(), tag_id)
    }

    /// POST the login form unless the session is still fresh.
    async fn authenticate(&mut self, force: bool) -> Result<()> {
        let now = Utc::now().timestamp();
        if !force && now - self.last_auth < self.settings.reauth_seconds {
            return Ok(());
        }
        self.meter.monitor();
        let response = self
            .http
            .post(self.auth_url())
            .form(&[
                ("username", self.settings.user.as_str()),
                ("password", self.settings.password.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        debug!(status = %response.status(), "console session established");
        self.last_auth = now;
        Ok(())
    }

    /// Run one request through the session: authenticate if due, send, and
    /// on a 401 re-authenticate once and retry before reporting failure.
    async fn send<F>(&mut self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.authenticate(false).await?;
        self.meter.monitor();
        let response = build(&self.http).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        warn!("console session expired early, re-authenticating");
        self.authenticate(true).await?;
        self.meter.monitor();
        Ok(build(&self.http).send().await?)
    }

    /// Authenticate, pick the tenant, and load the tag list. Must run before
    /// the client is handed to the controller.
    pub async fn bootstrap(&mut self) -> Result<()> {
        self.authenticate(true).await?;
        self.discover_tenant().await?;
        self.refresh_tag_list().await?;
        Ok(())
    }

    /// First tenant wins; multi-tenant consoles are not a deployment target.
    async fn discover_tenant(&mut self) -> Result<()> {
        let url = self.tenants_url();
        let response = self.send(|http| http.get(&url)).await?.error_for_status()?;
        let envelope: DataEnvelope<Vec<Value>> = response.json().await?;
        let tenant = envelope
            .data
            .first()
            .and_then(|tenant| tenant.get("id"))
            .ok_or_else(|| SgtSyncError::RemoteFetch("console reported no tenants".to_string()))?;
        self.tenant_id = match tenant {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        debug!(tenant = %self.tenant_id, "console tenant selected");
        Ok(())
    }

    /// Reload the full tag list. Also called when a lookup 404s or a create
    /// fails, in case someone changed groups behind our back.
    async fn refresh_tag_list(&mut self) -> Result<()> {
        let url = format!("{}/", self.tags_url());
        let response = self.send(|http| http.get(&url)).await?.error_for_status()?;
        let envelope: DataEnvelope<Vec<TagSummary>> = response.json().await?;
        self.tag_list = envelope.data;
        debug!(tags = self.tag_list.len(), "tag list refreshed");
        Ok(())
    }

    fn find_tag_id(&self, name: &str) -> Option<String> {
        self.tag_list
            .iter()
            .find(|tag| tag.name == name)
            .map(|tag| tag.id.clone())
    }

    /// Config sanity check: every parent group named in the configuration
    /// must already exist in the console.
    pub fn validate_parent_groups(&self, parents: &[&str]) -> Result<()> {
        for parent in parents {
            if self.find_tag_id(parent).is_none() {
                return Err(crate::config_error!(
                    "parent group >{}< does not exist in the console",
                    parent
                ));
            }
        }
        Ok(())
    }

    fn parent_group_for(&self, tag_name: &str) -> &str {
        self.settings
            .parent_groups
            .get(tag_name)
            .map(String::as_str)
            .unwrap_or(&self.settings.default_parent_group)
    }

    /// PUT the document and return the ranges the console now reports.
    async fn put_tag_document(&mut self, tag_id: &str, document: Value) -> Result<Vec<String>> {
        let url = self.tag_url(tag_id);
        let response = self.send(|http| http.put(&url).json(&document)).await?;
        if !response.status().is_success() {
            return Err(SgtSyncError::RemoteWrite(format!(
                "tag {} update rejected with status {}",
                tag_id,
                response.status()
            )));
        }
        let envelope: DataEnvelope<Value> = response.json().await?;
        let updated = TagRecord::from_value(envelope.data)
            .map_err(|err| SgtSyncError::RemoteWrite(err.to_string()))?;
        Ok(updated.ranges.unwrap_or_default())
    }
}

fn create_payload(tag_name: &str, parent_id: &str) -> Value {
    let stamp = Utc::now().format("%y/%m/%d %H:%M:%S");
    json!([{
        "name": tag_name,
        "location": "INSIDE",
        "description": format!("SGT group pushed from pxGrid, created: {}", stamp),
        "ranges": [],
        "hostBaselines": false,
        "suppressExcludedServices": true,
        "inverseSuppression": false,
        "hostTrap": false,
        "sendToCta": true,
        "parentId": parent_id,
    }])
}

#[async_trait]
impl GroupDirectory for ConsoleClient {
    async fn resolve_tag_id(&mut self, name: &str) -> Result<Option<String>> {
        // the tag list is held locally; resolution costs no remote call
        Ok(self.find_tag_id(name))
    }

    async fn create_tag(&mut self, name: &str) -> Result<String> {
        let parent_name = self.parent_group_for(name).to_string();
        let parent_id = self.find_tag_id(&parent_name).ok_or_else(|| {
            SgtSyncError::TagResolution(format!(
                "parent group {} vanished from the console",
                parent_name
            ))
        })?;
        let url = self.tags_url();
        let payload = create_payload(name, &parent_id);
        let response = self.send(|http| http.post(&url).json(&payload)).await?;
        if !response.status().is_success() {
            let status = response.status();
            // someone may have edited groups in the console; resync the list
            self.refresh_tag_list().await?;
            return Err(SgtSyncError::TagResolution(format!(
                "cannot create tag {}: status {}",
                name, status
            )));
        }
        let envelope: DataEnvelope<Vec<Value>> = response.json().await?;
        let created = envelope
            .data
            .into_iter()
            .next()
            .ok_or_else(|| SgtSyncError::TagResolution(format!("empty create reply for {}", name)))
            .and_then(|value| {
                TagRecord::from_value(value)
                    .map_err(|err| SgtSyncError::TagResolution(err.to_string()))
            })?;
        self.tag_list.push(TagSummary {
            id: created.id.clone(),
            name: name.to_string(),
        });
        Ok(created.id)
    }

    async fn fetch_tag_details(&mut self, tag_id: &str) -> Result<TagRecord> {
        let url = self.tag_url(tag_id);
        let response = self.send(|http| http.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            // stale local list; resync so the next resolution is honest
            self.refresh_tag_list().await?;
            return Err(SgtSyncError::RemoteFetch(format!(
                "tag {} not found in the console",
                tag_id
            )));
        }
        if !response.status().is_success() {
            return Err(SgtSyncError::RemoteFetch(format!(
                "tag {} fetch failed with status {}",
                tag_id,
                response.status()
            )));
        }
        let envelope: DataEnvelope<Value> = response.json().await?;
        TagRecord::from_value(envelope.data)
    }

    async fn add_ip_to_tag(&mut self, tag_id: &str, details: &TagRecord, ip: &str) -> Result<()> {
        let mut ranges = details.ranges.clone().unwrap_or_default();
        ranges.push(ip.to_string());
        let updated = self
            .put_tag_document(tag_id, details.document_with_ranges(&ranges))
            .await?;
        if !updated.iter().any(|range| range == ip) {
            return Err(SgtSyncError::RemoteWrite(format!(
                "console did not accept {} into tag {}",
                ip, tag_id
            )));
        }
        Ok(())
    }

    async fn remove_ip_from_tag(
        &mut self,
        tag_id: &str,
        details: &TagRecord,
        ip: &str,
    ) -> Result<()> {
        let ranges: Vec<String> = details
            .ranges
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|range| range != ip)
            .collect();
        let updated = self
            .put_tag_document(tag_id, details.document_with_ranges(&ranges))
            .await?;
        if updated.iter().any(|range| range == ip) {
            return Err(SgtSyncError::RemoteWrite(format!(
                "console still lists {} in tag {}",
                ip, tag_id
            )));
        }
        Ok(())
    }

    fn call_rate(&mut self) -> f64 {
        self.meter.rate()
    }

    fn call_index(&self) -> u64 {
        self.meter.index()
    }
}

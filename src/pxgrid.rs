//! pxGrid control-plane client.
//!
//! Before any session data flows, the agent has to be activated by the
//! controller, look up the session service and its pubsub service, and obtain
//! the access secret used as the websocket passcode. All of that is plain
//! REST against port 8910 with HTTP Basic plus a client certificate.
use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Result, SgtSyncError};
use crate::settings::PxGridSettings;

pub const SESSION_SERVICE: &str = "com.cisco.ise.session";

#[derive(Debug, Deserialize)]
pub struct AccountState {
    #[serde(rename = "accountState", default)]
    pub account_state: String,
}

impl AccountState {
    pub fn is_enabled(&self) -> bool {
        self.account_state == "ENABLED"
    }
}

#[derive(Debug, Deserialize)]
pub struct ServiceLookupResponse {
    #[serde(default)]
    pub services: Vec<Service>,
}

#[derive(Debug, Deserialize)]
pub struct Service {
    #[serde(rename = "nodeName", default)]
    pub node_name: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Service {
    pub fn property(&self, name: &str) -> Result<&str> {
        self.properties
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| {
                SgtSyncError::Transport(format!("service is missing the {} property", name))
            })
    }
}

#[derive(Debug, Deserialize)]
struct AccessSecretResponse {
    secret: String,
}

pub struct PxGridControl {
    settings: PxGridSettings,
    http: reqwest::Client,
}

impl PxGridControl {
    pub fn new(settings: &PxGridSettings) -> Result<Self> {
        let client_cert = std::fs::read(&settings.client_cert)?;
        let client_key = std::fs::read(&settings.client_key)?;
        let server_cert = std::fs::read(&settings.server_cert)?;
        let identity = reqwest::Identity::from_pkcs8_pem(&client_cert, &client_key)?;
        let root = reqwest::Certificate::from_pem(&server_cert)?;
        let http = reqwest::Client::builder()
            .identity(identity)
            .add_root_certificate(root)
            .build()?;
        Ok(Self {
            settings: settings.clone(),
            http,
        })
    }

    /// POST one control operation, trying each configured PSN in order.
    async fn control_request(&self, operation: &str, payload: Value) -> Result<Value> {
        let mut last_error = None;
        for host in &self.settings.hosts {
            let url = format!("https://{}:8910/pxgrid/control/{}", host, operation);
            debug!(%url, "pxgrid control request");
            let attempt = self
                .http
                .post(&url)
                .basic_auth(&self.settings.nodename, Some(&self.settings.password))
                .json(&payload)
                .send()
                .await
                .and_then(|response| response.error_for_status());
            match attempt {
                Ok(response) => return Ok(response.json().await?),
                Err(err) => {
                    warn!(host = host.as_str(), error = %err, "pxgrid node unreachable");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .map(SgtSyncError::from)
            .unwrap_or_else(|| SgtSyncError::Transport("no pxgrid hosts configured".to_string())))
    }

    /// Ask the controller to activate (or report on) this agent account.
    pub async fn account_activate(&self) -> Result<AccountState> {
        let mut payload = json!({});
        if !self.settings.node_description.is_empty() {
            payload["description"] = Value::from(self.settings.node_description.clone());
        }
        let value = self.control_request("AccountActivate", payload).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn service_lookup(&self, service_name: &str) -> Result<Service> {
        let value = self
            .control_request("ServiceLookup", json!({ "name": service_name }))
            .await?;
        let response: ServiceLookupResponse = serde_json::from_value(value)?;
        response.services.into_iter().next().ok_or_else(|| {
            SgtSyncError::Transport(format!("no instances of service {}", service_name))
        })
    }

    /// Secret used as the STOMP websocket passcode for `peer_node_name`.
    pub async fn access_secret(&self, peer_node_name: &str) -> Result<String> {
        let value = self
            .control_request("AccessSecret", json!({ "peerNodeName": peer_node_name }))
            .await?;
        let response: AccessSecretResponse = serde_json::from_value(value)?;
        Ok(response.secret)
    }
}

/// TLS connector for the pubsub websocket: same client identity, pxGrid
/// server certificate trusted as a root.
pub fn websocket_tls(settings: &PxGridSettings) -> Result<native_tls::TlsConnector> {
    let client_cert = std::fs::read(&settings.client_cert)?;
    let client_key = std::fs::read(&settings.client_key)?;
    let server_cert = std::fs::read(&settings.server_cert)?;
    let identity = native_tls::Identity::from_pkcs8(&client_cert, &client_key)?;
    let root = native_tls::Certificate::from_pem(&server_cert)?;
    let connector = native_tls::TlsConnector::builder()
        .identity(identity)
        .add_root_certificate(root)
        .build()?;
    Ok(connector)
}

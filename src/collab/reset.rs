//! Remote-state reset
//!
//! Deletes every item of each configured collection: list
//! `GET /<version>/<collection>`, then `DELETE` each `data[].id`.
//! Destructive; gated by configuration.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{HttpRequest, Method, ResourceClient, StateReset};
use crate::common::{snippet, Error, Result};

/// One collection to empty
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResetEndpoint {
    pub api_version: String,
    pub collection: String,
}

impl ResetEndpoint {
    pub fn new(api_version: &str, collection: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            collection: collection.to_string(),
        }
    }

    fn path(&self) -> String {
        format!("/{}/{}", self.api_version.trim_matches('/'), self.collection.trim_matches('/'))
    }
}

/// Collections emptied when none are configured, in deletion order
pub fn default_reset_endpoints() -> Vec<ResetEndpoint> {
    vec![
        ResetEndpoint::new("v2", "application-auth-strategies"),
        ResetEndpoint::new("v3", "apis"),
        ResetEndpoint::new("v3", "portals"),
    ]
}

/// Reset through the resource client. Without a client (no credentials)
/// the reset is skipped with a warning.
pub struct ApiReset {
    client: Option<Arc<dyn ResourceClient>>,
    endpoints: Vec<ResetEndpoint>,
}

impl ApiReset {
    pub fn new(client: Option<Arc<dyn ResourceClient>>, endpoints: Vec<ResetEndpoint>) -> Self {
        Self { client, endpoints }
    }

    async fn delete_all(&self, client: &dyn ResourceClient, endpoint: &ResetEndpoint) -> Result<()> {
        let path = endpoint.path();
        info!("Fetching {} for deletion...", endpoint.collection);

        let listed = client
            .send(&HttpRequest {
                method: Method::Get,
                path: path.clone(),
                global: false,
                body: None,
            })
            .await?;
        if !(200..300).contains(&listed.status) {
            return Err(Error::HttpStatus {
                status: listed.status,
                expected: 200,
                body: snippet(&listed.body),
            });
        }

        let ids: Vec<String> = listed
            .parsed()
            .and_then(|v| v.get("data").and_then(|d| d.as_array()).cloned())
            .unwrap_or_default()
            .iter()
            .filter_map(|item| item.get("id").and_then(|id| id.as_str()))
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();
        if ids.is_empty() {
            info!("No {} found", endpoint.collection);
            return Ok(());
        }
        info!("Found {} {}", ids.len(), endpoint.collection);

        for id in ids {
            let request = HttpRequest {
                method: Method::Delete,
                path: format!("{}/{}", path, id),
                global: false,
                body: None,
            };
            match client.send(&request).await {
                Ok(resp) if (200..300).contains(&resp.status) => {
                    debug!("deleted {} {}", endpoint.collection, id)
                }
                Ok(resp) => warn!(
                    "delete {} {} failed: status {}",
                    endpoint.collection, id, resp.status
                ),
                Err(e) => warn!("delete {} {} failed: {}", endpoint.collection, id, e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateReset for ApiReset {
    async fn reset(&self, label: &str) -> Result<()> {
        let Some(client) = &self.client else {
            warn!("reset requested ({}), but no API token is configured; skipping reset", label);
            return Ok(());
        };
        info!("Resetting remote state ({})", label);
        for endpoint in &self.endpoints {
            self.delete_all(client.as_ref(), endpoint).await?;
        }
        info!("Reset complete");
        Ok(())
    }
}

/// Reset disabled by configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReset;

#[async_trait]
impl StateReset for NoReset {
    async fn reset(&self, label: &str) -> Result<()> {
        info!("Reset disabled; ignoring resetOrg ({})", label);
        Ok(())
    }
}

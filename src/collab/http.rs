//! Resource-creation calls
//!
//! Logical resource names resolve through a fixed endpoint table to a
//! method, a path template and the path parameters it needs.
//! [`HttpResourceClient`] is the reqwest-backed transport.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::{HttpRequest, HttpResponse, ResourceClient};
use crate::common::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// Success status assumed when a command does not set `expectStatus`
    pub fn default_status(&self) -> u16 {
        match self {
            Method::Post => 201,
            _ => 200,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical resource and where it is created
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    /// Accepted spellings, lowercase
    pub names: &'static [&'static str],
    pub method: Method,
    /// Path with `{param}` placeholders
    pub path: &'static str,
    pub params: &'static [&'static str],
    /// Served from the global base URL
    pub global: bool,
}

static ENDPOINTS: &[Endpoint] = &[
    Endpoint {
        names: &["portal", "portals"],
        method: Method::Post,
        path: "/v3/portals",
        params: &[],
        global: false,
    },
    Endpoint {
        names: &["api", "apis"],
        method: Method::Post,
        path: "/v3/apis",
        params: &[],
        global: false,
    },
    Endpoint {
        names: &["auth-strategy", "auth_strategy", "authstrategy"],
        method: Method::Post,
        path: "/v2/application-auth-strategies",
        params: &[],
        global: false,
    },
    Endpoint {
        names: &["control-plane", "control_plane", "controlplane"],
        method: Method::Post,
        path: "/v2/control-planes",
        params: &[],
        global: false,
    },
    Endpoint {
        names: &[
            "gateway-service",
            "gateway_service",
            "gatewayservice",
            "core-entity-service",
        ],
        method: Method::Post,
        path: "/v2/control-planes/{controlPlaneId}/core-entities/services",
        params: &["controlPlaneId"],
        global: false,
    },
    Endpoint {
        names: &["portal-team-developer", "portal_team_developer"],
        method: Method::Post,
        path: "/v3/portals/{portalId}/teams/{teamId}/developers",
        params: &["portalId", "teamId"],
        global: false,
    },
    Endpoint {
        names: &["system-account", "system_account", "systemaccount"],
        method: Method::Post,
        path: "/v3/system-accounts",
        params: &[],
        global: true,
    },
    Endpoint {
        names: &["team", "teams"],
        method: Method::Post,
        path: "/v3/teams",
        params: &[],
        global: true,
    },
];

/// Look up a logical resource name (case-insensitive, trimmed)
pub fn find_endpoint(resource: &str) -> Option<&'static Endpoint> {
    let key = resource.trim().to_ascii_lowercase();
    ENDPOINTS.iter().find(|e| e.names.contains(&key.as_str()))
}

/// All endpoints, for listings
pub fn endpoints() -> &'static [Endpoint] {
    ENDPOINTS
}

impl Endpoint {
    /// Substitute path parameters. Every declared parameter must be present
    /// and non-empty; values are percent-encoded.
    pub fn expand_path(&self, params: &BTreeMap<String, String>) -> Result<String> {
        let mut path = self.path.to_string();
        for key in self.params {
            let value = params
                .get(*key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    Error::InvalidScenario(format!(
                        "missing path param '{}' for {}",
                        key, self.path
                    ))
                })?;
            path = path.replace(&format!("{{{}}}", key), &urlencoding::encode(value));
        }
        if let Some(start) = path.find('{') {
            let end = path[start..].find('}').map(|e| start + e + 1).unwrap_or(path.len());
            return Err(Error::InvalidScenario(format!(
                "unresolved placeholder {} in {}",
                &path[start..end],
                self.path
            )));
        }
        Ok(path)
    }
}

/// reqwest-backed client with bearer authentication
pub struct HttpResourceClient {
    client: reqwest::Client,
    base_url: String,
    global_base_url: String,
    token: String,
}

impl HttpResourceClient {
    pub fn new(
        base_url: &str,
        global_base_url: &str,
        token: String,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            global_base_url: global_base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, request: &HttpRequest) -> String {
        let base = if request.global {
            &self.global_base_url
        } else {
            &self.base_url
        };
        format!("{}{}", base, request.path)
    }
}

#[async_trait]
impl ResourceClient for HttpResourceClient {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let url = self.url(request);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, &url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json");
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!("HTTP {} {}", request.method, url);
        let start = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Transport(format!("{} {}: request timed out: {}", request.method, url, e))
            } else {
                Error::Transport(format!("{} {}: {}", request.method, url, e))
            }
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response body: {}", e)))?;
        let duration = start.elapsed();
        debug!("HTTP {} {} -> {} in {:?}", request.method, url, status, duration);

        Ok(HttpResponse {
            status,
            body,
            url,
            duration,
        })
    }
}

/// Stands in when no API token is configured; every call is refused
#[derive(Debug, Clone, Copy, Default)]
pub struct Unauthenticated;

#[async_trait]
impl ResourceClient for Unauthenticated {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        Err(Error::Config(format!(
            "{} {} requires an API token (set E2E_API_TOKEN)",
            request.method, request.path
        )))
    }
}

//! Best-effort lookup of debuggable targets over the DevTools HTTP endpoint.
//!
//! Both helpers swallow transport and shape problems: an unreachable or
//! misbehaving endpoint yields an empty answer, never an error, because this
//! is a convenience lookup rather than a correctness path.

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

/// One debuggable target as reported by `GET /json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetInfo {
    pub description: String,
    pub devtools_frontend_url: String,
    pub favicon_url: String,
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub web_socket_debugger_url: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct VersionInfo {
    web_socket_debugger_url: String,
}

fn endpoint(host: &str, port: u16, path: &str) -> Option<Url> {
    match Url::parse(&format!("http://{host}:{port}/{path}")) {
        Ok(url) => Some(url),
        Err(err) => {
            warn!(target: "cdp-discovery", ?err, host, "invalid discovery endpoint");
            None
        }
    }
}

/// List the endpoint's debuggable targets.
pub async fn list_targets(host: &str, port: u16) -> Vec<TargetInfo> {
    let Some(url) = endpoint(host, port, "json") else {
        return Vec::new();
    };
    match fetch_targets(url.as_str()).await {
        Ok(targets) => targets,
        Err(err) => {
            warn!(target: "cdp-discovery", ?err, "target listing failed");
            Vec::new()
        }
    }
}

async fn fetch_targets(url: &str) -> Result<Vec<TargetInfo>, reqwest::Error> {
    reqwest::get(url).await?.json().await
}

/// Browser-level WebSocket URL from `GET /json/version`, if reachable.
pub async fn browser_ws_url(host: &str, port: u16) -> Option<String> {
    let url = endpoint(host, port, "json/version")?;
    match fetch_version(url.as_str()).await {
        Ok(version) if !version.web_socket_debugger_url.is_empty() => {
            Some(version.web_socket_debugger_url)
        }
        Ok(_) => None,
        Err(err) => {
            warn!(target: "cdp-discovery", ?err, "version lookup failed");
            None
        }
    }
}

async fn fetch_version(url: &str) -> Result<VersionInfo, reqwest::Error> {
    reqwest::get(url).await?.json().await
}

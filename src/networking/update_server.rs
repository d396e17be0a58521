use log::debug;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value;

use super::{NetworkClient, endpoint};
use crate::error::{Result, SyncError};

/// Answer of `GET /check-update/{client}/{version}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct UpdateCheck {
    #[serde(default)]
    pub update_available: bool,
    #[serde(default)]
    pub versao: Option<i64>,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl UpdateCheck {
    /// The advertised release, when the answer is complete enough to act on.
    pub fn release(&self) -> Result<Option<(i64, &str)>> {
        if !self.update_available {
            return Ok(None);
        }
        match (self.versao, self.download_url.as_deref()) {
            (Some(version), Some(url)) if !url.trim().is_empty() => Ok(Some((version, url))),
            _ => Err(SyncError::transient(
                "update server announced an update without version or download_url",
            )),
        }
    }
}

/// The HTTP update server: content bundles, confirmations and weather.
#[derive(Clone)]
pub struct UpdateServer {
    net: NetworkClient,
    base_url: String,
}

impl UpdateServer {
    pub fn new(net: NetworkClient, base_url: impl Into<String>) -> Self {
        Self {
            net,
            base_url: base_url.into(),
        }
    }

    pub fn net(&self) -> &NetworkClient {
        &self.net
    }

    pub async fn check_update(&self, client_id: i64, version: i64) -> Result<UpdateCheck> {
        let url = endpoint(
            &self.base_url,
            &["check-update", &client_id.to_string(), &version.to_string()],
        )?;
        debug!("update server: checking {url}");
        let body = self.net.get_json(url, HeaderMap::new()).await?;
        serde_json::from_value(body)
            .map_err(|e| SyncError::transient(format!("check-update answer malformed: {e}")))
    }

    pub async fn confirm_update(&self, client_id: i64) -> Result<()> {
        let url = endpoint(&self.base_url, &["confirm-update", &client_id.to_string()])?;
        self.net.post(url).await
    }

    pub async fn weather(&self, client_id: i64) -> Result<Value> {
        let url = endpoint(&self.base_url, &["clima", &client_id.to_string()])?;
        self.net.get_json(url, HeaderMap::new()).await
    }
}

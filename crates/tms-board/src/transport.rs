use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;
use tms_core::sync_contracts::{CycleStatusResponse, SyncDomain, SyncError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Network seam between a board page and the hub.
///
/// `fetch_sync` hands back the raw body; validation happens in the poller so
/// that every transport is judged by the same rules.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn fetch_sync(&self, domain: SyncDomain, last_update: i64) -> Result<String, SyncError>;

    /// The rendered HTML of the page that shows `domain`.
    async fn fetch_page(&self, domain: SyncDomain) -> Result<String, SyncError>;

    async fn cycle_status(
        &self,
        route_id: &str,
        csrf_token: &str,
    ) -> Result<CycleStatusResponse, SyncError>;
}

pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(network_error)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_text(&self, url: &str) -> Result<String, SyncError> {
        let response = self.client.get(url).send().await.map_err(network_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Http {
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(network_error)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn fetch_sync(&self, domain: SyncDomain, last_update: i64) -> Result<String, SyncError> {
        let url = format!(
            "{}{}?last_update={}",
            self.base_url,
            domain.sync_path(),
            last_update
        );
        self.get_text(&url).await
    }

    async fn fetch_page(&self, domain: SyncDomain) -> Result<String, SyncError> {
        let url = format!("{}{}", self.base_url, domain.page_path());
        self.get_text(&url).await
    }

    async fn cycle_status(
        &self,
        route_id: &str,
        csrf_token: &str,
    ) -> Result<CycleStatusResponse, SyncError> {
        let url = format!("{}/routes/{}/cycle-status", self.base_url, route_id);
        let response = self
            .client
            .post(&url)
            .form(&[("csrf_token", csrf_token)])
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status();
        let body = response.text().await.map_err(network_error)?;
        // 404 and 403 still carry a JSON body with a message.
        match serde_json::from_str::<CycleStatusResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(SyncError::Http {
                status: status.as_u16(),
            }),
            Err(err) => Err(SyncError::Malformed(err.to_string())),
        }
    }
}

fn network_error(err: reqwest::Error) -> SyncError {
    SyncError::Network(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_drops_trailing_slash() {
        let transport =
            HttpTransport::new("http://127.0.0.1:5080/", DEFAULT_REQUEST_TIMEOUT).expect("client");
        assert_eq!(transport.base_url(), "http://127.0.0.1:5080");
    }

    #[tokio::test]
    async fn unreachable_hub_is_a_network_error() {
        let transport = HttpTransport::new("http://127.0.0.1:9", Duration::from_millis(500))
            .expect("client");
        let err = transport
            .fetch_sync(SyncDomain::Routes, 0)
            .await
            .expect_err("nothing listens on the discard port");
        assert!(err.is_network());
        assert!(err.marks_disconnected());
    }
}

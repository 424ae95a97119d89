//! HTTP data source
//!
//! Talks to a bridge whose web server exposes two JSON documents:
//!
//! - `GET /api/device` - hardware description ([`DeviceInfo`])
//! - `GET /api/readings?units=..&lang=..&extra=..` - one flat snapshot,
//!   already converted to the requested unit system
//!
//! Both use HTTP basic auth with the entry's credentials.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mb_core::Readings;
use mb_meteobridge::{
    BridgeSettings, DataSource, DeviceInfo, SourceError, SourceResult, UnitDescriptions,
};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, trace};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpSource {
    client: Client,
    base_url: String,
    settings: BridgeSettings,
}

impl HttpSource {
    pub fn new(client: Client, settings: &BridgeSettings) -> Self {
        let host = settings.host.trim_end_matches('/');
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{}", host)
        };

        Self {
            client,
            base_url,
            settings: settings.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> SourceResult<Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Requesting {}", url);

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .query(query)
            .send()
            .await
            .map_err(|e| SourceError::Transient(format!("{}: {}", url, e)))?;

        match response.status() {
            StatusCode::OK => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(SourceError::Auth(format!("{} rejected the credentials", self.base_url)))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SourceError::Transient(format!("{} returned {}: {}", url, status, body)))
            }
        }
    }
}

#[async_trait]
impl DataSource for HttpSource {
    async fn fetch_device_info(&self) -> SourceResult<DeviceInfo> {
        let mut info: DeviceInfo = self
            .get("/api/device", &[])
            .await?
            .json()
            .await
            .map_err(|e| SourceError::Transient(format!("malformed device info: {}", e)))?;

        if info.address.is_empty() {
            info.address = self.settings.host.clone();
        }
        Ok(info)
    }

    async fn fetch_snapshot(&self) -> SourceResult<Readings> {
        let query = [
            ("units", self.settings.unit_system.as_str().to_string()),
            ("lang", self.settings.language.clone()),
            ("extra", self.settings.extra_sensors.to_string()),
        ];
        let body: serde_json::Value = self
            .get("/api/readings", &query)
            .await?
            .json()
            .await
            .map_err(|e| SourceError::Transient(format!("malformed readings: {}", e)))?;
        trace!("Readings from {}: {}", self.base_url, body);

        Readings::from_json(&body)
            .ok_or_else(|| SourceError::Transient("readings must be a JSON object".to_string()))
    }

    fn unit_descriptions(&self) -> UnitDescriptions {
        UnitDescriptions::for_system(self.settings.unit_system)
    }
}

/// Build the HTTP client shared by every bridge
pub fn client() -> anyhow::Result<Client> {
    Ok(Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

/// Source factory handing each entry its own [`HttpSource`]
pub fn factory(client: Client) -> impl Fn(&BridgeSettings) -> Arc<dyn DataSource> + Send + Sync {
    move |settings: &BridgeSettings| -> Arc<dyn DataSource> {
        Arc::new(HttpSource::new(client.clone(), settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_config::HostUnitSystem;
    use mb_config_entries::FlowInput;
    use serde_json::json;

    fn settings(host: &str) -> BridgeSettings {
        let input: FlowInput = [
            ("host".to_string(), json!(host)),
            ("password".to_string(), json!("pw")),
            ("unit_system".to_string(), json!("uk")),
        ]
        .into_iter()
        .collect();
        BridgeSettings::from_input(&input, HostUnitSystem::Metric).unwrap()
    }

    #[test]
    fn test_base_url() {
        let client = Client::new();
        assert_eq!(
            HttpSource::new(client.clone(), &settings("10.0.0.5")).base_url(),
            "http://10.0.0.5"
        );
        assert_eq!(
            HttpSource::new(client, &settings("https://bridge.local/")).base_url(),
            "https://bridge.local"
        );
    }

    #[test]
    fn test_units_follow_settings() {
        let source = HttpSource::new(Client::new(), &settings("10.0.0.5"));
        assert_eq!(source.unit_descriptions().length, "km/h");
    }
}

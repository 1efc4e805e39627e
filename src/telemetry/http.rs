//! HTTP/JSON telemetry client for devices exposing a REST management API.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{MetricClass, PortReading, Reading, TelemetryClient, TelemetryError};
use crate::db::Device;

#[derive(Debug, Deserialize)]
struct MetricsResponse {
    readings: Vec<Reading>,
}

#[derive(Debug, Deserialize)]
struct PortsResponse {
    ports: Vec<PortReading>,
}

/// Polls `GET {address}/api/telemetry?class=..` and `GET {address}/api/ports`.
pub struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Config(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    fn base_url(address: &str) -> String {
        let url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        url.trim_end_matches('/').to_string()
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        device: &Device,
        url: &str,
    ) -> Result<T, TelemetryError> {
        let mut request = self.client.get(url);
        if !device.credential_ref.is_empty() {
            request = request.bearer_auth(&device.credential_ref);
        }

        let response = request.send().await.map_err(|e| self.map_error(e))?;
        let response = response
            .error_for_status()
            .map_err(|e| TelemetryError::Network(e.to_string()))?;

        response
            .json::<T>()
            .await
            .map_err(|e| TelemetryError::Protocol(e.to_string()))
    }

    fn map_error(&self, e: reqwest::Error) -> TelemetryError {
        if e.is_timeout() {
            TelemetryError::Timeout(self.timeout)
        } else {
            TelemetryError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl TelemetryClient for HttpClient {
    async fn fetch_metrics(
        &self,
        device: &Device,
        class: MetricClass,
    ) -> Result<Vec<Reading>, TelemetryError> {
        let url = format!(
            "{}/api/telemetry?class={}",
            Self::base_url(&device.address),
            class.as_str()
        );
        let body: MetricsResponse = self.get_json(device, &url).await?;
        Ok(body.readings)
    }

    async fn fetch_ports(&self, device: &Device) -> Result<Vec<PortReading>, TelemetryError> {
        let url = format!("{}/api/ports", Self::base_url(&device.address));
        let body: PortsResponse = self.get_json(device, &url).await?;
        Ok(body.ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        assert_eq!(HttpClient::base_url("10.0.0.1:8080"), "http://10.0.0.1:8080");
        assert_eq!(HttpClient::base_url("https://olt.example/"), "https://olt.example");
    }

    #[tokio::test]
    async fn test_unreachable_device_is_an_error() {
        let client = HttpClient::new(Duration::from_millis(100)).unwrap();
        let device = Device {
            address: "http://256.256.256.256".to_string(),
            ..Default::default()
        };
        let result = client.fetch_metrics(&device, MetricClass::Status).await;
        assert!(result.is_err());
    }
}

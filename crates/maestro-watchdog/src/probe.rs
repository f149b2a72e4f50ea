use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use std::time::Duration;

/// Liveness check against the daemon.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok` when the daemon answered healthy.
    async fn check(&self) -> MaestroResult<()>;
}

/// Polls the daemon's `GET /health` endpoint.
///
/// Any non-2xx status, a connection failure, a timeout, or a JSON body whose
/// `status` field is not `"ok"` counts as unhealthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    /// Probe `url` with a per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> MaestroResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MaestroError::Http(format!("cannot build health client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Probed URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> MaestroResult<()> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| MaestroError::Http(format!("health request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MaestroError::Http(format!("health returned {status}")));
        }
        let body = resp.text().await.unwrap_or_default();
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
            if let Some(s) = value.get("status").and_then(|s| s.as_str()) {
                if s != "ok" {
                    return Err(MaestroError::Http(format!("daemon reports status '{s}'")));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn probe_for(server: &MockServer) -> HttpHealthProbe {
        HttpHealthProbe::new(format!("{}/health", server.uri()), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_ok_status_is_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})))
            .mount(&server)
            .await;
        probe_for(&server).await.check().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = probe_for(&server).await.check().await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_degraded_body_is_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "degraded"})))
            .mount(&server)
            .await;
        assert!(probe_for(&server).await.check().await.is_err());
    }

    #[tokio::test]
    async fn test_refused_connection_is_unhealthy() {
        let probe = HttpHealthProbe::new("http://127.0.0.1:9/health", Duration::from_millis(500)).unwrap();
        assert!(probe.check().await.is_err());
    }
}

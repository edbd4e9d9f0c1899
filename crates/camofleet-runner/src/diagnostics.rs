//! Probing network capabilities from inside the runner container.
//!
//! Operators point the runner at a few well-known pages to learn which
//! protocols the node's egress path supports. Probes run once at start-up
//! and the outcome is surfaced through `/health`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Error,
    Skipped,
}

/// Result of a single protocol probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub status: ProbeStatus,
    pub detail: String,
}

impl ProbeOutcome {
    fn ok(detail: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Ok,
            detail: detail.into(),
        }
    }

    fn error(detail: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Error,
            detail: detail.into(),
        }
    }

    fn skipped(detail: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Skipped,
            detail: detail.into(),
        }
    }
}

/// Outcomes per protocol for one target URL.
pub type TargetReport = BTreeMap<String, ProbeOutcome>;

/// Attempt an HTTP GET against `url`, reporting the negotiated version.
pub async fn probe_http2(url: &str, timeout: Duration) -> ProbeOutcome {
    let client = match reqwest::Client::builder()
        .timeout(timeout)
        .user_agent("CamofleetDiagnostics/1.0")
        .build()
    {
        Ok(client) => client,
        Err(err) => return ProbeOutcome::error(err.to_string()),
    };
    match client.get(url).send().await {
        Ok(response) => ProbeOutcome::ok(format!(
            "{:?} {}",
            response.version(),
            response.status().as_u16()
        )),
        Err(err) => ProbeOutcome::error(err.to_string()),
    }
}

/// HTTP/3 probing needs a QUIC client, which this build does not carry.
pub async fn probe_http3(url: &str, _timeout: Duration) -> ProbeOutcome {
    if !url.starts_with("https://") {
        return ProbeOutcome::skipped("HTTP/3 requires an https URL");
    }
    ProbeOutcome::skipped("QUIC client support is unavailable")
}

/// Run all supported probes for one URL.
pub async fn probe_target(url: &str, timeout: Duration) -> TargetReport {
    debug!(url, "running network diagnostics");
    let http2 = probe_http2(url, timeout).await;
    let http3 = probe_http3(url, timeout).await;
    info!(url, http2 = ?http2.status, http3 = ?http3.status, "diagnostics probe finished");
    BTreeMap::from([("http2".to_string(), http2), ("http3".to_string(), http3)])
}

/// Execute diagnostics for all URLs concurrently.
pub async fn run_network_diagnostics(
    urls: &[String],
    timeout: Duration,
) -> BTreeMap<String, TargetReport> {
    if urls.is_empty() {
        return BTreeMap::new();
    }
    let probes = urls.iter().map(|url| async move {
        let report = probe_target(url, timeout).await;
        (url.clone(), report)
    });
    futures::future::join_all(probes).await.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn spawn_target() -> String {
        let app = Router::new().route("/", get(|| async { "ok" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn http_probe_reports_version_and_status() {
        let url = spawn_target().await;
        let outcome = probe_http2(&url, Duration::from_secs(5)).await;
        assert_eq!(outcome.status, ProbeStatus::Ok);
        assert!(outcome.detail.contains("200"), "detail: {}", outcome.detail);
    }

    #[tokio::test]
    async fn http_probe_surfaces_connection_errors() {
        let outcome = probe_http2("http://127.0.0.1:9/", Duration::from_secs(2)).await;
        assert_eq!(outcome.status, ProbeStatus::Error);
    }

    #[tokio::test]
    async fn http3_probe_is_skipped() {
        let outcome = probe_http3("https://example.com", Duration::from_secs(2)).await;
        assert_eq!(outcome.status, ProbeStatus::Skipped);
        let outcome = probe_http3("http://example.com", Duration::from_secs(2)).await;
        assert_eq!(outcome.status, ProbeStatus::Skipped);
        assert!(outcome.detail.contains("https"));
    }

    #[tokio::test]
    async fn empty_target_list_yields_empty_report() {
        let report = run_network_diagnostics(&[], Duration::from_secs(1)).await;
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn report_covers_every_target() {
        let url = spawn_target().await;
        let report =
            run_network_diagnostics(&[url.clone()], Duration::from_secs(5)).await;
        let target = report.get(&url).unwrap();
        assert_eq!(target["http2"].status, ProbeStatus::Ok);
        assert_eq!(target["http3"].status, ProbeStatus::Skipped);
    }
}

use crate::config::HealthCheckConfig;
use crate::upstream::loadbalance::Target;
use crate::upstream::pool::Upstream;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Shared HTTP client for active health probes.
pub fn build_probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .expect("failed to build health probe client")
}

/// Spawn the active health-checker task for one upstream.
///
/// One task per upstream, started when the upstream enters the store and
/// cancelled through the upstream's token when it is removed or replaced.
/// No-op when the upstream has no enabled health check — targets then stay
/// in whatever state the admin API or previous checks left them.
pub fn spawn_health_checker(upstream: Upstream, client: reqwest::Client) {
    let hc = match upstream.config().health_check.clone() {
        Some(hc) if hc.enabled => Arc::new(hc),
        _ => return,
    };

    let cancel = upstream.health_token();
    let name = upstream.name().to_owned();

    tokio::spawn(async move {
        let interval = Duration::from_secs(hc.interval.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("health: checker stopped, upstream={}", name);
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            run_probe_round(&upstream, &client, &hc).await;
        }
    });
}

/// Probe every target of the upstream once, with bounded concurrency.
async fn run_probe_round(upstream: &Upstream, client: &reqwest::Client, hc: &Arc<HealthCheckConfig>) {
    let targets = upstream.targets();
    if targets.is_empty() {
        return;
    }

    stream::iter(targets.iter().cloned().collect::<Vec<_>>())
        .map(|target| {
            let client = client.clone();
            let upstream = upstream.clone();
            let hc = hc.clone();
            async move {
                probe_one(&client, &upstream, &hc, &target).await;
            }
        })
        .buffer_unordered(hc.concurrency.max(1))
        .collect::<()>()
        .await;
}

async fn probe_one(
    client: &reqwest::Client,
    upstream: &Upstream,
    hc: &HealthCheckConfig,
    target: &Target,
) {
    let url = format!("http://{}{}", target.endpoint(), hc.path);
    let endpoint = target.endpoint().to_owned();

    let result = client
        .get(&url)
        .timeout(Duration::from_secs(hc.timeout))
        .send()
        .await;

    // Probe is "up" iff the status falls in [200, 399].
    let up = match result {
        Ok(resp) => {
            let status = resp.status().as_u16();
            (200..=399).contains(&status)
        }
        Err(_) => false,
    };

    if up {
        upstream.record_probe_success(&endpoint, hc.healthy_threshold);
    } else {
        upstream.record_probe_failure(&endpoint, hc.unhealthy_threshold);
    }

    metrics::counter!(
        "gateway_health_check_total",
        "upstream" => upstream.name().to_owned(),
        "target" => endpoint.clone(),
        "result" => if up { "up" } else { "down" },
    )
    .increment(1);

    debug!(
        "health: probe {}, upstream={}, target={}",
        if up { "up" } else { "down" },
        upstream.name(),
        endpoint
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TargetConfig, UpstreamConfig};
    use std::net::SocketAddr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Minimal fixed-response HTTP server for probe tests.
    async fn spawn_probe_target(status: u16) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    use tokio::io::AsyncReadExt;
                    let _ = stream.read(&mut buf).await;
                    let resp = format!(
                        "HTTP/1.1 {} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        status
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn upstream_with_target(addr: SocketAddr) -> Upstream {
        Upstream::new(UpstreamConfig {
            name: "probe-test".to_string(),
            targets: vec![TargetConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
                weight: 1,
            }],
            ..UpstreamConfig::default()
        })
    }

    fn hc(healthy: u32, unhealthy: u32) -> Arc<HealthCheckConfig> {
        Arc::new(HealthCheckConfig {
            enabled: true,
            interval: 1,
            path: "/health".to_string(),
            timeout: 2,
            healthy_threshold: healthy,
            unhealthy_threshold: unhealthy,
            concurrency: 4,
        })
    }

    #[tokio::test]
    async fn test_probe_up_keeps_target_healthy() {
        let addr = spawn_probe_target(200).await;
        let upstream = upstream_with_target(addr);
        let client = build_probe_client();

        run_probe_round(&upstream, &client, &hc(1, 1)).await;
        assert!(upstream.targets()[0].is_healthy());
    }

    #[tokio::test]
    async fn test_redirect_status_counts_as_up() {
        let addr = spawn_probe_target(302).await;
        let upstream = upstream_with_target(addr);
        // reqwest must not follow the redirect for the raw status to count.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .unwrap();

        upstream.targets()[0].set_healthy(false);
        run_probe_round(&upstream, &client, &hc(1, 1)).await;
        assert!(upstream.targets()[0].is_healthy());
    }

    #[tokio::test]
    async fn test_probe_5xx_marks_unhealthy_after_threshold() {
        let addr = spawn_probe_target(500).await;
        let upstream = upstream_with_target(addr);
        let client = build_probe_client();
        let cfg = hc(1, 2);

        run_probe_round(&upstream, &client, &cfg).await;
        assert!(upstream.targets()[0].is_healthy());

        run_probe_round(&upstream, &client, &cfg).await;
        assert!(!upstream.targets()[0].is_healthy());
    }

    #[tokio::test]
    async fn test_connection_refused_is_down() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = upstream_with_target(addr);
        let client = build_probe_client();
        run_probe_round(&upstream, &client, &hc(1, 1)).await;
        assert!(!upstream.targets()[0].is_healthy());
    }

    #[tokio::test]
    async fn test_recovery_after_flip() {
        let addr = spawn_probe_target(204).await;
        let upstream = upstream_with_target(addr);
        let client = build_probe_client();

        upstream.targets()[0].set_healthy(false);
        let cfg = hc(2, 1);
        run_probe_round(&upstream, &client, &cfg).await;
        assert!(!upstream.targets()[0].is_healthy());
        run_probe_round(&upstream, &client, &cfg).await;
        assert!(upstream.targets()[0].is_healthy());
    }
}

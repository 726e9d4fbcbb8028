//! Helpers shared by the ingress integration suites.

use std::net::SocketAddr;
use std::time::Duration;

use sniproute_ingress::IngressMetrics;

/// A listener running in the background on an ephemeral loopback port.
pub struct IngressHandle {
    pub listen_addr: SocketAddr,
    pub metrics: IngressMetrics,
}

impl IngressHandle {
    /// `listener` metric label.
    pub fn label(&self) -> String {
        self.listen_addr.to_string()
    }
}

/// Poll `check` until it holds or `wait` elapses.
pub async fn eventually<F, Fut>(wait: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

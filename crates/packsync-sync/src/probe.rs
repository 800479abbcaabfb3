// ABOUTME: Periodic reachability probe that drives the shared connectivity signal from HTTP health checks.
// ABOUTME: Any response below 500 counts as reachable; transport failures and 5xx count as offline.

use std::time::Duration;

use packsync_core::connectivity::Connectivity;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct ConnectivityProbe {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    connectivity: Connectivity,
    interval: Duration,
}

impl ConnectivityProbe {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        connectivity: Connectivity,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
            connectivity,
            interval,
        })
    }

    /// Probe once and publish the result. Returns whether the target was reachable.
    pub async fn check(&self) -> bool {
        let mut request = self.client.get(&self.url);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let reachable = match request.send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "probe failed");
                false
            }
        };

        if self.connectivity.set_online(reachable) {
            tracing::info!(online = reachable, "connectivity changed");
        }
        reachable
    }

    /// Probe on a fixed interval until the returned task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.check().await;
            }
        })
    }
}

//! Heartbeat loop with 404-triggered re-registration

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::client::ApiClient;
use crate::registration::RegistrationService;

/// Heartbeat service
pub struct HeartbeatService {
    client: Arc<ApiClient>,
    registration: RegistrationService,
    node_id: String,
    interval: Duration,
}

impl HeartbeatService {
    pub fn new(
        client: Arc<ApiClient>,
        registration: RegistrationService,
        node_id: impl Into<String>,
        interval_secs: u64,
    ) -> Self {
        Self {
            client,
            registration,
            node_id: node_id.into(),
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    /// Run until shutdown, beating immediately and then on each interval
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) {
        self.beat_once().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.beat_once().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    /// One heartbeat. A 404 means the server lost the node row: re-register
    /// with the stored node id and swap the fresh token into the shared
    /// client. Any other failure is logged and ignored; heartbeats are best
    /// effort.
    pub async fn beat_once(&self) {
        match self.client.heartbeat(&self.node_id).await {
            Ok(()) => debug!(node_id = %self.node_id, "heartbeat ok"),
            Err(e) if e.is_not_found() => {
                warn!(node_id = %self.node_id, "node unknown to server, re-registering");
                match self.registration.re_register().await {
                    Ok(token) => self.client.update_token(&token).await,
                    Err(e) => warn!(error = %e, "re-registration failed"),
                }
            }
            Err(e) => warn!(error = %e, "heartbeat failed"),
        }
    }
}

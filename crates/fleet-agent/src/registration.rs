//! Initial and repeat registration

use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::error::{AgentError, Result};
use crate::identity::{Identity, IdentityManager};
use crate::metadata::Collector;

/// Registration service
pub struct RegistrationService {
    client: Arc<ApiClient>,
    identity_mgr: IdentityManager,
}

impl RegistrationService {
    pub fn new(client: Arc<ApiClient>, identity_mgr: IdentityManager) -> Self {
        Self {
            client,
            identity_mgr,
        }
    }

    /// First-time registration: collect host facts, derive a node id from
    /// the hostname, register, and persist the identity file.
    pub async fn register_new(&self) -> Result<Identity> {
        let facts = Collector::new().collect();
        let node_id = facts
            .hostname
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| format!("node-{}", Uuid::new_v4()));
        let attrs = facts.to_attrs();

        info!(node_id = %node_id, "registering new node");
        let token = self.client.register(&node_id, &attrs).await?;

        let identity = Identity {
            node_id,
            jwt_token: token,
            metadata: Some(attrs),
        };
        self.identity_mgr.save(&identity)?;

        info!(node_id = %identity.node_id, "registered");
        Ok(identity)
    }

    /// Re-register with the *stored* node id and refresh the token in
    /// place. Used when the server forgot the node (heartbeat 404).
    pub async fn re_register(&self) -> Result<String> {
        let identity = self
            .identity_mgr
            .load()?
            .ok_or_else(|| AgentError::generic("identity not found, cannot re-register"))?;

        info!(node_id = %identity.node_id, "re-registering with stored node id");

        let attrs = identity
            .metadata
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let token = self.client.register(&identity.node_id, &attrs).await?;

        self.identity_mgr.update_token(&token)?;
        info!(node_id = %identity.node_id, "re-registered");
        Ok(token)
    }
}

//! Command handler for control API
//!
//! Dispatches decoded requests to the lifecycle manager and shapes the
//! results into responses.

use crate::control::api::{Action, ApiError, ApiRequest, ApiResponse};
use crate::lifecycle::{Context, LifecycleManager};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Default deadline applied to each request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes API requests against the lifecycle manager
pub struct CommandHandler {
    manager: Arc<LifecycleManager>,
    request_timeout: Duration,
}

impl CommandHandler {
    /// Create a new command handler
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self {
            manager,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Fresh context for one request
    pub fn context(&self) -> Context {
        Context::with_timeout(self.request_timeout)
    }

    /// Handle an API request
    pub async fn handle_request(&self, ctx: &Context, request: ApiRequest) -> ApiResponse {
        let name = request.action.name();
        debug!("Handling request {}: {}", request.id, name);

        match self.dispatch(ctx, request.action).await {
            Ok(data) => {
                info!("Request {} completed: {}", request.id, name);
                ApiResponse::success(request.id, data)
            }
            Err(e) => {
                error!("Request {} failed: {}: {}", request.id, name, e);
                ApiResponse::error(request.id, e)
            }
        }
    }

    async fn dispatch(
        &self,
        ctx: &Context,
        action: Action,
    ) -> Result<Option<serde_json::Value>, ApiError> {
        match action {
            Action::CreateTunnel(req) => to_data(&self.manager.create(ctx, req).await?),
            Action::DeleteTunnel { id } => {
                self.manager.delete(ctx, &id).await?;
                Ok(None)
            }
            Action::ListTunnels => to_data(&self.manager.list()?),
            Action::GetTunnel { id } => to_data(&self.manager.get(&id)?),
            Action::NewPeer(req) => to_data(&self.manager.new_peer(ctx, req).await?),
            Action::DeletePeer { tunnel_id, peer_id } => {
                to_data(&self.manager.delete_peer(ctx, &tunnel_id, &peer_id).await?)
            }
        }
    }
}

fn to_data<T: Serialize>(value: &T) -> Result<Option<serde_json::Value>, ApiError> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| ApiError::Serialization {
            message: e.to_string(),
        })
}

//! Gateway: owns every child, the aggregated catalog and call routing.

use crate::config::{ChildSpec, GatewaySettings};
use crate::correlator::Correlator;
use crate::error::{GatewayError, MuxError};
use crate::jsonrpc::{ChildMessage, ToolDescriptor};
use crate::registry::{RegistryEntry, ToolRegistry};
use crate::supervisor::{ChildEvent, ChildState, ChildSupervisor, ClientInfo};
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

/// Notification a child sends when its tool list changed.
const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// Point-in-time view of one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildStatus {
    pub name: String,
    pub state: ChildState,
    pub tools: usize,
    pub outstanding: usize,
}

struct Inner {
    settings: GatewaySettings,
    registry: RwLock<ToolRegistry>,
    children: RwLock<HashMap<String, Arc<ChildSupervisor>>>,
    correlator: Correlator,
    stopping: AtomicBool,
    shutdown: CancellationToken,
}

impl Inner {
    async fn child(&self, name: &str) -> Option<Arc<ChildSupervisor>> {
        self.children.read().await.get(name).cloned()
    }
}

/// Front door of the multiplexer. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Spawn every configured child and start routing their messages.
    ///
    /// Children that fail to spawn are logged and left out; the gateway runs
    /// with whatever children are available.
    pub async fn start(specs: Vec<ChildSpec>, settings: GatewaySettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = ClientInfo {
            name: settings.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };

        let mut children = HashMap::new();
        for spec in specs {
            let name = spec.name.clone();
            if children.contains_key(&name) {
                tracing::warn!("Duplicate child '{name}' ignored");
                continue;
            }
            match ChildSupervisor::spawn(
                spec,
                &client,
                settings.handshake_timeout(),
                events_tx.clone(),
            ) {
                Ok(child) => {
                    children.insert(name, child);
                }
                Err(e) => {
                    tracing::warn!("Failed to start child '{name}': {e}");
                }
            }
        }

        let inner = Arc::new(Inner {
            correlator: Correlator::new(settings.max_in_flight),
            settings,
            registry: RwLock::new(ToolRegistry::new()),
            children: RwLock::new(children),
            stopping: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(dispatch(Arc::clone(&inner), events_rx));

        Self { inner }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.inner.settings
    }

    /// The aggregated catalog, in registration order. Never waits on children.
    pub async fn list_tools(&self) -> Vec<RegistryEntry> {
        self.inner.registry.read().await.snapshot()
    }

    /// Route a call for `qualified_name` to its owning child.
    pub async fn call_tool(
        &self,
        qualified_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, GatewayError> {
        self.route_call(qualified_name, arguments)
            .await
            .map_err(|e| {
                tracing::warn!("Call to '{qualified_name}' failed: {e}");
                GatewayError::from(e)
            })
    }

    async fn route_call(
        &self,
        qualified_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, MuxError> {
        let entry = self
            .inner
            .registry
            .read()
            .await
            .lookup(qualified_name)
            .cloned()
            .ok_or_else(|| MuxError::UnknownTool {
                name: qualified_name.to_string(),
            })?;
        let child = self
            .inner
            .child(&entry.child)
            .await
            .ok_or_else(|| MuxError::UnknownChild {
                name: entry.child.clone(),
            })?;

        let params = serde_json::json!({
            "name": entry.original_name,
            "arguments": arguments.unwrap_or_else(|| serde_json::json!({})),
        });
        self.inner
            .correlator
            .send(
                child.as_ref(),
                "tools/call",
                params,
                self.inner.settings.call_timeout(),
            )
            .await
    }

    /// Status of every tracked child, sorted by name.
    pub async fn children(&self) -> Vec<ChildStatus> {
        let children: Vec<Arc<ChildSupervisor>> =
            self.inner.children.read().await.values().cloned().collect();
        let registry = self.inner.registry.read().await;
        let mut statuses = Vec::with_capacity(children.len());
        for child in children {
            statuses.push(ChildStatus {
                name: child.name().to_string(),
                state: child.state(),
                tools: registry.tools_for(child.name()).len(),
                outstanding: self.inner.correlator.outstanding(child.name()).await,
            });
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Wait until every child has reached at least `target`. Returns `false`
    /// if any child did not get there within `timeout`.
    pub async fn wait_for_children(&self, target: ChildState, timeout: Duration) -> bool {
        let children: Vec<Arc<ChildSupervisor>> =
            self.inner.children.read().await.values().cloned().collect();
        join_all(
            children
                .iter()
                .map(|child| child.wait_for_state(target, timeout)),
        )
        .await
        .into_iter()
        .all(|reached| reached)
    }

    /// Fires once [`Gateway::shutdown`] has finished stopping the children.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Terminate every child, then signal the front server to close.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            self.inner.shutdown.cancelled().await;
            return;
        }
        tracing::info!("Shutting down gateway");
        let children: Vec<Arc<ChildSupervisor>> =
            self.inner.children.read().await.values().cloned().collect();
        join_all(children.iter().map(|child| child.terminate())).await;
        self.inner.shutdown.cancel();
    }
}

/// Apply child events to the registry and correlator until shutdown.
async fn dispatch(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<ChildEvent>) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            () = inner.shutdown.cancelled() => None,
        };
        let Some(event) = event else {
            break;
        };
        handle_event(&inner, event).await;
    }
    tracing::debug!("Child event dispatcher stopped");
}

async fn handle_event(inner: &Inner, event: ChildEvent) {
    match event {
        ChildEvent::Message { child, message } => match message {
            ChildMessage::CatalogReport(tools) => register_catalog(inner, &child, tools).await,
            ChildMessage::CatalogRejected(error) => {
                tracing::warn!("Child '{child}' refused to list tools: {}", error.message);
            }
            ChildMessage::CallResponse { id, outcome } => {
                inner.correlator.resolve(&child, &id, outcome).await;
            }
            ChildMessage::Notification { method, .. } if method == TOOLS_LIST_CHANGED => {
                if let Some(supervisor) = inner.child(&child).await {
                    tracing::debug!("Child '{child}' tool list changed, refreshing");
                    if let Err(e) = supervisor.request_catalog() {
                        tracing::debug!("Could not refresh catalog of '{child}': {e}");
                    }
                }
            }
            ChildMessage::Notification { method, .. } => {
                tracing::debug!("Ignoring notification '{method}' from '{child}'");
            }
            other => {
                tracing::debug!("Ignoring unexpected message from '{child}': {other:?}");
            }
        },
        ChildEvent::Exited { child, status } => {
            let removed = inner.registry.write().await.remove_child(&child);
            let failed = inner.correlator.fail_child(&child).await;
            if !inner.stopping.load(Ordering::SeqCst) {
                tracing::warn!(
                    "Child '{child}' exited ({status}); failed {failed} pending calls, removed {removed} tools"
                );
            }
        }
    }
}

async fn register_catalog(inner: &Inner, child: &str, tools: Vec<ToolDescriptor>) {
    let Some(supervisor) = inner.child(child).await else {
        tracing::debug!("Catalog from untracked child '{child}' ignored");
        return;
    };
    // A report racing the exit event must not resurrect pruned entries.
    if supervisor.state() >= ChildState::Terminating {
        return;
    }
    let names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
    let count = inner.registry.write().await.register(child, tools);
    if supervisor.mark_ready() {
        tracing::info!("Child '{child}' ready with {count} tools: {}", names.join(", "));
    } else {
        tracing::debug!("Child '{child}' re-reported {count} tools");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::error_codes;

    #[tokio::test]
    async fn empty_gateway_has_no_tools() {
        let gateway = Gateway::start(Vec::new(), GatewaySettings::default()).await;
        assert!(gateway.list_tools().await.is_empty());
        assert!(gateway.children().await.is_empty());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_request() {
        let gateway = Gateway::start(Vec::new(), GatewaySettings::default()).await;
        let err = gateway
            .call_tool("memory_store", Some(serde_json::json!({"k": "v"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_REQUEST);
        assert_eq!(err.message, "Unknown tool: memory_store");
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn failed_child_is_left_out() {
        let specs = vec![ChildSpec::new(
            "bad",
            "nonexistent_command_xyz123",
            Vec::new(),
        )];
        let gateway = Gateway::start(specs, GatewaySettings::default()).await;
        assert!(gateway.children().await.is_empty());
        assert!(gateway.list_tools().await.is_empty());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_fires_token() {
        let specs = vec![ChildSpec::new("sleeper", "sleep", vec!["30".to_string()])];
        let gateway = Gateway::start(specs, GatewaySettings::default()).await;
        let token = gateway.shutdown_token();
        assert!(!token.is_cancelled());

        let other = gateway.clone();
        tokio::join!(gateway.shutdown(), other.shutdown());
        assert!(token.is_cancelled());

        let statuses = gateway.children().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, ChildState::Terminated);
        gateway.shutdown().await;
    }
}

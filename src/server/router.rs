//! Routes tool calls to the coordinator itself or to a worker daemon.
//!
//! Remote calls are correlated by a fresh id. Each one parks a oneshot
//! sender in the pending map; whichever of result, error, timeout or worker
//! loss removes the entry first settles the call.

use super::registry::{SessionRegistry, LOCAL_MACHINE};
use crate::agent::TurnExecutor;
use crate::error::RoutingError;
use crate::protocol::{encode, WorkerCommand};
use crate::tools::{LocalExecutor, ToolExecutor};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default wait for a worker to answer an execute request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

type Settlement = Result<String, RoutingError>;

struct PendingRequest {
    machine: String,
    /// Worker session the request was sent to.
    session_id: String,
    tx: oneshot::Sender<Settlement>,
}

pub struct ToolRouter {
    registry: Arc<SessionRegistry>,
    local: LocalExecutor,
    pending: Mutex<HashMap<String, PendingRequest>>,
    timeout: Duration,
}

impl ToolRouter {
    pub fn new(registry: Arc<SessionRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            local: LocalExecutor::default(),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Run `tool` on `machine`. An empty name or `local` runs in-process.
    pub async fn execute_on_machine(
        &self,
        machine: &str,
        tool: &str,
        params: Value,
    ) -> Result<String, RoutingError> {
        if machine.is_empty() || machine == LOCAL_MACHINE {
            return Ok(ToolExecutor::execute(&self.local, tool, params).await);
        }

        let worker = self
            .registry
            .worker(machine)
            .ok_or_else(|| RoutingError::MachineNotFound(machine.to_string()))?;
        if !worker.capabilities.iter().any(|c| c == tool) {
            return Err(RoutingError::CapabilityUnsupported {
                machine: machine.to_string(),
                tool: tool.to_string(),
            });
        }
        if !worker.is_open() {
            return Err(RoutingError::WorkerUnavailable(machine.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(
            id.clone(),
            PendingRequest {
                machine: machine.to_string(),
                session_id: worker.session_id.clone(),
                tx,
            },
        );

        let frame = encode(&WorkerCommand::Execute {
            id: id.clone(),
            tool: tool.to_string(),
            params,
        });
        if worker.outbound.send(frame).is_err() {
            self.pending.lock().remove(&id);
            return Err(RoutingError::WorkerUnavailable(machine.to_string()));
        }
        debug!(request_id = %id, machine, tool, "dispatched to worker");

        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_)) => Err(RoutingError::WorkerUnavailable(machine.to_string())),
            Err(_) => {
                if self.pending.lock().remove(&id).is_some() {
                    warn!(request_id = %id, machine, tool, "worker request timed out");
                    return Err(RoutingError::RequestTimeout(machine.to_string()));
                }
                // Settled between the deadline and the removal.
                rx.try_recv()
                    .unwrap_or_else(|_| Err(RoutingError::RequestTimeout(machine.to_string())))
            }
        }
    }

    /// Settle request `id` with the worker's output. False if unknown.
    pub fn handle_result(&self, id: &str, output: String) -> bool {
        self.settle(id, |_| Ok(output))
    }

    /// Settle request `id` with a worker-reported failure. False if unknown.
    pub fn handle_error(&self, id: &str, message: String) -> bool {
        self.settle(id, |machine| {
            Err(RoutingError::Remote {
                machine: machine.to_string(),
                message,
            })
        })
    }

    /// Fail every request still waiting on worker session `session_id`.
    /// Returns how many.
    pub fn fail_session(&self, session_id: &str) -> usize {
        let failed: Vec<(String, PendingRequest)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        let count = failed.len();
        for (id, request) in failed {
            debug!(request_id = %id, machine = %request.machine, "failing request of lost worker");
            let _ = request.tx.send(Err(RoutingError::WorkerUnavailable(request.machine)));
        }
        count
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn settle(&self, id: &str, outcome: impl FnOnce(&str) -> Settlement) -> bool {
        let Some(request) = self.pending.lock().remove(id) else {
            debug!(request_id = %id, "no pending request, ignoring");
            return false;
        };
        let _ = request.tx.send(outcome(&request.machine));
        true
    }
}

#[async_trait]
impl TurnExecutor for ToolRouter {
    async fn execute(&self, tool: &str, params: Value, machine: Option<&str>) -> String {
        match self
            .execute_on_machine(machine.unwrap_or(LOCAL_MACHINE), tool, params)
            .await
        {
            Ok(output) => output,
            Err(RoutingError::Remote { message, .. }) if message.starts_with("Error") => message,
            Err(e) => format!("Error: {}", e),
        }
    }
}

//! Live sessions on the coordinator and the machines workers registered.

use crate::error::RegistryError;
use crate::protocol::{encode, MachineInfo, ServerMessage};
use crate::tools::TOOL_NAMES;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the coordinator's own machine.
pub const LOCAL_MACHINE: &str = "local";

/// Queue of text frames for one socket; drained by its writer task.
pub type Outbound = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Worker {
        name: String,
        capabilities: Vec<String>,
    },
}

struct Session {
    outbound: Outbound,
    role: SessionRole,
}

/// What the router needs to reach a worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub session_id: String,
    pub capabilities: Vec<String>,
    pub outbound: Outbound,
}

impl WorkerHandle {
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    /// Worker names in registration order, with the owning session.
    workers: Vec<(String, String)>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted socket. Sessions start as clients.
    pub fn open_session(&self, outbound: Outbound) -> String {
        let id = Uuid::new_v4().to_string();
        self.inner.lock().sessions.insert(
            id.clone(),
            Session {
                outbound,
                role: SessionRole::Client,
            },
        );
        debug!(session_id = %id, "session opened");
        id
    }

    /// Forget a session. Returns the machine name if it was a worker, after
    /// telling the clients the machine is gone.
    pub fn close_session(&self, session_id: &str) -> Option<String> {
        let name = {
            let mut inner = self.inner.lock();
            let session = inner.sessions.remove(session_id)?;
            match session.role {
                SessionRole::Worker { name, .. } => {
                    inner.workers.retain(|(_, owner)| owner != session_id);
                    Some(name)
                }
                SessionRole::Client => None,
            }
        };
        if let Some(name) = &name {
            info!(session_id, machine = %name, "worker disconnected");
            self.broadcast_machines();
        }
        name
    }

    /// Turn a session into the worker for machine `name`.
    ///
    /// Names are unique among live workers. A name held by a session whose
    /// socket already went away is handed over; the displaced session id is
    /// returned so its requests can be failed.
    pub fn register(
        &self,
        session_id: &str,
        name: &str,
        capabilities: Vec<String>,
    ) -> Result<Option<String>, RegistryError> {
        let name = name.trim();
        if name.is_empty() || name == LOCAL_MACHINE {
            return Err(RegistryError::ReservedName);
        }

        let displaced = {
            let mut inner = self.inner.lock();
            let session = inner
                .sessions
                .get(session_id)
                .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))?;
            if let SessionRole::Worker { name: current, .. } = &session.role {
                return Err(RegistryError::AlreadyRegistered(current.clone()));
            }

            let displaced = if let Some(index) = inner.workers.iter().position(|(n, _)| n == name) {
                let owner = inner.workers[index].1.clone();
                let stale = inner
                    .sessions
                    .get(&owner)
                    .map_or(true, |s| s.outbound.is_closed());
                if !stale {
                    return Err(RegistryError::NameTaken(name.to_string()));
                }
                inner.workers.remove(index);
                if let Some(old) = inner.sessions.get_mut(&owner) {
                    old.role = SessionRole::Client;
                }
                Some(owner)
            } else {
                None
            };

            if let Some(session) = inner.sessions.get_mut(session_id) {
                session.role = SessionRole::Worker {
                    name: name.to_string(),
                    capabilities: capabilities.clone(),
                };
            }
            inner.workers.push((name.to_string(), session_id.to_string()));
            displaced
        };

        if let Some(old) = &displaced {
            warn!(session_id = %old, machine = name, "replaced stale worker session");
        }
        info!(session_id, machine = name, ?capabilities, "worker registered");
        self.broadcast_machines();
        Ok(displaced)
    }

    /// Drop machine `name`. Its session stays open as a plain session.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.workers.iter().position(|(n, _)| n == name) {
                Some(index) => {
                    let (_, owner) = inner.workers.remove(index);
                    if let Some(session) = inner.sessions.get_mut(&owner) {
                        session.role = SessionRole::Client;
                    }
                    true
                }
                None => false,
            }
        };
        if removed {
            info!(machine = name, "worker unregistered");
            self.broadcast_machines();
        }
        removed
    }

    /// `local` first, then workers in registration order.
    pub fn list_machines(&self) -> Vec<MachineInfo> {
        let inner = self.inner.lock();
        let mut machines = Vec::with_capacity(inner.workers.len() + 1);
        machines.push(MachineInfo {
            name: LOCAL_MACHINE.to_string(),
            capabilities: TOOL_NAMES.iter().map(|t| t.to_string()).collect(),
        });
        for (_, owner) in &inner.workers {
            if let Some(Session {
                role: SessionRole::Worker { name, capabilities },
                ..
            }) = inner.sessions.get(owner)
            {
                machines.push(MachineInfo {
                    name: name.clone(),
                    capabilities: capabilities.clone(),
                });
            }
        }
        machines
    }

    pub fn worker(&self, name: &str) -> Option<WorkerHandle> {
        let inner = self.inner.lock();
        let (_, owner) = inner.workers.iter().find(|(n, _)| n == name)?;
        let session = inner.sessions.get(owner)?;
        match &session.role {
            SessionRole::Worker { capabilities, .. } => Some(WorkerHandle {
                session_id: owner.clone(),
                capabilities: capabilities.clone(),
                outbound: session.outbound.clone(),
            }),
            SessionRole::Client => None,
        }
    }

    pub fn role(&self, session_id: &str) -> Option<SessionRole> {
        self.inner
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.role.clone())
    }

    /// Queue a frame for one session. False if it is gone.
    pub fn send_to(&self, session_id: &str, text: String) -> bool {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(session_id)
            .is_some_and(|s| s.outbound.send(text).is_ok())
    }

    pub fn broadcast_to_clients(&self, text: &str) {
        let targets: Vec<Outbound> = {
            let inner = self.inner.lock();
            inner
                .sessions
                .values()
                .filter(|s| s.role == SessionRole::Client)
                .map(|s| s.outbound.clone())
                .collect()
        };
        for target in targets {
            let _ = target.send(text.to_string());
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    fn broadcast_machines(&self) {
        let frame = encode(&ServerMessage::machines(&self.list_machines()));
        self.broadcast_to_clients(&frame);
    }
}

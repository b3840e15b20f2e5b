use cluster_core::Node;
use remote::{Connector, RemoteSession};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::pool::NodeTaskSet;

/// Open sessions of a run, keyed by node address.
pub struct SessionSet {
    connector: Arc<dyn Connector>,
    sessions: Mutex<HashMap<String, Arc<dyn RemoteSession>>>,
}

impl SessionSet {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn RemoteSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Authenticate to every node before anything is mutated.
    ///
    /// If any node is unreachable, the sessions that did open are closed
    /// again and the first failure in topology order is returned.
    pub async fn open_all(
        connector: Arc<dyn Connector>,
        nodes: &[Node],
        parallelism: usize,
    ) -> Result<Self> {
        let mut tasks = NodeTaskSet::new(parallelism);
        for node in nodes {
            let connector = Arc::clone(&connector);
            let node = node.clone();
            tasks.spawn(async move {
                let opened = connector.open(&node.spec).await;
                (node, opened)
            });
        }

        let set = Self::new(connector);
        let mut first_error = None;
        for (node, opened) in tasks.join_all().await {
            match opened {
                Ok(session) => {
                    debug!(address = %node.address(), "Session opened");
                    set.insert(node.address(), session);
                }
                Err(e) => {
                    warn!(address = %node.address(), error = %e, "Cannot open session");
                    if first_error.is_none() {
                        first_error = Some(OrchestratorError::connect(node.address(), e));
                    }
                }
            }
        }

        if let Some(err) = first_error {
            set.close_all().await;
            return Err(err);
        }

        info!(count = nodes.len(), "All sessions authenticated");
        Ok(set)
    }

    pub fn insert(&self, address: &str, session: Arc<dyn RemoteSession>) {
        self.sessions().insert(address.to_string(), session);
    }

    pub fn get(&self, address: &str) -> Option<Arc<dyn RemoteSession>> {
        self.sessions().get(address).cloned()
    }

    /// Held session for `node`, opening one if none is held.
    pub async fn get_or_open(&self, node: &Node) -> Result<Arc<dyn RemoteSession>> {
        match self.get(node.address()) {
            Some(session) => Ok(session),
            None => self.reopen(node).await,
        }
    }

    /// Replace the held session for `node` with a freshly opened one.
    pub async fn reopen(&self, node: &Node) -> Result<Arc<dyn RemoteSession>> {
        let session = self
            .connector
            .open(&node.spec)
            .await
            .map_err(|e| OrchestratorError::connect(node.address(), e))?;

        let previous = self
            .sessions()
            .insert(node.address().to_string(), Arc::clone(&session));
        if let Some(old) = previous {
            if let Err(e) = old.close().await {
                warn!(address = %node.address(), error = %e, "Failed to close replaced session");
            }
        }
        info!(address = %node.address(), "Session re-established");
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions().drain().collect();
        for (address, session) in sessions {
            if let Err(e) = session.close().await {
                debug!(address = %address, error = %e, "Error closing session");
            }
        }
    }
}

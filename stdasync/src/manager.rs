//! A registry of running connections.

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use dusk::{DisconnectReason, Error, Result, Runner};

use crate::{driver, Events, SshHandle};

/// Identifies a connection within a [`ConnectionManager`]
pub type ConnId = u64;

/// Tracks connections by id.
///
/// The registry holds only [`SshHandle`]s, protocol state stays with each
/// connection's task. Connections started with [`spawn()`](Self::spawn)
/// are removed when they end.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    conns: Arc<DashMap<ConnId, SshHandle>>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a connection and registers it until it finishes
    pub fn spawn<S>(&self, stream: S, runner: Runner) -> (ConnId, Events, JoinHandle<Result<()>>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (handle, events, task) = driver::spawn(stream, runner);
        let id = self.insert(handle);
        let conns = self.conns.clone();
        let task = tokio::spawn(async move {
            let r = match task.await {
                Ok(r) => r,
                Err(e) => {
                    warn!("Connection {id} task failed: {e}");
                    Err(Error::Disconnected)
                }
            };
            conns.remove(&id);
            debug!("Connection {id} removed");
            r
        });
        (id, events, task)
    }

    /// Registers a handle, returning its new id
    pub fn insert(&self, handle: SshHandle) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(id, handle);
        id
    }

    pub fn get(&self, id: ConnId) -> Option<SshHandle> {
        self.conns.get(&id).map(|h| h.value().clone())
    }

    pub fn remove(&self, id: ConnId) -> Option<SshHandle> {
        self.conns.remove(&id).map(|(_, h)| h)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.conns.iter().map(|e| *e.key()).collect()
    }

    /// Disconnects every registered connection
    pub async fn disconnect_all(&self, desc: &str) {
        // no map guards are held across the awaits
        let handles: Vec<_> = self.conns.iter().map(|e| (*e.key(), e.value().clone())).collect();
        for (id, h) in handles {
            if let Err(e) = h.disconnect(DisconnectReason::ByApplication, desc).await {
                debug!("Connection {id} already gone: {e}");
            }
        }
    }
}

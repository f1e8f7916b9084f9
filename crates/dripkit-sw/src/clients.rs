//! Controlled-page tracking and the claim capability.
//!
//! The host runtime owns the set of open pages. A worker never holds that
//! set; during activation it is handed a [`ClientsController`] and asks it
//! to move every page under its scope onto itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::{scope_covers, WorkerId};

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientKind {
    #[default]
    Window,
    Worker,
}

/// A page (or worker context) open against the origin.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: ClientId,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub kind: ClientKind,

    /// The worker currently routing this client's requests.
    pub controller: Option<WorkerId>,
}

/// Capability a worker uses during activation to take over open clients.
#[async_trait]
pub trait ClientsController: Send + Sync {
    /// Make `controller` the controlling worker of every client whose URL
    /// the scope covers. Clients outside the scope keep their controller.
    /// Returns the number of clients whose controller changed.
    async fn claim_all(&self, scope: &Url, controller: WorkerId) -> usize;

    /// Number of clients currently controlled by `controller`.
    async fn controlled_count(&self, controller: WorkerId) -> usize;
}

/// Host-owned registry of open clients.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<ClientId, Client>>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a newly opened client. The client starts uncontrolled.
    pub async fn connect(&self, url: Url, kind: ClientKind) -> Client {
        let client = Client {
            id: ClientId::new(),
            url,
            kind,
            controller: None,
        };
        debug!(client = ?client.id, url = %client.url, "Client connected");
        self.clients.write().await.insert(client.id, client.clone());
        client
    }

    /// Remove a client.
    pub async fn disconnect(&self, id: ClientId) -> Option<Client> {
        let removed = self.clients.write().await.remove(&id);
        if removed.is_some() {
            debug!(client = ?id, "Client disconnected");
        }
        removed
    }

    /// Get a client by ID.
    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.clients.read().await.get(&id).cloned()
    }

    /// All clients, ordered by ID.
    pub async fn list(&self) -> Vec<Client> {
        let clients = self.clients.read().await;
        let mut all: Vec<Client> = clients.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        all
    }

    /// Set (or clear) a client's controlling worker.
    pub async fn set_controller(&self, id: ClientId, controller: Option<WorkerId>) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get_mut(&id) {
            Some(client) => {
                client.controller = controller;
                true
            }
            None => false,
        }
    }

    /// Clients controlled by the given worker, ordered by ID.
    pub async fn controlled_by(&self, controller: WorkerId) -> Vec<Client> {
        let clients = self.clients.read().await;
        let mut controlled: Vec<Client> = clients
            .values()
            .filter(|c| c.controller == Some(controller))
            .cloned()
            .collect();
        controlled.sort_by_key(|c| c.id);
        controlled
    }

    /// Number of connected clients.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether no clients are connected.
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

#[async_trait]
impl ClientsController for ClientRegistry {
    async fn claim_all(&self, scope: &Url, controller: WorkerId) -> usize {
        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for client in clients.values_mut() {
            if !scope_covers(scope, &client.url) {
                continue;
            }
            if client.controller != Some(controller) {
                client.controller = Some(controller);
                claimed += 1;
            }
        }
        debug!(controller = ?controller, scope = %scope, claimed, "Clients claimed");
        claimed
    }

    async fn controlled_count(&self, controller: WorkerId) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.controller == Some(controller))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let registry = ClientRegistry::new();
        assert!(registry.is_empty().await);

        let client = registry
            .connect(url("https://localdrip.test/home"), ClientKind::Window)
            .await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(client.id).await.is_some());
        assert!(registry.get(client.id).await.and_then(|c| c.controller).is_none());

        assert!(registry.disconnect(client.id).await.is_some());
        assert!(registry.disconnect(client.id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_claim_all_takes_over_every_client_in_scope() {
        let registry = ClientRegistry::new();
        let scope = url("https://localdrip.test/");
        let a = registry.connect(url("https://localdrip.test/"), ClientKind::Window).await;
        let b = registry.connect(url("https://localdrip.test/order"), ClientKind::Window).await;

        let old = WorkerId::new();
        let new = WorkerId::new();
        registry.set_controller(a.id, Some(old)).await;

        assert_eq!(registry.controlled_count(old).await, 1);
        assert_eq!(registry.claim_all(&scope, new).await, 2);
        assert_eq!(registry.controlled_count(new).await, 2);
        assert_eq!(registry.controlled_count(old).await, 0);

        // Claiming again changes nothing.
        assert_eq!(registry.claim_all(&scope, new).await, 0);
        assert_eq!(registry.controlled_by(new).await.len(), 2);
        let _ = b;
    }

    #[tokio::test]
    async fn test_claim_stops_at_the_scope_boundary() {
        let registry = ClientRegistry::new();
        let home = registry
            .connect(url("https://localdrip.test/home"), ClientKind::Window)
            .await;
        let portal = registry
            .connect(url("https://localdrip.test/portal/orders"), ClientKind::Window)
            .await;
        let foreign = registry
            .connect(url("https://other.test/portal/"), ClientKind::Window)
            .await;

        let worker = WorkerId::new();
        let scope = url("https://localdrip.test/portal/");
        assert_eq!(registry.claim_all(&scope, worker).await, 1);
        assert_eq!(registry.get(portal.id).await.unwrap().controller, Some(worker));
        assert!(registry.get(home.id).await.unwrap().controller.is_none());
        assert!(registry.get(foreign.id).await.unwrap().controller.is_none());
    }

    #[tokio::test]
    async fn test_set_controller_unknown_client() {
        let registry = ClientRegistry::new();
        assert!(!registry.set_controller(ClientId::new(), Some(WorkerId::new())).await);
    }

    #[tokio::test]
    async fn test_list_ordered_by_id() {
        let registry = ClientRegistry::new();
        let first = registry.connect(url("https://localdrip.test/a"), ClientKind::Window).await;
        let second = registry.connect(url("https://localdrip.test/b"), ClientKind::Worker).await;

        let all = registry.list().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first.id);
        assert_eq!(all[1].id, second.id);
        assert_eq!(all[1].kind, ClientKind::Worker);
    }
}

//! # DripKit SW
//!
//! Offline worker lifecycle and fetch interception for the DripKit
//! offline cache engine.
//!
//! ## Features
//!
//! - **Lifecycle**: install/activate/fetch/message handlers with a
//!   legality-checked state machine
//! - **Versioned shell caches**: one cache instance per deployed version,
//!   stale generations purged at activation
//! - **Fetch interception**: cache-first strategy with a navigation
//!   fallback to the cached shell root
//! - **Client coordination**: update events, the skip-waiting directive,
//!   takeover of open clients
//!
//! ## Architecture
//!
//! ```text
//! WorkerHost (host-runtime shim)
//!     ├── registrations (scope → slot)
//!     │       ├── installing (OfflineWorker)
//!     │       ├── waiting    (OfflineWorker, Installed)
//!     │       └── active     (OfflineWorker, Activated)
//!     ├── ClientRegistry (open clients)
//!     └── CacheStorage
//!             └── Cache ("localdrip-v1", ...)
//! ```
//!
//! The host awaits every lifecycle handler to completion before the next
//! transition: install fully runs before a version may wait, activation
//! cleanup finishes before the version answers a single fetch.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use dripkit_cache::{Cache, CacheError, CacheStorage};
use dripkit_fetch::{CacheMode, FetchError, NetworkBackend, Request, Response};

pub mod clients;
mod strategy;

pub use clients::{Client, ClientId, ClientKind, ClientRegistry, ClientsController};

// ==================== Errors ====================

/// Errors surfaced by worker lifecycle and fetch handling.
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    /// Registration could not produce a worker version. Pages treat this
    /// as diagnostic only and keep running without offline support.
    #[error("Registration failed: {0}")]
    Registration(String),

    /// The operation violated an origin restriction.
    #[error("Security error: {0}")]
    Security(String),

    /// A lifecycle operation ran against a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The network backend failed.
    #[error("Network error: {0}")]
    Network(#[from] FetchError),

    /// A cache operation failed.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// No registration or worker matched the request.
    #[error("Not found: {0}")]
    NotFound(String),
}

// ==================== Worker Identity ====================

/// Unique identifier for a worker version within the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

// ==================== Worker State ====================

/// Lifecycle state of a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Script fetched and parsed, lifecycle not started.
    Parsed,
    /// Install handler running, shell cache being populated.
    Installing,
    /// Install complete, waiting to take over the scope.
    Installed,
    /// Activate handler running, stale caches being purged.
    Activating,
    /// Controlling clients and answering intercepted fetches.
    Activated,
    /// Superseded or discarded. Terminal.
    Redundant,
}

impl WorkerState {
    /// Whether the lifecycle permits moving from this state to `next`.
    /// Forward edges only, plus retirement from any non-terminal state.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        match (*self, next) {
            (WorkerState::Parsed, WorkerState::Installing) => true,
            (WorkerState::Installing, WorkerState::Installed) => true,
            (WorkerState::Installed, WorkerState::Activating) => true,
            (WorkerState::Activating, WorkerState::Activated) => true,
            (WorkerState::Redundant, _) => false,
            (_, WorkerState::Redundant) => true,
            _ => false,
        }
    }

    /// Whether a worker in this state may answer intercepted fetches.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, WorkerState::Activated)
    }

    /// Whether no further lifecycle callbacks will run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Redundant)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        }
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        WorkerState::Parsed
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==================== Shell Manifest ====================

/// The versioned list of shell resources pre-cached at install time.
///
/// `tag` doubles as the cache instance name. Shipping a new shell means
/// shipping a new tag; entries under an existing tag are never refreshed
/// in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellManifest {
    /// Cache version tag, e.g. `localdrip-v1`.
    pub tag: String,
    /// Shell resource paths, resolved against the registration scope.
    pub urls: Vec<String>,
}

impl ShellManifest {
    pub fn new(
        tag: impl Into<String>,
        urls: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            tag: tag.into(),
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }
}

// ==================== Worker Config ====================

/// Per-version configuration, fixed at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// The shell to pre-cache during install.
    pub manifest: ShellManifest,

    /// Path served when a navigation misses the cache and the network is
    /// unreachable. Resolved against the registration scope.
    #[serde(default = "default_navigation_fallback")]
    pub navigation_fallback: String,

    /// Request takeover as soon as install completes instead of waiting
    /// for the skip-waiting directive or for old clients to go away.
    #[serde(default = "default_skip_waiting_on_install")]
    pub skip_waiting_on_install: bool,
}

fn default_navigation_fallback() -> String {
    "/".to_string()
}

fn default_skip_waiting_on_install() -> bool {
    true
}

impl WorkerConfig {
    pub fn new(manifest: ShellManifest) -> Self {
        Self {
            manifest,
            navigation_fallback: default_navigation_fallback(),
            skip_waiting_on_install: default_skip_waiting_on_install(),
        }
    }

    /// Keep the version waiting until the skip-waiting directive arrives
    /// or no clients depend on the previous version.
    pub fn wait_for_directive(mut self) -> Self {
        self.skip_waiting_on_install = false;
        self
    }

    pub fn with_navigation_fallback(mut self, path: impl Into<String>) -> Self {
        self.navigation_fallback = path.into();
        self
    }
}

// ==================== Messages ====================

/// Wire messages a page can post to a worker.
///
/// Only the exact skip-waiting shape parses; anything else fails to
/// deserialize and is ignored, so newer pages stay compatible with older
/// workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// `{"type": "SKIP_WAITING"}`: stop waiting and take over now.
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

// ==================== Install Report ====================

/// Outcome of a shell install pass. Entries fail individually and never
/// abort the install itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Manifest paths stored in this version's cache.
    pub cached: Vec<String>,
    /// Manifest paths that could not be fetched or stored.
    pub failed: Vec<String>,
}

impl InstallReport {
    /// Whether every manifest entry made it into the cache.
    pub fn complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ==================== Events ====================

/// Events the host emits for pages observing a registration.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A worker moved to a new lifecycle state.
    StateChange { worker: WorkerId, state: WorkerState },
    /// A new version started installing for a scope.
    UpdateFound { scope: Url },
    /// A different worker took control of the scope's clients.
    ControllerChange { worker: WorkerId },
    /// A message payload was delivered to a worker.
    Message {
        worker: WorkerId,
        payload: serde_json::Value,
    },
}

// ==================== Offline Worker ====================

/// The worker state machine. One instance per deployed version.
///
/// Lifecycle handlers are driven by a host shim which awaits each to
/// completion before allowing the next transition; the worker itself
/// never spawns background work that outlives a handler.
pub struct OfflineWorker {
    id: WorkerId,
    scope: Url,
    config: WorkerConfig,
    state: WorkerState,
    skip_waiting: bool,
    predecessors: Vec<String>,
    storage: CacheStorage,
    backend: Arc<dyn NetworkBackend>,
    cache: Option<Cache>,
    fallback: Url,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("id", &self.id)
            .field("scope", &self.scope.as_str())
            .field("tag", &self.config.manifest.tag)
            .field("state", &self.state)
            .finish()
    }
}

impl OfflineWorker {
    /// Create a worker in the `Parsed` state. Nothing is fetched or
    /// cached until the host drives `on_install`.
    pub fn new(
        scope: Url,
        config: WorkerConfig,
        storage: CacheStorage,
        backend: Arc<dyn NetworkBackend>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let fallback = scope
            .join(&config.navigation_fallback)
            .unwrap_or_else(|_| scope.clone());
        Self {
            id: WorkerId::new(),
            scope,
            config,
            state: WorkerState::Parsed,
            skip_waiting: false,
            predecessors: Vec::new(),
            storage,
            backend,
            cache: None,
            fallback,
            events,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Name of this version's cache instance.
    pub fn cache_name(&self) -> &str {
        &self.config.manifest.tag
    }

    /// Whether takeover has been requested, either by install-time policy
    /// or by the skip-waiting directive.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting
    }

    /// Record the cache tags left behind by earlier versions of the same
    /// registration. Activation deletes exactly these, so registrations
    /// sharing a storage partition never evict each other's shells.
    pub fn set_predecessors(&mut self, tags: impl IntoIterator<Item = impl Into<String>>) {
        self.predecessors = tags.into_iter().map(Into::into).collect();
    }

    fn set_state(&mut self, next: WorkerState) -> Result<(), WorkerError> {
        if !self.state.can_transition_to(next) {
            return Err(WorkerError::InvalidState(format!(
                "worker {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        debug!(worker = %self.id, from = %self.state, to = %next, "Worker state change");
        self.state = next;
        let _ = self.events.send(WorkerEvent::StateChange {
            worker: self.id,
            state: next,
        });
        Ok(())
    }

    /// Mark this version superseded. No further lifecycle callbacks run.
    pub fn retire(&mut self) {
        if !self.state.is_terminal() {
            let _ = self.set_state(WorkerState::Redundant);
        }
    }

    /// Populate this version's cache with the shell manifest.
    ///
    /// Every entry is fetched with intermediate HTTP caches bypassed, so
    /// the shell always comes from the origin. Entries are attempted
    /// independently; a failed entry is logged and reported, never
    /// aborting the rest. Re-running against the same tag converges on
    /// the same entry set.
    pub async fn on_install(&mut self) -> Result<InstallReport, WorkerError> {
        self.set_state(WorkerState::Installing)?;
        let cache = self.storage.open(&self.config.manifest.tag).await;

        let attempts = self.config.manifest.urls.iter().map(|path| {
            let cache = cache.clone();
            let backend = Arc::clone(&self.backend);
            let resolved = self.scope.join(path);
            let path = path.clone();
            async move {
                let url = match resolved {
                    Ok(url) => url,
                    Err(err) => {
                        warn!(path = %path, error = %err, "Manifest entry is not a resolvable URL");
                        return (path, false);
                    }
                };
                let request = Request::get(url).with_cache_mode(CacheMode::Reload);
                let stored = match backend.fetch(&request).await {
                    Ok(response) if response.ok() => {
                        match cache.put(&request, &response).await {
                            Ok(()) => true,
                            Err(err) => {
                                warn!(path = %path, error = %err, "Failed to store shell entry");
                                false
                            }
                        }
                    }
                    Ok(response) => {
                        warn!(path = %path, status = %response.status, "Shell entry fetch was not successful");
                        false
                    }
                    Err(err) => {
                        warn!(path = %path, error = %err, "Shell entry fetch failed");
                        false
                    }
                };
                (path, stored)
            }
        });

        let mut report = InstallReport::default();
        for (path, stored) in join_all(attempts).await {
            if stored {
                report.cached.push(path);
            } else {
                report.failed.push(path);
            }
        }

        info!(
            worker = %self.id,
            cache = %cache.name(),
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Shell install finished"
        );

        self.cache = Some(cache);
        self.set_state(WorkerState::Installed)?;
        if self.config.skip_waiting_on_install {
            self.skip_waiting = true;
        }
        Ok(report)
    }

    /// Purge cache instances left by older versions of this registration,
    /// then take over the open clients under its scope. Returns how many
    /// clients changed controller.
    ///
    /// Post-condition: this version's cache is the only instance left in
    /// its lineage, so no request can ever be served from a stale shell.
    /// Caches belonging to other registrations on the same partition are
    /// untouched.
    pub async fn on_activate(
        &mut self,
        clients: &dyn ClientsController,
    ) -> Result<usize, WorkerError> {
        self.set_state(WorkerState::Activating)?;

        let current = self.config.manifest.tag.clone();
        let stale = self.predecessors.clone();
        for name in &stale {
            if *name == current {
                continue;
            }
            if self.storage.delete(name).await {
                info!(worker = %self.id, cache = %name, "Purged stale cache");
            }
        }

        let claimed = clients.claim_all(&self.scope, self.id).await;
        info!(worker = %self.id, claimed, cache = %current, "Worker activated");
        self.set_state(WorkerState::Activated)?;
        Ok(claimed)
    }

    /// Answer an intercepted request with the cache-first strategy.
    ///
    /// Only an activated worker intercepts; cross-origin requests go
    /// straight to the network untouched.
    pub async fn on_fetch(&self, request: &Request) -> Result<Response, WorkerError> {
        if !self.state.can_intercept_fetch() {
            return Err(WorkerError::InvalidState(format!(
                "worker {} is {}, fetch needs an activated worker",
                self.id, self.state
            )));
        }
        if !request.is_same_origin(&self.scope) {
            trace!(url = %request.url, "Cross-origin request passes through");
            return self.backend.fetch(request).await.map_err(WorkerError::from);
        }
        let cache = match &self.cache {
            Some(cache) => cache,
            None => {
                return Err(WorkerError::InvalidState(format!(
                    "worker {} has no cache instance",
                    self.id
                )))
            }
        };
        strategy::respond(cache, self.backend.as_ref(), request, &self.fallback).await
    }

    /// Handle a message payload posted by a page. Returns whether the
    /// payload was a recognized directive; unrecognized shapes are
    /// ignored.
    pub async fn on_message(&mut self, payload: serde_json::Value) -> bool {
        match serde_json::from_value::<WorkerMessage>(payload) {
            Ok(WorkerMessage::SkipWaiting) => {
                info!(worker = %self.id, "Skip-waiting directive received");
                self.skip_waiting = true;
                true
            }
            Err(err) => {
                debug!(worker = %self.id, error = %err, "Ignoring unrecognized message");
                false
            }
        }
    }
}

// ==================== Registration ====================

/// Snapshot of a scope's registration, the handle pages observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// URL prefix this registration controls.
    pub scope: Url,
    /// Worker script URL the registration was created from.
    pub script_url: Url,
    /// Version currently running its install handler.
    pub installing: Option<WorkerId>,
    /// Version installed and waiting to take over.
    pub waiting: Option<WorkerId>,
    /// Version controlling the scope's clients.
    pub active: Option<WorkerId>,
}

type SharedWorker = Arc<RwLock<OfflineWorker>>;

struct RegistrationSlot {
    scope: Url,
    script_url: Url,
    // Cache tags ever staged for this scope, oldest first. Activation
    // purges from this list and nothing else.
    lineage: Vec<String>,
    installing: Option<SharedWorker>,
    waiting: Option<SharedWorker>,
    active: Option<SharedWorker>,
}

async fn slot_id(worker: &Option<SharedWorker>) -> Option<WorkerId> {
    match worker {
        Some(worker) => Some(worker.read().await.id()),
        None => None,
    }
}

// ==================== Worker Host ====================

/// Host-runtime shim owning the registrations for one storage partition.
///
/// The host serializes lifecycle transitions per scope: register awaits
/// install before staging the version as waiting, and promotion awaits
/// activation before exposing the version as active. The registrations
/// lock is always taken before a worker lock and never held across an
/// await on one.
pub struct WorkerHost {
    storage: CacheStorage,
    backend: Arc<dyn NetworkBackend>,
    registry: ClientRegistry,
    registrations: Arc<RwLock<HashMap<String, RegistrationSlot>>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

fn scope_key(scope: &Url) -> String {
    scope.to_string()
}

/// Whether a scope controls the given URL: same origin, and the URL path
/// sits under the scope path. Both fetch routing and client claiming use
/// this rule.
pub fn scope_covers(scope: &Url, url: &Url) -> bool {
    scope.origin() == url.origin() && url.path().starts_with(scope.path())
}

impl WorkerHost {
    /// Create a host over the given storage and network backend, with an
    /// empty client registry.
    pub fn new(
        storage: CacheStorage,
        backend: Arc<dyn NetworkBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        Self::with_registry(storage, backend, ClientRegistry::new())
    }

    /// Create a host sharing an existing client registry.
    pub fn with_registry(
        storage: CacheStorage,
        backend: Arc<dyn NetworkBackend>,
        registry: ClientRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let host = Self {
            storage,
            backend,
            registry,
            registrations: Arc::new(RwLock::new(HashMap::new())),
            events,
        };
        (host, event_rx)
    }

    /// The registry of open clients this host controls.
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Register a worker version for a scope.
    ///
    /// The script URL must be same-origin with the scope and the script
    /// must be fetchable with HTTP caches bypassed; either failure is an
    /// error and no version is created. The new version then installs to
    /// completion, becomes the scope's waiting worker (superseding any
    /// previous waiting version), and is promoted if the waiting policy
    /// allows it.
    pub async fn register(
        &self,
        script_url: Url,
        scope: Url,
        config: WorkerConfig,
    ) -> Result<Registration, WorkerError> {
        if script_url.origin() != scope.origin() {
            return Err(WorkerError::Security(format!(
                "script {} is not same-origin with scope {}",
                script_url, scope
            )));
        }

        // The script must be reachable for the version to exist at all.
        let script_request = Request::get(script_url.clone()).with_cache_mode(CacheMode::Reload);
        let script = self
            .backend
            .fetch(&script_request)
            .await
            .map_err(|err| WorkerError::Registration(format!("script fetch failed: {err}")))?;
        if !script.ok() {
            return Err(WorkerError::Registration(format!(
                "script fetch returned {} for {}",
                script.status, script_url
            )));
        }
        debug!(script = %script_url, bytes = script.body_len(), "Worker script fetched");

        let tag = config.manifest.tag.clone();
        let worker = Arc::new(RwLock::new(OfflineWorker::new(
            scope.clone(),
            config,
            self.storage.clone(),
            Arc::clone(&self.backend),
            self.events.clone(),
        )));

        let key = scope_key(&scope);
        let (predecessors, superseded) = {
            let mut registrations = self.registrations.write().await;
            let slot = registrations
                .entry(key.clone())
                .or_insert_with(|| RegistrationSlot {
                    scope: scope.clone(),
                    script_url: script_url.clone(),
                    lineage: Vec::new(),
                    installing: None,
                    waiting: None,
                    active: None,
                });
            slot.script_url = script_url.clone();
            let predecessors: Vec<String> = slot
                .lineage
                .iter()
                .filter(|staged| **staged != tag)
                .cloned()
                .collect();
            if !slot.lineage.contains(&tag) {
                slot.lineage.push(tag.clone());
            }
            slot.installing = Some(Arc::clone(&worker));
            // A waiting version that never took over is gone for good.
            (predecessors, slot.waiting.take())
        };
        if let Some(stale) = superseded {
            stale.write().await.retire();
        }
        worker.write().await.set_predecessors(predecessors);
        let _ = self.events.send(WorkerEvent::UpdateFound {
            scope: scope.clone(),
        });

        // Install runs to completion before the version may wait. The
        // result is bound so the worker guard drops before either arm
        // locks the worker again.
        let installed = worker.write().await.on_install().await;
        if let Err(err) = installed {
            {
                let mut registrations = self.registrations.write().await;
                if let Some(slot) = registrations.get_mut(&key) {
                    let staged = slot
                        .installing
                        .as_ref()
                        .map_or(false, |current| Arc::ptr_eq(current, &worker));
                    if staged {
                        slot.installing = None;
                    }
                }
            }
            worker.write().await.retire();
            return Err(err);
        }

        let staged = {
            let mut registrations = self.registrations.write().await;
            match registrations.get_mut(&key) {
                Some(slot)
                    if slot
                        .installing
                        .as_ref()
                        .map_or(false, |current| Arc::ptr_eq(current, &worker)) =>
                {
                    slot.installing = None;
                    Some(slot.waiting.replace(Arc::clone(&worker)))
                }
                _ => None,
            }
        };
        match staged {
            Some(displaced) => {
                if let Some(stale) = displaced {
                    stale.write().await.retire();
                }
            }
            // The scope was unregistered or restaged by a newer register
            // while install ran; the newer record wins.
            None => {
                worker.write().await.retire();
                return Err(WorkerError::Registration(format!(
                    "registration for {scope} was superseded during install"
                )));
            }
        }

        self.maybe_promote(&scope).await?;
        match self.get_registration(&scope).await {
            Some(registration) => Ok(registration),
            None => Err(WorkerError::Registration(format!(
                "registration for {} disappeared during install",
                scope
            ))),
        }
    }

    /// Deliver a message payload to the scope's waiting worker.
    ///
    /// Returns whether the payload was recognized. A recognized
    /// skip-waiting directive triggers immediate promotion.
    pub async fn post_message(
        &self,
        scope: &Url,
        payload: serde_json::Value,
    ) -> Result<bool, WorkerError> {
        let waiting = {
            let registrations = self.registrations.read().await;
            registrations
                .get(&scope_key(scope))
                .and_then(|slot| slot.waiting.clone())
        };
        let waiting = match waiting {
            Some(waiting) => waiting,
            None => {
                return Err(WorkerError::NotFound(format!(
                    "no waiting worker for scope {scope}"
                )))
            }
        };

        let (id, recognized) = {
            let mut worker = waiting.write().await;
            let recognized = worker.on_message(payload.clone()).await;
            (worker.id(), recognized)
        };
        let _ = self.events.send(WorkerEvent::Message { worker: id, payload });

        if recognized {
            self.maybe_promote(scope).await?;
        }
        Ok(recognized)
    }

    /// Route a fetch from a controlled page.
    ///
    /// The request goes to the activated worker with the longest matching
    /// scope; with no such worker it passes through to the network
    /// untouched.
    pub async fn handle_fetch(&self, request: Request) -> Result<Response, WorkerError> {
        match self.controlling_worker(&request).await {
            Some(worker) => worker.read().await.on_fetch(&request).await,
            None => {
                trace!(url = %request.url, "No controlling worker, passing through");
                self.backend.fetch(&request).await.map_err(WorkerError::from)
            }
        }
    }

    /// Snapshot the registration for a scope.
    pub async fn get_registration(&self, scope: &Url) -> Option<Registration> {
        let (scope, script_url, installing, waiting, active) = {
            let registrations = self.registrations.read().await;
            let slot = registrations.get(&scope_key(scope))?;
            (
                slot.scope.clone(),
                slot.script_url.clone(),
                slot.installing.clone(),
                slot.waiting.clone(),
                slot.active.clone(),
            )
        };
        Some(Registration {
            scope,
            script_url,
            installing: slot_id(&installing).await,
            waiting: slot_id(&waiting).await,
            active: slot_id(&active).await,
        })
    }

    /// Drop a scope's registration and retire its workers. Returns
    /// whether a registration existed. Cache instances are left in
    /// storage; re-registering the scope starts a fresh lineage.
    pub async fn unregister(&self, scope: &Url) -> bool {
        let slot = self.registrations.write().await.remove(&scope_key(scope));
        let slot = match slot {
            Some(slot) => slot,
            None => return false,
        };
        for worker in [slot.installing, slot.waiting, slot.active]
            .into_iter()
            .flatten()
        {
            worker.write().await.retire();
        }
        info!(scope = %scope, "Registration removed");
        true
    }

    /// Promote the scope's waiting worker if the waiting policy allows:
    /// takeover was requested, or no clients depend on the active
    /// version. Returns whether a promotion happened.
    async fn maybe_promote(&self, scope: &Url) -> Result<bool, WorkerError> {
        let (waiting, active) = {
            let registrations = self.registrations.read().await;
            match registrations.get(&scope_key(scope)) {
                Some(slot) => (slot.waiting.clone(), slot.active.clone()),
                None => (None, None),
            }
        };
        let waiting = match waiting {
            Some(waiting) => waiting,
            None => return Ok(false),
        };

        let eligible = if waiting.read().await.skip_waiting_requested() {
            true
        } else {
            match active {
                None => true,
                Some(active) => {
                    let id = active.read().await.id();
                    self.registry.controlled_count(id).await == 0
                }
            }
        };

        if eligible {
            self.promote(scope).await?;
        }
        Ok(eligible)
    }

    /// Retire the active version and activate the waiting one. The
    /// activation handler finishes before the version is exposed as
    /// active, so a fetch never races stale-cache cleanup.
    async fn promote(&self, scope: &Url) -> Result<(), WorkerError> {
        let key = scope_key(scope);
        let (worker, old) = {
            let mut registrations = self.registrations.write().await;
            let slot = match registrations.get_mut(&key) {
                Some(slot) => slot,
                None => {
                    return Err(WorkerError::NotFound(format!(
                        "no registration for scope {scope}"
                    )))
                }
            };
            let worker = match slot.waiting.take() {
                Some(worker) => worker,
                None => return Ok(()),
            };
            (worker, slot.active.take())
        };

        if let Some(old) = old {
            old.write().await.retire();
        }

        // A failed activation discards the version rather than leaving a
        // half-activated controller in place. Bound first so the worker
        // guard drops before the failure arm locks the worker again.
        let activated = worker.write().await.on_activate(&self.registry).await;
        if let Err(err) = activated {
            worker.write().await.retire();
            return Err(err);
        }

        {
            let mut registrations = self.registrations.write().await;
            if let Some(slot) = registrations.get_mut(&key) {
                slot.active = Some(Arc::clone(&worker));
            }
        }

        let id = worker.read().await.id();
        let _ = self.events.send(WorkerEvent::ControllerChange { worker: id });
        Ok(())
    }

    /// The activated worker whose scope covers the request, if any.
    /// Longest matching scope wins.
    async fn controlling_worker(&self, request: &Request) -> Option<SharedWorker> {
        let registrations = self.registrations.read().await;
        let mut best: Option<(usize, SharedWorker)> = None;
        for slot in registrations.values() {
            let worker = match &slot.active {
                Some(worker) => Arc::clone(worker),
                None => continue,
            };
            if !scope_covers(&slot.scope, &request.url) {
                continue;
            }
            let scope_path = slot.scope.path();
            if best
                .as_ref()
                .map_or(true, |(len, _)| scope_path.len() > *len)
            {
                best = Some((scope_path.len(), worker));
            }
        }
        best.map(|(_, worker)| worker)
    }
}

// ==================== Tests ====================

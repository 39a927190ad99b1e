//! Live connection bookkeeping.
//!
//! One write lock covers the metadata map and every scope index, so a
//! connection is either present everywhere or nowhere. The lock is never held
//! across an `.await`; readers get snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use herald_core::{
    ConnectionId, Envelope, PrincipalId, ProjectId, RegistrationError, Scope, ScopeBinding,
    Target,
};
use herald_settings::ConnectionLimitPolicy;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::connection::{ClientConnection, ConnectionState};

/// Per-principal connection cap.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionLimits {
    /// Live connections allowed per principal, across scopes.
    pub max_per_principal: usize,
    /// What happens to the connection that would exceed the cap.
    pub policy: ConnectionLimitPolicy,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_per_principal: 10,
            policy: ConnectionLimitPolicy::EvictOldest,
        }
    }
}

/// Snapshot of one connection's metadata.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Owning principal.
    pub principal_id: PrincipalId,
    /// Scope binding (project id included for project scope).
    #[serde(flatten)]
    pub binding: ScopeBinding,
    /// When the connection was registered.
    pub connected_at: DateTime<Utc>,
    /// Last confirmed socket write or client ping.
    pub last_heartbeat: DateTime<Utc>,
}

/// Connection counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// All registered connections.
    pub total: usize,
    /// User-scope connections.
    pub user: usize,
    /// Project-scope connections.
    pub project: usize,
    /// Dashboard-scope connections.
    pub dashboard: usize,
    /// Distinct principals with at least one connection.
    pub principals: usize,
    /// Distinct projects with at least one connection.
    pub projects: usize,
}

struct Entry {
    connection: Arc<ClientConnection>,
    principal_id: PrincipalId,
    binding: ScopeBinding,
    connected_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Default)]
struct Indexes {
    entries: HashMap<ConnectionId, Entry>,
    by_principal: HashMap<PrincipalId, HashSet<ConnectionId>>,
    by_project: HashMap<ProjectId, HashSet<ConnectionId>>,
    dashboard: HashSet<ConnectionId>,
    next_seq: u64,
    closed: bool,
}

impl Indexes {
    fn insert(&mut self, entry: Entry) {
        let id = entry.connection.id.clone();
        let _ = self
            .by_principal
            .entry(entry.principal_id.clone())
            .or_default()
            .insert(id.clone());
        match &entry.binding {
            ScopeBinding::Project { project_id } => {
                let _ = self
                    .by_project
                    .entry(project_id.clone())
                    .or_default()
                    .insert(id.clone());
            }
            ScopeBinding::Dashboard => {
                let _ = self.dashboard.insert(id.clone());
            }
            ScopeBinding::User => {}
        }
        let _ = self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: &ConnectionId) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        if let Some(set) = self.by_principal.get_mut(&entry.principal_id) {
            let _ = set.remove(id);
            if set.is_empty() {
                let _ = self.by_principal.remove(&entry.principal_id);
            }
        }
        match &entry.binding {
            ScopeBinding::Project { project_id } => {
                if let Some(set) = self.by_project.get_mut(project_id) {
                    let _ = set.remove(id);
                    if set.is_empty() {
                        let _ = self.by_project.remove(project_id);
                    }
                }
            }
            ScopeBinding::Dashboard => {
                let _ = self.dashboard.remove(id);
            }
            ScopeBinding::User => {}
        }
        Some(entry)
    }

    fn oldest_of(&self, principal_id: &PrincipalId) -> Option<ConnectionId> {
        self.by_principal
            .get(principal_id)?
            .iter()
            .filter_map(|id| self.entries.get(id))
            .min_by_key(|e| e.seq)
            .map(|e| e.connection.id.clone())
    }

    fn principal_connections(
        &self,
        principal_id: &PrincipalId,
        keep: impl Fn(&ScopeBinding) -> bool,
    ) -> Vec<Arc<ClientConnection>> {
        self.by_principal
            .get(principal_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
            .filter(|e| keep(&e.binding))
            .map(|e| e.connection.clone())
            .collect()
    }

    fn collect<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a ConnectionId>,
    ) -> Vec<Arc<ClientConnection>> {
        ids.into_iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.connection.clone())
            .collect()
    }
}

/// Registry of live connections and their scope bindings.
pub struct ConnectionRegistry {
    inner: RwLock<Indexes>,
    limits: ConnectionLimits,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            inner: RwLock::new(Indexes::default()),
            limits,
        }
    }

    /// Admit a connection under one scope binding.
    ///
    /// When the principal is at its cap, `EvictOldest` closes the principal's
    /// oldest connection (it gets a `connection_limit` error frame first) and
    /// `Reject` refuses this one.
    pub fn register(
        &self,
        connection: Arc<ClientConnection>,
        scope: Scope,
        principal_id: PrincipalId,
        project_id: Option<ProjectId>,
    ) -> Result<ConnectionId, RegistrationError> {
        if principal_id.is_blank() {
            return Err(RegistrationError::MissingPrincipal);
        }
        let binding = ScopeBinding::from_parts(scope, project_id)?;
        let id = connection.id.clone();

        let evicted = {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(RegistrationError::ShuttingDown);
            }
            if inner.entries.contains_key(&id)
                || connection.state() != ConnectionState::Connecting
            {
                return Err(RegistrationError::AlreadyRegistered(id.into_inner()));
            }

            let held = inner.by_principal.get(&principal_id).map_or(0, HashSet::len);
            let mut evicted = None;
            if held >= self.limits.max_per_principal {
                match self.limits.policy {
                    ConnectionLimitPolicy::Reject => {
                        return Err(RegistrationError::TooManyConnections {
                            principal_id: principal_id.into_inner(),
                            limit: self.limits.max_per_principal,
                        });
                    }
                    ConnectionLimitPolicy::EvictOldest => {
                        evicted = inner
                            .oldest_of(&principal_id)
                            .and_then(|oldest| inner.remove(&oldest));
                    }
                }
            }

            let _ = connection.mark_connected();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.insert(Entry {
                connection: connection.clone(),
                principal_id: principal_id.clone(),
                binding: binding.clone(),
                connected_at: Utc::now(),
                seq,
            });
            evicted
        };

        if let Some(old) = evicted {
            warn!(
                conn_id = %old.connection.id,
                principal_id = %principal_id,
                limit = self.limits.max_per_principal,
                "evicting oldest connection"
            );
            let notice = Envelope::error(
                "connection_limit",
                format!(
                    "principal has more than {} connections",
                    self.limits.max_per_principal
                ),
            )
            .stamped(Utc::now());
            let _ = old.connection.send(Arc::new(notice.encode()));
            shut(&old.connection);
        }

        info!(
            conn_id = %id,
            principal_id = %principal_id,
            scope = %binding.scope(),
            project_id = binding.project_id().map(ProjectId::as_str),
            "connection registered"
        );
        Ok(id)
    }

    /// Remove a connection from every index. Unknown ids are a no-op.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.inner.write().remove(id);
        match removed {
            Some(entry) => {
                let _ = entry.connection.mark_disconnected();
                debug!(conn_id = %id, "connection unregistered");
                true
            }
            None => false,
        }
    }

    /// Unregister and tell the session to close the socket.
    pub fn force_disconnect(&self, id: &ConnectionId) -> bool {
        let removed = self.inner.write().remove(id);
        match removed {
            Some(entry) => {
                shut(&entry.connection);
                debug!(conn_id = %id, "connection force-disconnected");
                true
            }
            None => false,
        }
    }

    /// Stop admitting connections and shut every registered one.
    ///
    /// The flag is set under the same write lock that [`register`](Self::register)
    /// takes, so a registration racing with this call either lands before it
    /// (and is drained here) or fails with `ShuttingDown`. Each drained
    /// connection is offered `farewell` before its socket is closed. Returns
    /// how many connections were shut.
    pub fn close_all(&self, farewell: &Arc<String>) -> usize {
        let drained: Vec<Entry> = {
            let mut inner = self.inner.write();
            inner.closed = true;
            let ids: Vec<ConnectionId> = inner.entries.keys().cloned().collect();
            ids.iter().filter_map(|id| inner.remove(id)).collect()
        };
        for entry in &drained {
            let _ = entry.connection.send(farewell.clone());
            shut(&entry.connection);
        }
        info!(connections = drained.len(), "registry closed");
        drained.len()
    }

    /// Whether [`close_all`](Self::close_all) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// User-scope connections of one principal.
    pub fn lookup_by_user(&self, principal_id: &PrincipalId) -> Vec<Arc<ClientConnection>> {
        self.inner
            .read()
            .principal_connections(principal_id, |b| matches!(b, ScopeBinding::User))
    }

    /// Connections bound to one project.
    pub fn lookup_by_project(&self, project_id: &ProjectId) -> Vec<Arc<ClientConnection>> {
        let inner = self.inner.read();
        inner.collect(inner.by_project.get(project_id).into_iter().flatten())
    }

    /// Dashboard-scope connections.
    pub fn lookup_dashboard(&self) -> Vec<Arc<ClientConnection>> {
        let inner = self.inner.read();
        inner.collect(&inner.dashboard)
    }

    /// Project-scope connections owned by one principal, any project.
    pub fn lookup_user_projects(&self, principal_id: &PrincipalId) -> Vec<Arc<ClientConnection>> {
        self.inner.read().principal_connections(principal_id, |b| {
            matches!(b, ScopeBinding::Project { .. })
        })
    }

    /// Recipients of a target.
    pub fn lookup(&self, target: &Target) -> Vec<Arc<ClientConnection>> {
        match target {
            Target::User(id) => self.lookup_by_user(id),
            Target::Project(id) => self.lookup_by_project(id),
            Target::Dashboard => self.lookup_dashboard(),
            Target::UserProjects(id) => self.lookup_user_projects(id),
        }
    }

    /// Every registered connection.
    pub fn all(&self) -> Vec<Arc<ClientConnection>> {
        let inner = self.inner.read();
        inner.entries.values().map(|e| e.connection.clone()).collect()
    }

    /// Metadata snapshot for one connection.
    pub fn metadata(&self, id: &ConnectionId) -> Option<ConnectionMetadata> {
        let inner = self.inner.read();
        let entry = inner.entries.get(id)?;
        let idle = TimeDelta::from_std(entry.connection.last_heartbeat_elapsed())
            .unwrap_or_else(|_| TimeDelta::zero());
        Some(ConnectionMetadata {
            connection_id: id.clone(),
            principal_id: entry.principal_id.clone(),
            binding: entry.binding.clone(),
            connected_at: entry.connected_at,
            last_heartbeat: Utc::now() - idle,
        })
    }

    /// Whether an id is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().entries.contains_key(id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counts by scope.
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        let mut stats = RegistryStats {
            total: inner.entries.len(),
            principals: inner.by_principal.len(),
            projects: inner.by_project.len(),
            dashboard: inner.dashboard.len(),
            ..RegistryStats::default()
        };
        for entry in inner.entries.values() {
            match entry.binding {
                ScopeBinding::User => stats.user += 1,
                ScopeBinding::Project { .. } => stats.project += 1,
                ScopeBinding::Dashboard => {}
            }
        }
        stats
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(ConnectionLimits::default())
    }
}

fn shut(connection: &ClientConnection) {
    let _ = connection.begin_disconnect();
    connection.close();
    let _ = connection.mark_disconnected();
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

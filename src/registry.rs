//! Application Registry - authoritative map of connection to registration
//!
//! One entry per physical connection. Disconnected entries are kept (up to a
//! retention bound) for inspection but never take part in aggregation or
//! routing. All operations go through `DashMap` shard locks, so registrations
//! from different connections never serialize behind one global lock.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use crate::id::ConnectionId;
use crate::ipc::{NamespacedToolName, ToolDefinition};

/// Default number of disconnected registrations kept for inspection.
pub const DEFAULT_DISCONNECTED_RETENTION: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// One connected (or formerly connected) application.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRegistration {
    pub connection_id: ConnectionId,
    pub application_name: String,
    pub tools: Vec<ToolDefinition>,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Registration order across the whole registry; larger is newer.
    pub sequence: u64,
}

impl ApplicationRegistration {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t.name == tool)
    }
}

/// Whether `register_app` created a new entry or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created,
    Updated,
}

/// Owner of a namespaced tool at routing time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTool {
    pub connection_id: ConnectionId,
    pub app_name: String,
    /// Unprefixed tool name as the host registered it
    pub tool: String,
}

#[derive(Debug)]
pub struct AppRegistry {
    apps: DashMap<ConnectionId, ApplicationRegistration>,
    sequence: AtomicU64,
    retention: usize,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_DISCONNECTED_RETENTION)
    }

    /// Keep at most `retention` disconnected records.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            apps: DashMap::new(),
            sequence: AtomicU64::new(1),
            retention,
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Insert or replace the registration for `connection_id`.
    ///
    /// The tool list is replaced wholesale, never merged.
    pub fn register_app(
        &self,
        connection_id: &ConnectionId,
        application_name: &str,
        tools: Vec<ToolDefinition>,
    ) -> RegistrationOutcome {
        let now = Utc::now();
        let sequence = self.next_sequence();

        match self.apps.entry(connection_id.clone()) {
            Entry::Occupied(mut entry) => {
                let reg = entry.get_mut();
                reg.application_name = application_name.to_string();
                reg.tools = tools;
                reg.status = ConnectionStatus::Connected;
                reg.registered_at = now;
                reg.disconnected_at = None;
                reg.sequence = sequence;
                RegistrationOutcome::Updated
            }
            Entry::Vacant(entry) => {
                entry.insert(ApplicationRegistration {
                    connection_id: connection_id.clone(),
                    application_name: application_name.to_string(),
                    tools,
                    status: ConnectionStatus::Connected,
                    connected_at: now,
                    registered_at: now,
                    disconnected_at: None,
                    sequence,
                });
                RegistrationOutcome::Created
            }
        }
    }

    /// Flip an entry to disconnected. Returns the application name if the
    /// entry was connected.
    pub fn mark_disconnected(&self, connection_id: &ConnectionId) -> Option<String> {
        let name = {
            let mut reg = self.apps.get_mut(connection_id)?;
            if !reg.is_connected() {
                return None;
            }
            reg.status = ConnectionStatus::Disconnected;
            reg.disconnected_at = Some(Utc::now());
            reg.application_name.clone()
        };
        self.prune_disconnected();
        Some(name)
    }

    fn prune_disconnected(&self) {
        let mut disconnected: Vec<(u64, ConnectionId)> = self
            .apps
            .iter()
            .filter(|r| !r.is_connected())
            .map(|r| (r.sequence, r.connection_id.clone()))
            .collect();

        if disconnected.len() <= self.retention {
            return;
        }

        disconnected.sort();
        let excess = disconnected.len() - self.retention;
        for (_, id) in disconnected.into_iter().take(excess) {
            self.apps.remove_if(&id, |_, r| !r.is_connected());
        }
    }

    /// Connected registrations, oldest registration first.
    fn connected_sorted(&self) -> Vec<ApplicationRegistration> {
        let mut regs: Vec<_> = self
            .apps
            .iter()
            .filter(|r| r.is_connected())
            .map(|r| r.value().clone())
            .collect();
        regs.sort_by_key(|r| r.sequence);
        regs
    }

    /// Namespaced union of tools from all connected registrations.
    pub fn get_all_tools(&self) -> Vec<ToolDefinition> {
        self.connected_sorted()
            .iter()
            .flat_map(|reg| {
                reg.tools
                    .iter()
                    .map(|tool| tool.namespaced(&reg.application_name))
            })
            .collect()
    }

    /// Resolve `"{app}:{tool}"` to the connected registration that owns it.
    ///
    /// When several connected applications share the name and the tool, the
    /// most recently registered one wins.
    pub fn find_app_by_tool(&self, namespaced_name: &str) -> Option<ResolvedTool> {
        let name = NamespacedToolName::parse(namespaced_name)?;

        let mut matches: Vec<(u64, ConnectionId)> = self
            .apps
            .iter()
            .filter(|r| {
                r.is_connected() && r.application_name == name.app && r.has_tool(&name.tool)
            })
            .map(|r| (r.sequence, r.connection_id.clone()))
            .collect();

        matches.sort();
        let (_, connection_id) = matches.pop()?;

        if !matches.is_empty() {
            tracing::warn!(
                tool = %namespaced_name,
                candidates = matches.len() + 1,
                chosen = %connection_id,
                "Ambiguous tool name, routing to most recently registered application"
            );
        }

        Some(ResolvedTool {
            connection_id,
            app_name: name.app,
            tool: name.tool,
        })
    }

    /// Get a registration by connection, whatever its status.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<ApplicationRegistration> {
        self.apps.get(connection_id).map(|r| r.value().clone())
    }

    /// Whether `connection_id` is registered and connected.
    pub fn is_connected(&self, connection_id: &ConnectionId) -> bool {
        self.apps
            .get(connection_id)
            .is_some_and(|r| r.is_connected())
    }

    /// Snapshot of every retained registration, oldest first.
    pub fn applications(&self) -> Vec<ApplicationRegistration> {
        let mut regs: Vec<_> = self.apps.iter().map(|r| r.value().clone()).collect();
        regs.sort_by_key(|r| r.sequence);
        regs
    }

    pub fn connected_count(&self) -> usize {
        self.apps.iter().filter(|r| r.is_connected()).count()
    }
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tools(names: &[&str]) -> Vec<ToolDefinition> {
        names
            .iter()
            .map(|n| ToolDefinition::new(*n, format!("{} tool", n)))
            .collect()
    }

    fn names(defs: &[ToolDefinition]) -> Vec<String> {
        defs.iter().map(|d| d.name.clone()).collect()
    }

    #[test]
    fn test_register_created_then_updated() {
        let registry = AppRegistry::new();
        let conn = ConnectionId::from("c1");

        assert_eq!(
            registry.register_app(&conn, "Writer", tools(&["SaveFile"])),
            RegistrationOutcome::Created
        );
        assert_eq!(
            registry.register_app(&conn, "Writer", tools(&["Open"])),
            RegistrationOutcome::Updated
        );

        // Replaced, not merged
        assert_eq!(names(&registry.get_all_tools()), vec!["Writer:Open"]);
    }

    #[test]
    fn test_get_all_tools_namespaces_connected_only() {
        let registry = AppRegistry::new();
        let a = ConnectionId::from("a");
        let b = ConnectionId::from("b");
        registry.register_app(&a, "Writer", tools(&["SaveFile", "Open"]));
        registry.register_app(&b, "Painter", tools(&["Fill"]));

        assert_eq!(
            names(&registry.get_all_tools()),
            vec!["Writer:SaveFile", "Writer:Open", "Painter:Fill"]
        );

        registry.mark_disconnected(&a);
        assert_eq!(names(&registry.get_all_tools()), vec!["Painter:Fill"]);
    }

    #[test]
    fn test_mark_disconnected_keeps_record() {
        let registry = AppRegistry::new();
        let conn = ConnectionId::from("c1");
        registry.register_app(&conn, "Writer", tools(&["SaveFile"]));

        assert_eq!(registry.mark_disconnected(&conn), Some("Writer".to_string()));
        let reg = registry.get(&conn).unwrap();
        assert_eq!(reg.status, ConnectionStatus::Disconnected);
        assert!(reg.disconnected_at.is_some());
        assert!(!registry.is_connected(&conn));

        // Second call is a no-op
        assert_eq!(registry.mark_disconnected(&conn), None);
        assert_eq!(registry.mark_disconnected(&ConnectionId::from("unknown")), None);
    }

    #[test]
    fn test_find_app_by_tool() {
        let registry = AppRegistry::new();
        let conn = ConnectionId::from("c1");
        registry.register_app(&conn, "Writer", tools(&["SaveFile"]));

        let resolved = registry.find_app_by_tool("Writer:SaveFile").unwrap();
        assert_eq!(resolved.connection_id, conn);
        assert_eq!(resolved.app_name, "Writer");
        assert_eq!(resolved.tool, "SaveFile");

        assert!(registry.find_app_by_tool("Writer:Missing").is_none());
        assert!(registry.find_app_by_tool("Ghost:Anything").is_none());
        assert!(registry.find_app_by_tool("SaveFile").is_none());
    }

    #[test]
    fn test_find_ignores_disconnected() {
        let registry = AppRegistry::new();
        let conn = ConnectionId::from("c1");
        registry.register_app(&conn, "Writer", tools(&["SaveFile"]));
        registry.mark_disconnected(&conn);
        assert!(registry.find_app_by_tool("Writer:SaveFile").is_none());
    }

    #[test]
    fn test_duplicate_app_name_prefers_most_recent() {
        let registry = AppRegistry::new();
        let first = ConnectionId::from("first");
        let second = ConnectionId::from("second");
        registry.register_app(&first, "Writer", tools(&["SaveFile"]));
        registry.register_app(&second, "Writer", tools(&["SaveFile"]));

        // Both listed under the shared prefix
        assert_eq!(
            names(&registry.get_all_tools()),
            vec!["Writer:SaveFile", "Writer:SaveFile"]
        );
        assert_eq!(
            registry.find_app_by_tool("Writer:SaveFile").unwrap().connection_id,
            second
        );

        // Re-registering the older connection makes it the newest
        registry.register_app(&first, "Writer", tools(&["SaveFile"]));
        assert_eq!(
            registry.find_app_by_tool("Writer:SaveFile").unwrap().connection_id,
            first
        );

        registry.mark_disconnected(&first);
        assert_eq!(
            registry.find_app_by_tool("Writer:SaveFile").unwrap().connection_id,
            second
        );
    }

    #[test]
    fn test_retention_prunes_oldest_disconnected() {
        let registry = AppRegistry::with_retention(2);
        let live = ConnectionId::from("live");
        registry.register_app(&live, "Live", tools(&["x"]));

        for i in 0..4 {
            let conn = ConnectionId::from(format!("gone-{}", i).as_str());
            registry.register_app(&conn, "Gone", tools(&["x"]));
            registry.mark_disconnected(&conn);
        }

        let retained: Vec<String> = registry
            .applications()
            .iter()
            .map(|r| r.connection_id.to_string())
            .collect();
        assert_eq!(retained, vec!["live", "gone-2", "gone-3"]);
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn test_concurrent_registrations() {
        let registry = Arc::new(AppRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let conn = ConnectionId::from(format!("c{}", i).as_str());
                    for _ in 0..50 {
                        registry.register_app(&conn, &format!("App{}", i), tools(&["t"]));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(registry.connected_count(), 8);
        assert_eq!(registry.get_all_tools().len(), 8);
    }
}

//! Per-client session records, keyed by MCP client id
//!
//! The MCP client id is the identity a client presents during initialize;
//! it is distinct from the MQTT client id of either peer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::protocol::ClientInfo;

/// Server-side record of one logical client
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub mcp_client_id: String,
    /// Version the client asked for during initialize
    pub protocol_version: String,
    pub client_info: ClientInfo,
    /// Capabilities echoed opaquely from the client
    pub capabilities: Value,
    /// Set when `notifications/initialized` arrives
    pub initialized: bool,
}

/// Thread-safe session table. The engine is the only mutator; embedders may
/// read the key set.
#[derive(Clone, Default)]
pub struct SessionTable {
    sessions: Arc<Mutex<HashMap<String, ClientSession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, replacing any prior session for the same client id
    /// (the client has restarted).
    pub fn insert(&self, session: ClientSession) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(session.mcp_client_id.clone(), session);
    }

    pub fn remove(&self, client_id: &str) -> Option<ClientSession> {
        self.sessions.lock().unwrap().remove(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<ClientSession> {
        self.sessions.lock().unwrap().get(client_id).cloned()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(client_id)
    }

    /// Snapshot of all client ids
    pub fn client_ids(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.sessions.lock().unwrap().clear();
    }

    /// Flag a session as initialized.
    ///
    /// Returns whether this was the first transition plus the recorded client
    /// identity, so the caller can fire its connected callback exactly once
    /// per session and outside the table lock. `None` for unknown clients.
    pub fn mark_initialized(&self, client_id: &str) -> Option<(bool, ClientInfo)> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(client_id)?;
        let first = !session.initialized;
        session.initialized = true;
        Some((first, session.client_info.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(client_id: &str) -> ClientSession {
        ClientSession {
            mcp_client_id: client_id.to_string(),
            protocol_version: "2024-11-05".to_string(),
            client_info: ClientInfo {
                name: "cli".to_string(),
                version: "0.1".to_string(),
            },
            capabilities: json!({}),
            initialized: false,
        }
    }

    #[test]
    fn insert_replaces_prior_session() {
        let table = SessionTable::new();
        table.insert(session("c1"));
        table.mark_initialized("c1");

        // Same client id again: fresh record, initialized flag reset.
        table.insert(session("c1"));
        assert_eq!(table.len(), 1);
        assert!(!table.get("c1").unwrap().initialized);
    }

    #[test]
    fn remove_is_none_when_absent() {
        let table = SessionTable::new();
        assert!(table.remove("ghost").is_none());
        table.insert(session("c1"));
        assert!(table.remove("c1").is_some());
        assert!(table.remove("c1").is_none());
    }

    #[test]
    fn mark_initialized_reports_first_transition_only() {
        let table = SessionTable::new();
        assert!(table.mark_initialized("unknown").is_none());

        table.insert(session("c1"));
        let (first, info) = table.mark_initialized("c1").unwrap();
        assert!(first);
        assert_eq!(info.name, "cli");

        let (first, _) = table.mark_initialized("c1").unwrap();
        assert!(!first);
    }

    #[test]
    fn client_ids_snapshot() {
        let table = SessionTable::new();
        table.insert(session("c1"));
        table.insert(session("c2"));
        let mut ids = table.client_ids();
        ids.sort();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);
    }
}

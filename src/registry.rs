//! Registry of paired browser clients.
//!
//! [`ClientRegistry`] maps peer ids to [`RemoteClient`]s. It is fed by STATUS
//! envelopes from the relay and by a bulk load from the store at startup.
//!
//! ## STATUS handling
//!
//! | status              | effect                                                   |
//! |---------------------|----------------------------------------------------------|
//! | `paired`            | create or refresh the client as `paired`; auto-select    |
//! | `peer_disconnected` | mark `disconnected` (the entry is kept)                  |
//! | `peer_reconnected`  | mark a known client `paired` again                       |
//! | `unpaired`          | remove the client                                        |
//!
//! When a STATUS names no peer, the last three apply to the selected client.
//! Clients survive local reconnects (they are only marked `disconnected`) and
//! every mutation is mirrored to the store; store failures are logged.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::protocol::{PeerStatus, StatusPayload};
use crate::store::Store;
use crate::util::short_id;

/// Lifecycle of a remote peer as seen from the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Connecting,
    Connected,
    Paired,
    Disconnected,
    Error,
}

impl ClientStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Paired => "paired",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetadata {
    #[serde(default = "default_browser")]
    pub browser: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_title: Option<String>,
}

fn default_browser() -> String {
    "Chrome".to_string()
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            browser: default_browser(),
            current_url: None,
            current_title: None,
        }
    }
}

/// A paired browser extension instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteClient {
    pub id: String,
    pub name: String,
    pub status: ClientStatus,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub metadata: ClientMetadata,
}

impl RemoteClient {
    /// New client named after its browser and the start of its id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let metadata = ClientMetadata::default();
        Self {
            name: format!("{} {}", metadata.browser, short_id(&id)),
            id,
            status: ClientStatus::Disconnected,
            last_active: Utc::now(),
            metadata,
        }
    }

    fn absorb(&mut self, status: &StatusPayload) {
        if let Some(url) = &status.current_url {
            self.metadata.current_url = Some(url.clone());
        }
        if let Some(title) = &status.current_title {
            self.metadata.current_title = Some(title.clone());
        }
        if let Some(browser) = &status.browser {
            self.metadata.browser.clone_from(browser);
        }
    }
}

/// What a STATUS envelope did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Paired {
        client: RemoteClient,
        /// First time this id was seen.
        created: bool,
        /// The client became the selection because nothing was selected.
        auto_selected: bool,
    },
    StatusChanged {
        id: String,
        status: ClientStatus,
    },
    Removed {
        id: String,
    },
}

pub struct ClientRegistry {
    /// Insertion order is display order.
    clients: Vec<RemoteClient>,
    selected: Option<String>,
    /// Ids whose history has been loaded from the store.
    history_loaded: HashSet<String>,
    store: Arc<dyn Store>,
}

impl ClientRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            clients: Vec::new(),
            selected: None,
            history_loaded: HashSet::new(),
            store,
        }
    }

    /// Bring in clients remembered by the store. They all start
    /// `disconnected`; entries already in memory win.
    pub fn load_from_store(&mut self) -> usize {
        let stored = match self.store.get_clients() {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to load clients from store: {e}");
                return 0;
            }
        };
        let mut loaded = 0;
        for mut client in stored {
            if self.get(&client.id).is_some() {
                continue;
            }
            client.status = ClientStatus::Disconnected;
            self.clients.push(client);
            loaded += 1;
        }
        self.clients
            .sort_by(|a, b| b.last_active.cmp(&a.last_active));
        info!(loaded, "Loaded clients from store");
        loaded
    }

    pub fn get(&self, id: &str) -> Option<&RemoteClient> {
        self.clients.iter().find(|c| c.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut RemoteClient> {
        self.clients.iter_mut().find(|c| c.id == id)
    }

    pub fn list_all(&self) -> Vec<RemoteClient> {
        self.clients.clone()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Insert or replace by id.
    pub fn upsert(&mut self, client: RemoteClient) {
        self.persist(&client);
        match self.get_mut(&client.id) {
            Some(existing) => *existing = client,
            None => self.clients.push(client),
        }
    }

    /// Returns `false` for unknown ids.
    pub fn update_status(&mut self, id: &str, status: ClientStatus) -> bool {
        let Some(client) = self.get_mut(id) else {
            return false;
        };
        if client.status != status {
            debug!(id, from = client.status.as_str(), to = status.as_str(), "Client status");
        }
        client.status = status;
        client.last_active = Utc::now();
        let snapshot = client.clone();
        self.persist(&snapshot);
        true
    }

    pub fn rename(&mut self, id: &str, name: &str) -> bool {
        let Some(client) = self.get_mut(id) else {
            return false;
        };
        client.name = name.to_string();
        let snapshot = client.clone();
        self.persist(&snapshot);
        true
    }

    /// Drop a client, its selection and its loaded-history flag.
    pub fn remove(&mut self, id: &str) -> Option<RemoteClient> {
        let idx = self.clients.iter().position(|c| c.id == id)?;
        let removed = self.clients.remove(idx);
        if self.selected.as_deref() == Some(id) {
            self.selected = None;
        }
        self.history_loaded.remove(id);
        if let Err(e) = self.store.delete_client(id) {
            warn!(id, "Failed to delete client from store: {e}");
        }
        Some(removed)
    }

    /// Select a client (or clear the selection). Returns `false` and leaves
    /// the selection alone when the id is unknown.
    pub fn select(&mut self, id: Option<&str>) -> bool {
        match id {
            None => {
                self.selected = None;
                true
            }
            Some(id) if self.get(id).is_some() => {
                self.selected = Some(id.to_string());
                true
            }
            Some(_) => false,
        }
    }

    pub fn selected_id(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn selected(&self) -> Option<&RemoteClient> {
        self.selected.as_deref().and_then(|id| self.get(id))
    }

    /// Whether history for `id` still has to be loaded from the store.
    pub fn needs_history(&self, id: &str) -> bool {
        !self.history_loaded.contains(id)
    }

    pub fn mark_history_loaded(&mut self, id: &str) {
        self.history_loaded.insert(id.to_string());
    }

    /// Used after a failed load so the next selection retries.
    pub fn forget_history(&mut self, id: &str) {
        self.history_loaded.remove(id);
    }

    /// Local connection lost: every peer is unreachable from here.
    pub fn mark_all_disconnected(&mut self) -> usize {
        let mut changed = Vec::new();
        for client in &mut self.clients {
            if client.status != ClientStatus::Disconnected {
                client.status = ClientStatus::Disconnected;
                changed.push(client.clone());
            }
        }
        for client in &changed {
            self.persist(client);
        }
        changed.len()
    }

    /// Apply a STATUS envelope.
    pub fn apply_status(&mut self, status: &StatusPayload) -> Option<RegistryChange> {
        let target = status
            .peer_id()
            .map(ToString::to_string)
            .or_else(|| self.selected.clone());

        match status.status {
            PeerStatus::Paired => {
                let id = status.peer_id()?.to_string();
                Some(self.pair(&id, status))
            }
            PeerStatus::PeerReconnected => {
                let id = target?;
                self.get(&id)?;
                Some(self.pair(&id, status))
            }
            PeerStatus::PeerDisconnected => {
                let id = target?;
                if !self.update_status(&id, ClientStatus::Disconnected) {
                    debug!(id, "peer_disconnected for unknown client");
                    return None;
                }
                info!(id, "Peer disconnected");
                Some(RegistryChange::StatusChanged {
                    id,
                    status: ClientStatus::Disconnected,
                })
            }
            PeerStatus::Unpaired => {
                let id = target?;
                self.remove(&id)?;
                info!(id, "Peer unpaired");
                Some(RegistryChange::Removed { id })
            }
            PeerStatus::Other => None,
        }
    }

    fn pair(&mut self, id: &str, status: &StatusPayload) -> RegistryChange {
        let created = self.get(id).is_none();
        let mut client = self
            .get(id)
            .cloned()
            .unwrap_or_else(|| RemoteClient::new(id));
        if created {
            if let Some(browser) = &status.browser {
                client.name = format!("{browser} {}", short_id(id));
            }
        }
        client.absorb(status);
        client.status = ClientStatus::Paired;
        client.last_active = Utc::now();
        self.upsert(client.clone());

        let auto_selected = self.selected.is_none();
        if auto_selected {
            self.selected = Some(id.to_string());
        }
        info!(id, created, auto_selected, "Peer paired");
        RegistryChange::Paired {
            client,
            created,
            auto_selected,
        }
    }

    fn persist(&self, client: &RemoteClient) {
        if let Err(e) = self.store.upsert_client(client) {
            warn!(id = %client.id, "Failed to save client: {e}");
        }
    }
}

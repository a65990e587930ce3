//! Durable store collaborator.
//!
//! The console keeps its live state in memory and mirrors every change here:
//! known browser clients, per-client chat history and message templates.
//! Calls only touch memory; callers log failures and carry on, so a broken
//! disk never blocks what the user sees.
//!
//! Two implementations:
//!
//! - [`MemoryStore`] — nothing survives the process (tests, `persist = false`).
//! - [`JsonFileStore`] — whole state as one JSON document. Mutations mark the
//!   state dirty; a background writer task coalesces queued marks into one
//!   temp-file-then-rename write, so readers never see a torn file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{ErrorInfo, StoreError};
use crate::execution::{ChatMessage, ExecutionStatus};
use crate::registry::RemoteClient;

/// Default page size for history reads.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Window into a client's history.
///
/// Messages are ranked newest first, `offset` and `limit` applied, and the
/// page is returned oldest first. `before` keeps only messages strictly older
/// than the given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQuery {
    pub limit: usize,
    pub offset: usize,
    pub before: Option<DateTime<Utc>>,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
            before: None,
        }
    }
}

impl MessageQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn before(limit: usize, before: DateTime<Utc>) -> Self {
        Self {
            limit,
            offset: 0,
            before: Some(before),
        }
    }
}

/// Reusable message text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_category() -> String {
    "general".to_string()
}

impl Template {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            content: content.into(),
            description: None,
            category: default_category(),
            usage_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Storage contract used by the registry, the execution tracker and the console.
pub trait Store: Send + Sync {
    fn get_clients(&self) -> Result<Vec<RemoteClient>, StoreError>;
    fn upsert_client(&self, client: &RemoteClient) -> Result<(), StoreError>;
    /// Removes the client and its history.
    fn delete_client(&self, id: &str) -> Result<(), StoreError>;

    fn get_messages(
        &self,
        client_id: &str,
        query: &MessageQuery,
    ) -> Result<Vec<ChatMessage>, StoreError>;
    fn insert_message(&self, client_id: &str, message: &ChatMessage) -> Result<(), StoreError>;
    fn update_message_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        data: Option<&Value>,
        error: Option<&ErrorInfo>,
    ) -> Result<(), StoreError>;
    fn delete_messages(&self, client_id: &str) -> Result<(), StoreError>;

    fn get_templates(&self) -> Result<Vec<Template>, StoreError>;
    fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError>;
    fn upsert_template(&self, template: &Template) -> Result<(), StoreError>;
    fn delete_template(&self, id: &str) -> Result<(), StoreError>;
    fn increment_template_usage(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    client_id: String,
    #[serde(flatten)]
    message: ChatMessage,
}

/// Plain data behind both implementations.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    clients: BTreeMap<String, RemoteClient>,
    /// Insertion order; ties on timestamp keep it.
    #[serde(default)]
    messages: Vec<StoredMessage>,
    #[serde(default)]
    templates: BTreeMap<String, Template>,
}

impl StoreData {
    fn get_messages(&self, client_id: &str, query: &MessageQuery) -> Vec<ChatMessage> {
        let mut matching: Vec<(usize, &ChatMessage)> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.client_id == client_id)
            .filter(|(_, m)| query.before.map_or(true, |b| m.message.timestamp < b))
            .map(|(i, m)| (i, &m.message))
            .collect();
        // Newest first; among equal timestamps the later insert is newer.
        matching.sort_by(|(ia, a), (ib, b)| b.timestamp.cmp(&a.timestamp).then(ib.cmp(ia)));
        let mut page: Vec<ChatMessage> = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|(_, m)| m.clone())
            .collect();
        page.reverse();
        page
    }

    fn update_message_status(
        &mut self,
        id: &str,
        status: ExecutionStatus,
        data: Option<&Value>,
        error: Option<&ErrorInfo>,
    ) -> Result<(), StoreError> {
        let stored = self
            .messages
            .iter_mut()
            .find(|m| m.message.id == id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "message",
                id: id.to_string(),
            })?;
        stored.message.status = Some(status);
        if let Some(d) = data {
            stored.message.data = Some(d.clone());
        }
        if let Some(e) = error {
            stored.message.error = Some(e.clone());
        }
        Ok(())
    }

    fn increment_template_usage(&mut self, id: &str) -> Result<(), StoreError> {
        let t = self
            .templates
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "template",
                id: id.to_string(),
            })?;
        t.usage_count += 1;
        t.updated_at = Utc::now();
        Ok(())
    }

    fn templates_sorted(&self) -> Vec<Template> {
        let mut out: Vec<Template> = self.templates.values().cloned().collect();
        out.sort_by(|a, b| {
            b.usage_count
                .cmp(&a.usage_count)
                .then_with(|| a.name.cmp(&b.name))
        });
        out
    }
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get_clients(&self) -> Result<Vec<RemoteClient>, StoreError> {
        Ok(self.data.lock().clients.values().cloned().collect())
    }

    fn upsert_client(&self, client: &RemoteClient) -> Result<(), StoreError> {
        self.data
            .lock()
            .clients
            .insert(client.id.clone(), client.clone());
        Ok(())
    }

    fn delete_client(&self, id: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        data.clients.remove(id);
        data.messages.retain(|m| m.client_id != id);
        Ok(())
    }

    fn get_messages(
        &self,
        client_id: &str,
        query: &MessageQuery,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self.data.lock().get_messages(client_id, query))
    }

    fn insert_message(&self, client_id: &str, message: &ChatMessage) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        data.messages.retain(|m| m.message.id != message.id);
        data.messages.push(StoredMessage {
            client_id: client_id.to_string(),
            message: message.clone(),
        });
        Ok(())
    }

    fn update_message_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        data: Option<&Value>,
        error: Option<&ErrorInfo>,
    ) -> Result<(), StoreError> {
        self.data
            .lock()
            .update_message_status(id, status, data, error)
    }

    fn delete_messages(&self, client_id: &str) -> Result<(), StoreError> {
        self.data
            .lock()
            .messages
            .retain(|m| m.client_id != client_id);
        Ok(())
    }

    fn get_templates(&self) -> Result<Vec<Template>, StoreError> {
        Ok(self.data.lock().templates_sorted())
    }

    fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError> {
        Ok(self.data.lock().templates.get(id).cloned())
    }

    fn upsert_template(&self, template: &Template) -> Result<(), StoreError> {
        self.data
            .lock()
            .templates
            .insert(template.id.clone(), template.clone());
        Ok(())
    }

    fn delete_template(&self, id: &str) -> Result<(), StoreError> {
        self.data.lock().templates.remove(id);
        Ok(())
    }

    fn increment_template_usage(&self, id: &str) -> Result<(), StoreError> {
        self.data.lock().increment_template_usage(id)
    }
}

impl MemoryStore {
    fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(&*self.data.lock())
    }
}

enum WriterMsg {
    Dirty,
    Flush(oneshot::Sender<Result<(), String>>),
}

/// JSON document on disk, backed by a [`MemoryStore`].
///
/// Reads and mutations are served from memory. Every mutation queues a
/// dirty mark for the writer task, which owns the file.
pub struct JsonFileStore {
    path: PathBuf,
    memory: Arc<MemoryStore>,
    tx: mpsc::UnboundedSender<WriterMsg>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    /// Must be called inside a Tokio runtime: spawns the writer task.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data: StoreData = match fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => StoreData::default(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), clients = data.clients.len(), "Opened store");

        let memory = Arc::new(MemoryStore {
            data: Mutex::new(data),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(store_writer_task(path.clone(), Arc::clone(&memory), rx));
        Ok(Self { path, memory, tx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every mutation made before this call is on disk.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterMsg::Flush(done_tx))
            .map_err(|_| StoreError::WriterStopped)?;
        match done_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(StoreError::Write(reason)),
            Err(_) => Err(StoreError::WriterStopped),
        }
    }

    fn mark_dirty(&self) -> Result<(), StoreError> {
        self.tx
            .send(WriterMsg::Dirty)
            .map_err(|_| StoreError::WriterStopped)
    }
}

/// Background task that owns the store file. Each wakeup drains everything
/// queued, then writes one snapshot taken after the drain.
async fn store_writer_task(
    path: PathBuf,
    memory: Arc<MemoryStore>,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
) {
    while let Some(msg) = rx.recv().await {
        let mut waiters = Vec::new();
        if let WriterMsg::Flush(done) = msg {
            waiters.push(done);
        }
        // Batch: one write covers every mark queued so far
        while let Ok(msg) = rx.try_recv() {
            if let WriterMsg::Flush(done) = msg {
                waiters.push(done);
            }
        }

        let result = write_snapshot(&path, &memory).await;
        if let Err(e) = &result {
            error!(path = %path.display(), "Store write error: {e}");
        }
        let outcome = result.map_err(|e| e.to_string());
        for done in waiters {
            let _ = done.send(outcome.clone());
        }
    }
    debug!(path = %path.display(), "Store writer stopped");
}

/// Atomic write: temp file in the same directory, then rename.
async fn write_snapshot(path: &Path, memory: &MemoryStore) -> Result<(), StoreError> {
    let bytes = memory.to_json()?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).await?;
    let file_name = path
        .file_name()
        .map_or_else(|| "store".to_string(), |n| n.to_string_lossy().into_owned());
    let temp = parent.join(format!(".{file_name}.tmp_{}", std::process::id()));

    let written = async {
        let mut file = fs::File::create(&temp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = written {
        let _ = fs::remove_file(&temp).await;
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

impl Store for JsonFileStore {
    fn get_clients(&self) -> Result<Vec<RemoteClient>, StoreError> {
        self.memory.get_clients()
    }

    fn upsert_client(&self, client: &RemoteClient) -> Result<(), StoreError> {
        self.memory.upsert_client(client)?;
        self.mark_dirty()
    }

    fn delete_client(&self, id: &str) -> Result<(), StoreError> {
        self.memory.delete_client(id)?;
        self.mark_dirty()
    }

    fn get_messages(
        &self,
        client_id: &str,
        query: &MessageQuery,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.memory.get_messages(client_id, query)
    }

    fn insert_message(&self, client_id: &str, message: &ChatMessage) -> Result<(), StoreError> {
        self.memory.insert_message(client_id, message)?;
        self.mark_dirty()
    }

    fn update_message_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        data: Option<&Value>,
        error: Option<&ErrorInfo>,
    ) -> Result<(), StoreError> {
        self.memory.update_message_status(id, status, data, error)?;
        self.mark_dirty()
    }

    fn delete_messages(&self, client_id: &str) -> Result<(), StoreError> {
        self.memory.delete_messages(client_id)?;
        self.mark_dirty()
    }

    fn get_templates(&self) -> Result<Vec<Template>, StoreError> {
        self.memory.get_templates()
    }

    fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError> {
        self.memory.get_template(id)
    }

    fn upsert_template(&self, template: &Template) -> Result<(), StoreError> {
        self.memory.upsert_template(template)?;
        self.mark_dirty()
    }

    fn delete_template(&self, id: &str) -> Result<(), StoreError> {
        self.memory.delete_template(id)?;
        self.mark_dirty()
    }

    fn increment_template_usage(&self, id: &str) -> Result<(), StoreError> {
        self.memory.increment_template_usage(id)?;
        self.mark_dirty()
    }
}

use crate::error::CoreError;
use crate::ids::MessageRef;
use crate::pdu::{GenericPdu, MessageType};
use crate::time::Clock;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Folder {
    Inbox,
    Outbox,
    Sent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadState {
    Unstarted,
    Downloading,
    TransientFailure,
    PermanentFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    None,
    Generic,
    SmsProtoTransient,
    MmsProtoTransient,
    TransportFailure,
    GenericPermanent,
    SmsProtoPermanent,
    MmsProtoPermanent,
}

impl ErrorType {
    pub fn code(self) -> u32 {
        match self {
            ErrorType::None => 0,
            ErrorType::Generic => 1,
            ErrorType::SmsProtoTransient => 2,
            ErrorType::MmsProtoTransient => 3,
            ErrorType::TransportFailure => 4,
            ErrorType::GenericPermanent => 10,
            ErrorType::SmsProtoPermanent => 11,
            ErrorType::MmsProtoPermanent => 12,
        }
    }

    pub fn is_transient(self) -> bool {
        let code = self.code();
        code > ErrorType::None.code() && code < ErrorType::GenericPermanent.code()
    }

    pub fn is_permanent(self) -> bool {
        self.code() >= ErrorType::GenericPermanent.code()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: u64,
    pub message: MessageRef,
    pub msg_type: MessageType,
    pub retry_index: u32,
    pub due_time: u64,
    pub error_type: ErrorType,
    pub last_try: u64,
    pub thread_id: Option<u64>,
}

impl PendingOperation {
    /// Whether a scan relaunches this row. Downloads go again only after a
    /// transient failure.
    pub fn awaits_scan(&self) -> bool {
        match self.msg_type {
            MessageType::NotificationInd => self.error_type.is_transient(),
            MessageType::SendReq | MessageType::ReadRecInd => !self.error_type.is_permanent(),
            _ => false,
        }
    }
}

/// Columns written back after a failed attempt. `due_time` is left untouched when `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingUpdate {
    pub retry_index: u32,
    pub due_time: Option<u64>,
    pub error_type: ErrorType,
    pub last_try: u64,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn content_location(&self, uri: &MessageRef) -> Result<String, CoreError>;
    async fn load_pdu(&self, uri: &MessageRef) -> Result<GenericPdu, CoreError>;
    async fn persist_pdu(&self, pdu: GenericPdu, folder: Folder) -> Result<MessageRef, CoreError>;
    async fn retrieve_conf_exists(&self, message_id: &str) -> Result<Option<MessageRef>, CoreError>;
    async fn update_content_location(
        &self,
        uri: &MessageRef,
        location: &str,
    ) -> Result<(), CoreError>;
    async fn update_message_id(&self, uri: &MessageRef, message_id: &str) -> Result<(), CoreError>;
    async fn move_to_folder(&self, uri: &MessageRef, folder: Folder) -> Result<(), CoreError>;
    async fn delete(&self, uri: &MessageRef) -> Result<(), CoreError>;
    async fn mark_download_state(
        &self,
        uri: &MessageRef,
        state: DownloadState,
    ) -> Result<(), CoreError>;
    async fn download_state(&self, uri: &MessageRef) -> Result<Option<DownloadState>, CoreError>;
    async fn thread_id(&self, uri: &MessageRef) -> Result<Option<u64>, CoreError>;
    async fn pending_for(&self, uri: &MessageRef) -> Result<Option<PendingOperation>, CoreError>;
    /// Rows due at or before `before` that are not permanently failed, ordered by due time.
    async fn pending_due(&self, before: u64) -> Result<Vec<PendingOperation>, CoreError>;
    /// Writes `update` only if the row still carries `expected_retry_index`.
    async fn update_pending(
        &self,
        id: u64,
        expected_retry_index: u32,
        update: PendingUpdate,
    ) -> Result<bool, CoreError>;

    /// Earliest row due before `before` that a scan would relaunch.
    async fn earliest_pending(&self, before: u64) -> Result<Option<PendingOperation>, CoreError> {
        Ok(self
            .pending_due(before)
            .await?
            .into_iter()
            .find(PendingOperation::awaits_scan))
    }
}

#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub pdu: GenericPdu,
    pub folder: Folder,
    pub thread_id: Option<u64>,
    pub content_location: Option<String>,
    pub message_id: Option<String>,
    pub download_state: Option<DownloadState>,
}

#[derive(Default)]
struct Tables {
    next_message_id: u64,
    next_pending_id: u64,
    messages: BTreeMap<u64, StoredMessage>,
    pending: BTreeMap<u64, PendingOperation>,
    threads: HashMap<String, u64>,
}

impl Tables {
    fn thread_for(&mut self, address: Option<&str>) -> Option<u64> {
        let address = address?;
        let next = self.threads.len() as u64 + 1;
        Some(*self.threads.entry(address.to_string()).or_insert(next))
    }

    fn drop_pending(&mut self, message: &MessageRef) {
        self.pending.retain(|_, row| row.message != *message);
    }
}

/// Store kept in process memory. Mirrors the provider triggers of a real
/// message database: notifications in the inbox and anything in the
/// outbox get a pending row; deleting or sending a message clears it.
#[derive(Clone)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            clock,
        }
    }

    pub async fn message(&self, uri: &MessageRef) -> Option<StoredMessage> {
        self.tables.lock().await.messages.get(&uri.id()).cloned()
    }

    pub async fn messages_in(&self, folder: Folder) -> Vec<(MessageRef, StoredMessage)> {
        self.tables
            .lock()
            .await
            .messages
            .iter()
            .filter(|(_, msg)| msg.folder == folder)
            .map(|(id, msg)| (MessageRef::new(*id), msg.clone()))
            .collect()
    }

    pub async fn pending_len(&self) -> usize {
        self.tables.lock().await.pending.len()
    }
}

fn thread_address(pdu: &GenericPdu) -> Option<String> {
    match pdu {
        GenericPdu::NotificationInd(ind) => ind.from.clone(),
        GenericPdu::RetrieveConf(conf) => conf.from.clone(),
        GenericPdu::SendReq(req) => (!req.to.is_empty()).then(|| req.to.join(",")),
        GenericPdu::ReadRecInd(rec) => (!rec.to.is_empty()).then(|| rec.to.join(",")),
        _ => None,
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn content_location(&self, uri: &MessageRef) -> Result<String, CoreError> {
        let guard = self.tables.lock().await;
        let msg = guard.messages.get(&uri.id()).ok_or(CoreError::NotFound)?;
        if let Some(location) = msg.content_location.as_ref() {
            return Ok(location.clone());
        }
        match &msg.pdu {
            GenericPdu::NotificationInd(ind) => Ok(ind.content_location.clone()),
            _ => Err(CoreError::NotFound),
        }
    }

    async fn load_pdu(&self, uri: &MessageRef) -> Result<GenericPdu, CoreError> {
        let guard = self.tables.lock().await;
        guard
            .messages
            .get(&uri.id())
            .map(|msg| msg.pdu.clone())
            .ok_or(CoreError::NotFound)
    }

    async fn persist_pdu(&self, pdu: GenericPdu, folder: Folder) -> Result<MessageRef, CoreError> {
        let now = self.clock.now_ms();
        let mut guard = self.tables.lock().await;
        guard.next_message_id += 1;
        let id = guard.next_message_id;
        let thread_id = guard.thread_for(thread_address(&pdu).as_deref());
        let msg_type = pdu.message_type();
        let message_id = match &pdu {
            GenericPdu::RetrieveConf(conf) => conf.message_id.clone(),
            _ => None,
        };
        let tracked = matches!(
            (folder, msg_type),
            (Folder::Inbox, MessageType::NotificationInd) | (Folder::Outbox, _)
        );
        guard.messages.insert(
            id,
            StoredMessage {
                pdu,
                folder,
                thread_id,
                content_location: None,
                message_id,
                download_state: None,
            },
        );
        let uri = MessageRef::new(id);
        if tracked {
            guard.next_pending_id += 1;
            let pending_id = guard.next_pending_id;
            guard.pending.insert(
                pending_id,
                PendingOperation {
                    id: pending_id,
                    message: uri,
                    msg_type,
                    retry_index: 0,
                    due_time: now,
                    error_type: ErrorType::None,
                    last_try: 0,
                    thread_id,
                },
            );
        }
        Ok(uri)
    }

    async fn retrieve_conf_exists(&self, message_id: &str) -> Result<Option<MessageRef>, CoreError> {
        let guard = self.tables.lock().await;
        Ok(guard
            .messages
            .iter()
            .find(|(_, msg)| {
                matches!(msg.pdu, GenericPdu::RetrieveConf(_))
                    && msg.message_id.as_deref() == Some(message_id)
            })
            .map(|(id, _)| MessageRef::new(*id)))
    }

    async fn update_content_location(
        &self,
        uri: &MessageRef,
        location: &str,
    ) -> Result<(), CoreError> {
        let mut guard = self.tables.lock().await;
        let msg = guard.messages.get_mut(&uri.id()).ok_or(CoreError::NotFound)?;
        msg.content_location = Some(location.to_string());
        Ok(())
    }

    async fn update_message_id(&self, uri: &MessageRef, message_id: &str) -> Result<(), CoreError> {
        let mut guard = self.tables.lock().await;
        let msg = guard.messages.get_mut(&uri.id()).ok_or(CoreError::NotFound)?;
        msg.message_id = Some(message_id.to_string());
        Ok(())
    }

    async fn move_to_folder(&self, uri: &MessageRef, folder: Folder) -> Result<(), CoreError> {
        let mut guard = self.tables.lock().await;
        let msg = guard.messages.get_mut(&uri.id()).ok_or(CoreError::NotFound)?;
        msg.folder = folder;
        if folder == Folder::Sent {
            guard.drop_pending(uri);
        }
        Ok(())
    }

    async fn delete(&self, uri: &MessageRef) -> Result<(), CoreError> {
        let mut guard = self.tables.lock().await;
        guard.messages.remove(&uri.id()).ok_or(CoreError::NotFound)?;
        guard.drop_pending(uri);
        Ok(())
    }

    async fn mark_download_state(
        &self,
        uri: &MessageRef,
        state: DownloadState,
    ) -> Result<(), CoreError> {
        let mut guard = self.tables.lock().await;
        let msg = guard.messages.get_mut(&uri.id()).ok_or(CoreError::NotFound)?;
        msg.download_state = Some(state);
        Ok(())
    }

    async fn download_state(&self, uri: &MessageRef) -> Result<Option<DownloadState>, CoreError> {
        let guard = self.tables.lock().await;
        Ok(guard
            .messages
            .get(&uri.id())
            .and_then(|msg| msg.download_state))
    }

    async fn thread_id(&self, uri: &MessageRef) -> Result<Option<u64>, CoreError> {
        let guard = self.tables.lock().await;
        Ok(guard.messages.get(&uri.id()).and_then(|msg| msg.thread_id))
    }

    async fn pending_for(&self, uri: &MessageRef) -> Result<Option<PendingOperation>, CoreError> {
        let guard = self.tables.lock().await;
        Ok(guard
            .pending
            .values()
            .find(|row| row.message == *uri)
            .cloned())
    }

    async fn pending_due(&self, before: u64) -> Result<Vec<PendingOperation>, CoreError> {
        let guard = self.tables.lock().await;
        let mut rows: Vec<PendingOperation> = guard
            .pending
            .values()
            .filter(|row| row.due_time <= before && !row.error_type.is_permanent())
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.due_time, row.id));
        Ok(rows)
    }

    async fn update_pending(
        &self,
        id: u64,
        expected_retry_index: u32,
        update: PendingUpdate,
    ) -> Result<bool, CoreError> {
        let mut guard = self.tables.lock().await;
        let Some(row) = guard.pending.get_mut(&id) else {
            return Ok(false);
        };
        if row.retry_index != expected_retry_index {
            return Ok(false);
        }
        row.retry_index = update.retry_index;
        if let Some(due) = update.due_time {
            row.due_time = due;
        }
        row.error_type = update.error_type;
        row.last_try = update.last_try;
        Ok(true)
    }
}

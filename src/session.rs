//! Per-connection collaboration sessions
//!
//! A [`Session`] owns one websocket connection. The websocket reader feeds it
//! one frame at a time and waits for each to finish, so events from a single
//! connection are handled strictly in order while other connections proceed
//! concurrently. Shared state lives in the [`Hub`].

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, SessionError};
use crate::guard::{fingerprint, DedupGuard};
use crate::models::{
    Message, MessageMetadata, MessageType, NewMessage, Sender, Workspace, WorkspaceFile,
};
use crate::moderation::{Moderator, RuleModerator, Verdict};
use crate::policy::{AccessPolicy, OwnerPolicy};
use crate::protocol::{
    self, ClientEvent, CodeFlagged, CodeSnippetCreated, CodeUpdate, ErrorEvent, FileOpened,
    FileSaved, FileUpdated, FlaggedMessage, MessageFailed, RoomJoined, ServerEvent, UserTyping,
    WorkspaceFlagged,
};
use crate::room::{ConnectionId, Identity, Outbox, RoomRegistry, Scope};
use crate::snippet::{SnippetSession, SnippetTable};
use crate::store::Transcript;

type SessionResult<T> = std::result::Result<T, SessionError>;

/// State shared by every connection
pub struct Hub {
    pub registry: RoomRegistry,
    pub snippets: SnippetTable,
    transcript: Arc<dyn Transcript>,
    moderator: Arc<dyn Moderator>,
    policy: Arc<dyn AccessPolicy>,
    message_guard: DedupGuard,
    code_guard: DedupGuard,
    persist_timeout: Duration,
    moderate_workspace: bool,
    workspace_ttl: chrono::Duration,
    max_workspace_bytes: u64,
    trust_client_role: bool,
}

impl Hub {
    pub fn new(config: &Config, transcript: Arc<dyn Transcript>) -> Self {
        Self {
            registry: RoomRegistry::new(),
            snippets: SnippetTable::new(),
            transcript,
            moderator: Arc::new(RuleModerator::new(&config.forbidden_words)),
            policy: Arc::new(OwnerPolicy),
            message_guard: DedupGuard::new(
                "message",
                config.message_dedup_window(),
                config.guard_horizon(),
            ),
            code_guard: DedupGuard::new(
                "code_sync",
                config.code_sync_window(),
                config.guard_horizon(),
            ),
            persist_timeout: config.persist_timeout(),
            moderate_workspace: config.moderate_workspace,
            workspace_ttl: config.workspace_ttl(),
            max_workspace_bytes: config.max_workspace_bytes,
            trust_client_role: config.trust_client_role,
        }
    }

    pub fn with_moderator(mut self, moderator: Arc<dyn Moderator>) -> Self {
        self.moderator = moderator;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Whether a role claimed on the upgrade URL is taken at face value
    pub fn trusts_client_role(&self) -> bool {
        self.trust_client_role
    }

    /// Run a store call, failing with `AppError::Timeout` once the
    /// persistence budget is spent.
    async fn bounded<T, F>(&self, what: &str, call: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        match tokio::time::timeout(self.persist_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "{} took longer than {:?}",
                what, self.persist_timeout
            ))),
        }
    }
}

/// One connected client
pub struct Session {
    id: ConnectionId,
    identity: Identity,
    hub: Arc<Hub>,
}

impl Session {
    /// Register the connection's outbox with the hub
    pub async fn connect(hub: Arc<Hub>, identity: Identity, outbox: Outbox) -> Self {
        let id = hub.registry.connect(identity.clone(), outbox).await;
        tracing::info!(connection_id = %id, user_id = %identity.id, "Connection opened");
        Self { id, identity, hub }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Handle one text frame. Rejections go back to this connection as an
    /// `error` event; the connection stays open.
    pub async fn handle_text(&self, text: &str) {
        let result = match ClientEvent::parse(text) {
            Ok(event) => {
                let name = event.name();
                self.handle(event).await.map_err(|e| (name, e))
            }
            Err(e) => Err(("unknown", e)),
        };

        if let Err((event, err)) = result {
            match &err {
                SessionError::App(inner) => {
                    tracing::error!(connection_id = %self.id, event, "Event failed: {}", inner)
                }
                other => {
                    tracing::debug!(connection_id = %self.id, event, "Event rejected: {}", other)
                }
            }
            self.reply(ServerEvent::Error(ErrorEvent::from(&err))).await;
        }
    }

    pub async fn handle(&self, event: ClientEvent) -> SessionResult<()> {
        match event {
            ClientEvent::JoinRoom(room_id) => self.join(&room_id).await,
            ClientEvent::LeaveRoom(room_id) => self.leave(&room_id).await,
            ClientEvent::SendMessage(p) => self.send_message(p).await,
            ClientEvent::Typing(p) => self.typing(p).await,
            ClientEvent::DeleteMessage(p) => self.delete_message(p).await,
            ClientEvent::CodeSnippetCreate(p) => self.create_snippet(p).await,
            ClientEvent::CodeSync(p) => self.sync_code(p).await,
            ClientEvent::CodeSnippetSave(p) => self.save_snippet(p).await,
            ClientEvent::WorkspaceUpload(p) => self.upload_workspace(p).await,
            ClientEvent::FileOpen(p) => self.open_file(p).await,
            ClientEvent::FileEdit(p) => self.edit_file(p).await,
            ClientEvent::FileSave(p) => self.save_file(p).await,
        }
    }

    /// Drop the connection from every room. Peers are not notified.
    pub async fn disconnect(&self) {
        let rooms = self.hub.registry.disconnect(self.id).await;
        for room_id in &rooms {
            self.release_room(room_id).await;
        }
        tracing::info!(connection_id = %self.id, ?rooms, "Connection closed");
    }

    /// Unsaved snippets die with their room once nobody is left in it
    async fn release_room(&self, room_id: &str) {
        if self.hub.registry.has_room(room_id).await {
            return;
        }
        let dropped = self.hub.snippets.remove_room(room_id).await;
        if dropped > 0 {
            tracing::debug!(room_id, dropped, "Dropped unsaved snippets of empty room");
        }
    }

    async fn join(&self, room_id: &str) -> SessionResult<()> {
        let participants = self
            .hub
            .registry
            .join(room_id, self.id)
            .await
            .ok_or_else(|| AppError::Internal(format!("Connection {} is not registered", self.id)))?;

        tracing::info!(connection_id = %self.id, room_id, "Joined room");
        self.reply(ServerEvent::RoomJoined(RoomJoined {
            issue_id: room_id.to_string(),
            participants,
        }))
        .await;
        Ok(())
    }

    async fn leave(&self, room_id: &str) -> SessionResult<()> {
        if self.hub.registry.leave(room_id, self.id).await {
            tracing::info!(connection_id = %self.id, room_id, "Left room");
            self.release_room(room_id).await;
        }
        Ok(())
    }

    async fn send_message(&self, p: protocol::SendMessage) -> SessionResult<()> {
        self.require_member(&p.issue_id).await?;
        self.require_self(&p.sender_id)?;

        let key = fingerprint(
            [p.sender_id.as_str(), p.issue_id.as_str(), p.content.as_str()]
                .into_iter()
                .chain(p.attachments.iter().map(String::as_str)),
        );
        if self.hub.message_guard.should_suppress(&key) {
            tracing::debug!(connection_id = %self.id, room_id = %p.issue_id, "Dropped duplicate message");
            return Ok(());
        }

        let verdict = self.hub.moderator.scan(&p.content);
        let message = NewMessage {
            issue_id: p.issue_id.clone(),
            sender: self.sender(p.sender_avatar),
            content: p.content,
            message_type: p.message_type,
            attachments: p.attachments,
            metadata: None,
            flagged: verdict.flagged,
            flag_reason: verdict.reason.clone(),
        };

        let Some(message) = self.persist(message, None).await else {
            // Let the retry that message_failed invites through
            self.hub.message_guard.forget(&key);
            return Ok(());
        };
        self.deliver(message, verdict).await;
        Ok(())
    }

    async fn typing(&self, p: protocol::Typing) -> SessionResult<()> {
        self.require_member(&p.issue_id).await?;
        self.require_self(&p.user_id)?;

        self.hub
            .registry
            .broadcast(
                &p.issue_id,
                &ServerEvent::UserTyping(UserTyping { user_id: p.user_id }),
                Scope::RoomExcept(self.id),
            )
            .await;
        Ok(())
    }

    async fn delete_message(&self, p: protocol::DeleteMessage) -> SessionResult<()> {
        self.require_member(&p.issue_id).await?;

        let transcript = &self.hub.transcript;
        let message = self
            .hub
            .bounded("loading message", transcript.get_message(p.message_id))
            .await?;
        if message.issue_id != p.issue_id {
            return Err(SessionError::NotFound(format!(
                "Message {} in room {}",
                p.message_id, p.issue_id
            )));
        }
        if !self.hub.policy.can_delete_message(&self.identity, &message) {
            return Err(SessionError::Forbidden(format!(
                "{} may not delete message {}",
                self.identity.id, message.id
            )));
        }

        self.hub
            .bounded("deleting message", transcript.delete_message(message.id))
            .await?;

        tracing::info!(connection_id = %self.id, message_id = %message.id, "Deleted message");
        self.hub
            .registry
            .broadcast(
                &p.issue_id,
                &ServerEvent::MessageDeleted(message.id),
                Scope::Room,
            )
            .await;
        Ok(())
    }

    async fn create_snippet(&self, p: protocol::CodeSnippetCreate) -> SessionResult<()> {
        self.require_member(&p.issue_id).await?;
        self.require_self(&p.created_by)?;

        let mut snippet = SnippetSession::new(&p.issue_id, &p.language, &p.initial_code, &p.created_by);
        if let Some(id) = p.snippet_id {
            snippet = snippet.with_id(id);
        }

        let verdict = self.hub.moderator.scan(&snippet.code);
        if verdict.flagged {
            self.flag_code(snippet.id, verdict).await;
            return Ok(());
        }

        let event = ServerEvent::CodeSnippetCreated(CodeSnippetCreated {
            snippet_id: snippet.id,
            language: snippet.language.clone(),
            code: snippet.code.clone(),
            created_by: snippet.created_by.clone(),
        });
        let snippet_id = snippet.id;
        if !self.hub.snippets.insert(snippet).await {
            return Err(SessionError::InvalidPayload(format!(
                "snippet {} already exists",
                snippet_id
            )));
        }

        tracing::debug!(connection_id = %self.id, %snippet_id, "Created snippet");
        self.hub
            .registry
            .broadcast(&p.issue_id, &event, Scope::RoomExcept(self.id))
            .await;
        Ok(())
    }

    async fn sync_code(&self, p: protocol::CodeSync) -> SessionResult<()> {
        self.require_member(&p.issue_id).await?;

        let snippet = self
            .hub
            .snippets
            .get(p.snippet_id)
            .await
            .filter(|s| s.issue_id == p.issue_id)
            .ok_or_else(|| SessionError::NotFound(format!("Snippet {}", p.snippet_id)))?;
        if !self.hub.policy.can_edit_snippet(&self.identity, &snippet) {
            return Err(SessionError::Forbidden(format!(
                "{} may not edit snippet {}",
                self.identity.id, snippet.id
            )));
        }

        // Flagged edits must not take the throttle slot
        let verdict = self.hub.moderator.scan(&p.new_code);
        if verdict.flagged {
            self.flag_code(p.snippet_id, verdict).await;
            return Ok(());
        }

        let key = format!("{}:{}", self.id, p.snippet_id);
        if self.hub.code_guard.should_suppress(&key) {
            tracing::trace!(connection_id = %self.id, snippet_id = %p.snippet_id, "Throttled code sync");
            return Ok(());
        }

        if !self
            .hub
            .snippets
            .apply_edit(p.snippet_id, &p.new_code, &p.language)
            .await
        {
            return Err(SessionError::NotFound(format!("Snippet {}", p.snippet_id)));
        }

        self.hub
            .registry
            .broadcast(
                &p.issue_id,
                &ServerEvent::CodeUpdate(CodeUpdate {
                    snippet_id: p.snippet_id,
                    code: p.new_code,
                    language: p.language,
                }),
                Scope::RoomExcept(self.id),
            )
            .await;
        Ok(())
    }

    async fn save_snippet(&self, p: protocol::CodeSnippetSave) -> SessionResult<()> {
        self.require_member(&p.issue_id).await?;
        self.require_self(&p.sender_id)?;

        // Saving a snippet this hub never saw is allowed; a live one is
        // checked like an edit.
        if let Some(snippet) = self.hub.snippets.get(p.snippet_id).await {
            if snippet.issue_id != p.issue_id {
                return Err(SessionError::NotFound(format!("Snippet {}", p.snippet_id)));
            }
            if !self.hub.policy.can_edit_snippet(&self.identity, &snippet) {
                return Err(SessionError::Forbidden(format!(
                    "{} may not save snippet {}",
                    self.identity.id, snippet.id
                )));
            }
        }

        let snippet_key = format!("snippet:{}", p.snippet_id);
        let key = fingerprint([
            p.sender_id.as_str(),
            p.final_code.as_str(),
            snippet_key.as_str(),
        ]);
        if self.hub.message_guard.should_suppress(&key) {
            tracing::debug!(connection_id = %self.id, snippet_id = %p.snippet_id, "Dropped duplicate save");
            return Ok(());
        }

        let verdict = self.hub.moderator.scan(&p.final_code);
        let message = NewMessage {
            issue_id: p.issue_id.clone(),
            sender: self.sender(p.sender_avatar),
            content: p.final_code,
            message_type: MessageType::Code,
            attachments: Vec::new(),
            metadata: Some(MessageMetadata {
                language: p.language,
                snippet_id: p.snippet_id,
            }),
            flagged: verdict.flagged,
            flag_reason: verdict.reason.clone(),
        };

        let Some(message) = self.persist(message, Some(p.snippet_id)).await else {
            self.hub.message_guard.forget(&key);
            return Ok(());
        };
        if !verdict.flagged {
            self.hub.snippets.finish(p.snippet_id).await;
        }
        self.deliver(message, verdict).await;
        Ok(())
    }

    async fn upload_workspace(&self, p: protocol::WorkspaceUpload) -> SessionResult<()> {
        self.require_member(&p.issue_id).await?;

        let files: Vec<WorkspaceFile> = p
            .files
            .into_iter()
            .map(|f| WorkspaceFile::new(f.path, f.content))
            .collect();
        let size: u64 = files.iter().map(|f| f.size).sum();
        if size > self.hub.max_workspace_bytes {
            return Err(SessionError::WorkspaceTooLarge {
                size,
                limit: self.hub.max_workspace_bytes,
            });
        }

        let workspace_id = p.workspace_id.unwrap_or_else(Uuid::new_v4);
        for file in &files {
            if self.block_workspace_content(workspace_id, &file.path, &file.content).await {
                return Ok(());
            }
        }

        let workspace = Workspace::new(
            workspace_id,
            &p.issue_id,
            p.name,
            &self.identity.id,
            files,
            self.hub.workspace_ttl,
        );
        self.hub
            .bounded("saving workspace", self.hub.transcript.save_workspace(&workspace))
            .await?;

        tracing::info!(
            connection_id = %self.id,
            %workspace_id,
            files = workspace.summary.total_files,
            bytes = workspace.summary.total_size,
            "Uploaded workspace"
        );
        self.hub
            .registry
            .broadcast(
                &p.issue_id,
                &ServerEvent::WorkspaceCreated(workspace),
                Scope::RoomExcept(self.id),
            )
            .await;
        Ok(())
    }

    async fn open_file(&self, p: protocol::FileOpen) -> SessionResult<()> {
        self.require_member(&p.issue_id).await?;

        self.hub
            .registry
            .broadcast(
                &p.issue_id,
                &ServerEvent::FileOpened(FileOpened {
                    workspace_id: p.workspace_id,
                    file_path: p.file_path,
                    user_id: self.identity.id.clone(),
                }),
                Scope::RoomExcept(self.id),
            )
            .await;
        Ok(())
    }

    async fn edit_file(&self, p: protocol::FileEdit) -> SessionResult<()> {
        self.require_member(&p.issue_id).await?;
        if self
            .block_workspace_content(p.workspace_id, &p.file_path, &p.content)
            .await
        {
            return Ok(());
        }

        self.hub
            .registry
            .broadcast(
                &p.issue_id,
                &ServerEvent::FileUpdated(FileUpdated {
                    workspace_id: p.workspace_id,
                    file_path: p.file_path,
                    content: p.content,
                    user_id: self.identity.id.clone(),
                }),
                Scope::RoomExcept(self.id),
            )
            .await;
        Ok(())
    }

    async fn save_file(&self, p: protocol::FileSave) -> SessionResult<()> {
        self.require_member(&p.issue_id).await?;
        if self
            .block_workspace_content(p.workspace_id, &p.file_path, &p.content)
            .await
        {
            return Ok(());
        }

        let file = WorkspaceFile::new(p.file_path, p.content);
        if file.size > self.hub.max_workspace_bytes {
            return Err(SessionError::WorkspaceTooLarge {
                size: file.size,
                limit: self.hub.max_workspace_bytes,
            });
        }
        self.hub
            .bounded(
                "saving workspace file",
                self.hub.transcript.save_workspace_file(p.workspace_id, &file),
            )
            .await?;

        self.hub
            .registry
            .broadcast(
                &p.issue_id,
                &ServerEvent::FileSaved(FileSaved {
                    workspace_id: p.workspace_id,
                    file_path: file.path,
                    language: file.language,
                    size: file.size,
                    user_id: self.identity.id.clone(),
                    saved_at: Utc::now(),
                }),
                Scope::Room,
            )
            .await;
        Ok(())
    }

    async fn require_member(&self, room_id: &str) -> SessionResult<()> {
        if !self.hub.registry.is_member(room_id, self.id).await {
            return Err(SessionError::NotInRoom(room_id.to_string()));
        }
        self.hub.registry.touch(room_id, self.id).await;
        Ok(())
    }

    /// Payload user ids must name the connection's own identity
    fn require_self(&self, claimed: &str) -> SessionResult<()> {
        if claimed != self.identity.id {
            return Err(SessionError::Forbidden(format!(
                "cannot act as {}",
                claimed
            )));
        }
        Ok(())
    }

    /// Sender as shown to the room. The connection's identity wins; the
    /// payload only fills in an avatar the identity does not carry.
    fn sender(&self, avatar: Option<String>) -> Sender {
        Sender {
            id: self.identity.id.clone(),
            name: self.identity.display_name.clone(),
            avatar: self.identity.avatar_url.clone().or(avatar),
        }
    }

    /// Persist within the timeout. On failure the sender gets
    /// `message_failed` and `None` is returned.
    async fn persist(&self, message: NewMessage, snippet_id: Option<Uuid>) -> Option<Message> {
        let issue_id = message.issue_id.clone();
        let result = self
            .hub
            .bounded("persisting message", self.hub.transcript.persist_message(message))
            .await;

        match result {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::error!(connection_id = %self.id, room_id = %issue_id, "Failed to persist message: {}", e);
                self.reply(ServerEvent::MessageFailed(MessageFailed {
                    issue_id,
                    snippet_id,
                    reason: e.to_string(),
                }))
                .await;
                None
            }
        }
    }

    /// Fan a stored message out: clean to the room, flagged to the sender only
    async fn deliver(&self, message: Message, verdict: Verdict) {
        if verdict.flagged {
            let reason = verdict.reason.unwrap_or_default();
            tracing::info!(
                connection_id = %self.id,
                message_id = %message.id,
                %reason,
                "Message flagged"
            );
            self.reply(ServerEvent::MessageFlagged(FlaggedMessage { message, reason }))
                .await;
        } else {
            let room_id = message.issue_id.clone();
            self.hub
                .registry
                .broadcast(&room_id, &ServerEvent::ReceiveMessage(message), Scope::Room)
                .await;
        }
    }

    async fn flag_code(&self, snippet_id: Uuid, verdict: Verdict) {
        let reason = verdict.reason.unwrap_or_default();
        tracing::info!(connection_id = %self.id, %snippet_id, %reason, "Code flagged");
        self.reply(ServerEvent::CodeFlagged(CodeFlagged { snippet_id, reason }))
            .await;
    }

    /// Scan workspace content when workspace moderation is on. Returns
    /// `true` (after notifying the sender) if the content must not go out.
    async fn block_workspace_content(
        &self,
        workspace_id: Uuid,
        file_path: &str,
        content: &str,
    ) -> bool {
        if !self.hub.moderate_workspace {
            return false;
        }
        let verdict = self.hub.moderator.scan(content);
        if !verdict.flagged {
            return false;
        }
        let reason = verdict.reason.unwrap_or_default();

        tracing::info!(connection_id = %self.id, %workspace_id, file_path, %reason, "Workspace content flagged");
        self.reply(ServerEvent::WorkspaceFlagged(WorkspaceFlagged {
            workspace_id,
            file_path: file_path.to_string(),
            reason,
        }))
        .await;
        true
    }

    async fn reply(&self, event: ServerEvent) {
        if !self.hub.registry.send_to(self.id, event).await {
            tracing::debug!(connection_id = %self.id, "Outbox closed, reply dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::room::Role;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    /// In-memory transcript with optional slow or failing writes
    #[derive(Default)]
    struct MemoryTranscript {
        messages: Mutex<Vec<Message>>,
        workspaces: Mutex<HashMap<Uuid, Workspace>>,
        /// Content -> artificial persistence delay
        delays: Mutex<HashMap<String, Duration>>,
        fail: Mutex<bool>,
    }

    impl MemoryTranscript {
        fn count(&self) -> usize {
            self.messages.lock().len()
        }
    }

    #[async_trait]
    impl Transcript for MemoryTranscript {
        async fn persist_message(&self, message: NewMessage) -> Result<Message> {
            let delay = self.delays.lock().get(&message.content).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if *self.fail.lock() {
                return Err(AppError::Internal("disk full".to_string()));
            }

            let stored = Message {
                id: Uuid::new_v4(),
                issue_id: message.issue_id,
                sender: message.sender,
                content: message.content,
                message_type: message.message_type,
                attachments: message.attachments,
                metadata: message.metadata,
                flagged: message.flagged,
                flag_reason: message.flag_reason,
                created_at: Utc::now(),
            };
            self.messages.lock().push(stored.clone());
            Ok(stored)
        }

        async fn get_message(&self, id: Uuid) -> Result<Message> {
            self.messages
                .lock()
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("Message {} not found", id)))
        }

        async fn delete_message(&self, id: Uuid) -> Result<()> {
            let mut messages = self.messages.lock();
            let before = messages.len();
            messages.retain(|m| m.id != id);
            if messages.len() == before {
                return Err(AppError::NotFound(format!("Message {} not found", id)));
            }
            Ok(())
        }

        async fn messages_for_room(
            &self,
            issue_id: &str,
            include_flagged: bool,
        ) -> Result<Vec<Message>> {
            Ok(self
                .messages
                .lock()
                .iter()
                .filter(|m| m.issue_id == issue_id && (include_flagged || !m.flagged))
                .cloned()
                .collect())
        }

        async fn save_workspace(&self, workspace: &Workspace) -> Result<()> {
            self.workspaces
                .lock()
                .insert(workspace.id, workspace.clone());
            Ok(())
        }

        async fn save_workspace_file(&self, workspace_id: Uuid, file: &WorkspaceFile) -> Result<()> {
            let mut workspaces = self.workspaces.lock();
            let workspace = workspaces
                .get_mut(&workspace_id)
                .ok_or_else(|| AppError::NotFound(format!("Workspace {} not found", workspace_id)))?;
            workspace.files.retain(|f| f.path != file.path);
            workspace.files.push(file.clone());
            Ok(())
        }
    }

    struct Harness {
        hub: Arc<Hub>,
        transcript: Arc<MemoryTranscript>,
    }

    fn harness_with(config: Config) -> Harness {
        let transcript = Arc::new(MemoryTranscript::default());
        let hub = Arc::new(Hub::new(&config, transcript.clone()));
        Harness { hub, transcript }
    }

    fn harness() -> Harness {
        harness_with(Config::default())
    }

    async fn join(
        harness: &Harness,
        identity: Identity,
        room: &str,
    ) -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Session::connect(harness.hub.clone(), identity, tx).await;
        session
            .handle(ClientEvent::JoinRoom(room.to_string()))
            .await
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::RoomJoined(_))));
        (session, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn send(room: &str, sender: &str, content: &str) -> ClientEvent {
        ClientEvent::SendMessage(protocol::SendMessage {
            issue_id: room.to_string(),
            sender_id: sender.to_string(),
            sender_name: None,
            sender_avatar: None,
            content: content.to_string(),
            message_type: MessageType::Text,
            attachments: vec![],
        })
    }

    fn private_key() -> String {
        format!("0x{}", "ab".repeat(32))
    }

    #[tokio::test]
    async fn test_join_acknowledges_with_participants() {
        let h = harness();
        let (_alice, _rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let bob = Session::connect(h.hub.clone(), Identity::new("bob", "Bob"), tx).await;
        bob.handle(ClientEvent::JoinRoom("issue-1".into()))
            .await
            .unwrap();

        match rx.try_recv().unwrap() {
            ServerEvent::RoomJoined(ack) => {
                assert_eq!(ack.issue_id, "issue-1");
                assert_eq!(ack.participants.len(), 2);
            }
            other => panic!("Expected RoomJoined, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clean_message_reaches_whole_room() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;

        alice.handle(send("issue-1", "alice", "hello")).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                ServerEvent::ReceiveMessage(m) => {
                    assert_eq!(m.content, "hello");
                    assert_eq!(m.sender.name, "Alice");
                }
                other => panic!("Expected ReceiveMessage, got {:?}", other),
            }
        }
        assert_eq!(h.transcript.count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_message_suppressed() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;

        alice.handle(send("issue-1", "alice", "hello")).await.unwrap();
        alice.handle(send("issue-1", "alice", "hello")).await.unwrap();

        assert_eq!(h.transcript.count(), 1);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn test_flagged_message_only_reaches_sender() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;

        alice
            .handle(send("issue-1", "alice", &format!("key {}", private_key())))
            .await
            .unwrap();

        match rx_a.try_recv().unwrap() {
            ServerEvent::MessageFlagged(f) => {
                assert!(f.message.flagged);
                assert_eq!(f.reason, "Possible private key detected");
            }
            other => panic!("Expected MessageFlagged, got {:?}", other),
        }
        assert!(rx_b.try_recv().is_err());

        let stored = h.transcript.messages_for_room("issue-1", true).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].flagged);
    }

    #[tokio::test]
    async fn test_send_requires_membership() {
        let h = harness();
        let (alice, _rx) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;

        let err = alice
            .handle(send("issue-2", "alice", "hello"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_in_room");
        assert_eq!(h.transcript.count(), 0);
    }

    #[tokio::test]
    async fn test_send_rejects_spoofed_sender() {
        let h = harness();
        let (alice, _rx) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;

        let err = alice
            .handle(send("issue-1", "bob", "hello"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn test_per_connection_order_survives_slow_persist() {
        let h = harness();
        h.transcript
            .delays
            .lock()
            .insert("A".to_string(), Duration::from_millis(100));
        let (alice, _rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;

        // Mirror the websocket reader: frames handled one after another
        let frames = [
            r#"{"event":"send_message","data":{"issueId":"issue-1","senderId":"alice","content":"A"}}"#,
            r#"{"event":"send_message","data":{"issueId":"issue-1","senderId":"alice","content":"B"}}"#,
        ];
        let reader = tokio::spawn(async move {
            for frame in frames {
                alice.handle_text(frame).await;
            }
        });
        reader.await.unwrap();

        let contents: Vec<String> = drain(&mut rx_b)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::ReceiveMessage(m) => Some(m.content),
                _ => None,
            })
            .collect();
        assert_eq!(contents, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_persist_failure_reports_message_failed() {
        let h = harness();
        *h.transcript.fail.lock() = true;
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;

        alice.handle(send("issue-1", "alice", "hello")).await.unwrap();

        match rx_a.try_recv().unwrap() {
            ServerEvent::MessageFailed(f) => {
                assert_eq!(f.issue_id, "issue-1");
                assert!(f.reason.contains("disk full"));
            }
            other => panic!("Expected MessageFailed, got {:?}", other),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retry_after_persist_failure_is_delivered() {
        let h = harness();
        *h.transcript.fail.lock() = true;
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;

        alice.handle(send("issue-1", "alice", "hello")).await.unwrap();
        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::MessageFailed(_))));

        *h.transcript.fail.lock() = false;
        alice.handle(send("issue-1", "alice", "hello")).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let received = drain(rx)
                .into_iter()
                .filter(|e| matches!(e, ServerEvent::ReceiveMessage(m) if m.content == "hello"))
                .count();
            assert_eq!(received, 1);
        }
        assert_eq!(h.transcript.count(), 1);
    }

    #[tokio::test]
    async fn test_persist_timeout_reports_message_failed() {
        let h = harness_with(Config {
            persist_timeout_ms: 20,
            ..Config::default()
        });
        h.transcript
            .delays
            .lock()
            .insert("slow".to_string(), Duration::from_millis(200));
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;

        alice.handle(send("issue-1", "alice", "slow")).await.unwrap();

        match rx_a.try_recv().unwrap() {
            ServerEvent::MessageFailed(f) => assert!(f.reason.starts_with("Timed out")),
            other => panic!("Expected MessageFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sender_name_comes_from_identity() {
        let h = harness();
        let (alice, mut rx_a) = join(
            &h,
            Identity::new("alice", "Alice").with_avatar("https://a/alice.png"),
            "issue-1",
        )
        .await;
        let (bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;

        let ClientEvent::SendMessage(mut p) = send("issue-1", "alice", "hi") else {
            unreachable!()
        };
        p.sender_name = Some("Admin".into());
        p.sender_avatar = Some("https://evil/a.png".into());
        alice.handle(ClientEvent::SendMessage(p)).await.unwrap();

        match rx_b.try_recv().unwrap() {
            ServerEvent::ReceiveMessage(m) => {
                assert_eq!(m.sender.name, "Alice");
                assert_eq!(m.sender.avatar.as_deref(), Some("https://a/alice.png"));
            }
            other => panic!("Expected ReceiveMessage, got {:?}", other),
        }
        drain(&mut rx_a);

        // No avatar on the identity: the payload's is used
        let ClientEvent::SendMessage(mut p) = send("issue-1", "bob", "yo") else {
            unreachable!()
        };
        p.sender_name = Some("Alice".into());
        p.sender_avatar = Some("https://b/bob.png".into());
        bob.handle(ClientEvent::SendMessage(p)).await.unwrap();

        match rx_a.try_recv().unwrap() {
            ServerEvent::ReceiveMessage(m) => {
                assert_eq!(m.sender.name, "Bob");
                assert_eq!(m.sender.avatar.as_deref(), Some("https://b/bob.png"));
            }
            other => panic!("Expected ReceiveMessage, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_typing_goes_to_others() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;

        alice
            .handle(ClientEvent::Typing(protocol::Typing {
                issue_id: "issue-1".into(),
                user_id: "alice".into(),
            }))
            .await
            .unwrap();

        assert!(rx_a.try_recv().is_err());
        assert!(matches!(rx_b.try_recv(), Ok(ServerEvent::UserTyping(t)) if t.user_id == "alice"));
    }

    #[tokio::test]
    async fn test_delete_own_message() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;

        alice.handle(send("issue-1", "alice", "oops")).await.unwrap();
        let id = match rx_a.try_recv().unwrap() {
            ServerEvent::ReceiveMessage(m) => m.id,
            other => panic!("Expected ReceiveMessage, got {:?}", other),
        };
        drain(&mut rx_b);

        alice
            .handle(ClientEvent::DeleteMessage(protocol::DeleteMessage {
                issue_id: "issue-1".into(),
                message_id: id,
            }))
            .await
            .unwrap();

        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::MessageDeleted(d)) if d == id));
        assert!(matches!(rx_b.try_recv(), Ok(ServerEvent::MessageDeleted(d)) if d == id));
        assert_eq!(h.transcript.count(), 0);
    }

    #[tokio::test]
    async fn test_delete_others_message_needs_capability() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (bob, _rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;
        let (moderator, _rx_m) = join(
            &h,
            Identity::new("mod", "Mod").with_role(Role::Moderator),
            "issue-1",
        )
        .await;

        alice.handle(send("issue-1", "alice", "mine")).await.unwrap();
        let id = match rx_a.try_recv().unwrap() {
            ServerEvent::ReceiveMessage(m) => m.id,
            other => panic!("Expected ReceiveMessage, got {:?}", other),
        };
        let delete = || {
            ClientEvent::DeleteMessage(protocol::DeleteMessage {
                issue_id: "issue-1".into(),
                message_id: id,
            })
        };

        let err = bob.handle(delete()).await.unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert_eq!(h.transcript.count(), 1);

        moderator.handle(delete()).await.unwrap();
        assert_eq!(h.transcript.count(), 0);
    }

    #[tokio::test]
    async fn test_delete_unknown_message() {
        let h = harness();
        let (alice, _rx) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;

        let err = alice
            .handle(ClientEvent::DeleteMessage(protocol::DeleteMessage {
                issue_id: "issue-1".into(),
                message_id: Uuid::new_v4(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    fn create_snippet(id: Uuid, code: &str) -> ClientEvent {
        ClientEvent::CodeSnippetCreate(protocol::CodeSnippetCreate {
            issue_id: "issue-1".into(),
            snippet_id: Some(id),
            language: "javascript".into(),
            initial_code: code.into(),
            created_by: "alice".into(),
        })
    }

    fn sync(id: Uuid, code: &str) -> ClientEvent {
        ClientEvent::CodeSync(protocol::CodeSync {
            snippet_id: id,
            issue_id: "issue-1".into(),
            new_code: code.into(),
            language: "javascript".into(),
        })
    }

    fn save(id: Uuid, sender: &str, code: &str) -> ClientEvent {
        ClientEvent::CodeSnippetSave(protocol::CodeSnippetSave {
            snippet_id: id,
            issue_id: "issue-1".into(),
            final_code: code.into(),
            language: "javascript".into(),
            sender_id: sender.into(),
            sender_name: None,
            sender_avatar: None,
        })
    }

    #[tokio::test]
    async fn test_snippet_lifecycle() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;
        let id = Uuid::new_v4();

        alice.handle(create_snippet(id, "// start")).await.unwrap();
        assert!(rx_a.try_recv().is_err());
        match rx_b.try_recv().unwrap() {
            ServerEvent::CodeSnippetCreated(c) => {
                assert_eq!(c.snippet_id, id);
                assert_eq!(c.code, "// start");
                assert_eq!(c.created_by, "alice");
            }
            other => panic!("Expected CodeSnippetCreated, got {:?}", other),
        }

        alice
            .handle(sync(id, "// start\nconsole.log(1)"))
            .await
            .unwrap();
        assert!(rx_a.try_recv().is_err());
        assert!(
            matches!(rx_b.try_recv(), Ok(ServerEvent::CodeUpdate(u)) if u.code == "// start\nconsole.log(1)")
        );

        alice
            .handle(save(id, "alice", "// start\nconsole.log(1)"))
            .await
            .unwrap();
        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                ServerEvent::ReceiveMessage(m) => {
                    assert_eq!(m.message_type, MessageType::Code);
                    assert_eq!(m.content, "// start\nconsole.log(1)");
                    assert_eq!(m.metadata.as_ref().unwrap().snippet_id, id);
                }
                other => panic!("Expected ReceiveMessage, got {:?}", other),
            }
        }
        assert!(h.hub.snippets.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_code_sync_burst_is_throttled() {
        let h = harness();
        let (alice, _rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;
        let id = Uuid::new_v4();
        alice.handle(create_snippet(id, "")).await.unwrap();
        drain(&mut rx_b);

        for i in 0..10 {
            alice.handle(sync(id, &format!("v{}", i))).await.unwrap();
        }

        let updates = drain(&mut rx_b)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::CodeUpdate(_)))
            .count();
        assert!((1..=2).contains(&updates), "got {} updates", updates);
    }

    #[tokio::test]
    async fn test_flagged_code_sync_stays_with_sender() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;
        let id = Uuid::new_v4();
        alice.handle(create_snippet(id, "")).await.unwrap();
        drain(&mut rx_b);

        alice
            .handle(sync(id, &format!("const k = '{}'", private_key())))
            .await
            .unwrap();

        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::CodeFlagged(f)) if f.snippet_id == id));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(h.hub.snippets.get(id).await.unwrap().code, "");
    }

    #[tokio::test]
    async fn test_corrected_edit_after_flagged_sync_goes_out() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;
        let id = Uuid::new_v4();
        alice.handle(create_snippet(id, "")).await.unwrap();
        drain(&mut rx_b);

        alice
            .handle(sync(id, &format!("const k = '{}'", private_key())))
            .await
            .unwrap();
        alice
            .handle(sync(id, "const k = process.env.KEY"))
            .await
            .unwrap();

        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::CodeFlagged(_))));
        assert!(
            matches!(rx_b.try_recv(), Ok(ServerEvent::CodeUpdate(u)) if u.code == "const k = process.env.KEY")
        );
        assert_eq!(
            h.hub.snippets.get(id).await.unwrap().code,
            "const k = process.env.KEY"
        );
    }

    #[tokio::test]
    async fn test_flagged_snippet_is_not_created() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;
        let id = Uuid::new_v4();

        alice
            .handle(create_snippet(id, "my seed phrase is ..."))
            .await
            .unwrap();

        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::CodeFlagged(_))));
        assert!(rx_b.try_recv().is_err());
        assert!(h.hub.snippets.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_only_creator_edits_snippet() {
        let h = harness();
        let (alice, _rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (bob, _rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;
        let id = Uuid::new_v4();
        alice.handle(create_snippet(id, "")).await.unwrap();

        let err = bob.handle(sync(id, "hijack")).await.unwrap_err();
        assert_eq!(err.code(), "forbidden");

        let err = bob.handle(save(id, "bob", "hijack")).await.unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn test_sync_unknown_snippet() {
        let h = harness();
        let (alice, _rx) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;

        let err = alice.handle(sync(Uuid::new_v4(), "x")).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_failed_snippet_save_keeps_session() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let id = Uuid::new_v4();
        alice.handle(create_snippet(id, "x")).await.unwrap();
        *h.transcript.fail.lock() = true;

        alice.handle(save(id, "alice", "x = 1")).await.unwrap();

        assert!(
            matches!(rx_a.try_recv(), Ok(ServerEvent::MessageFailed(f)) if f.snippet_id == Some(id))
        );
        assert!(h.hub.snippets.get(id).await.is_some());
    }

    #[tokio::test]
    async fn test_snippet_save_retry_after_failure() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let id = Uuid::new_v4();
        alice.handle(create_snippet(id, "x")).await.unwrap();
        *h.transcript.fail.lock() = true;
        alice.handle(save(id, "alice", "x = 1")).await.unwrap();
        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::MessageFailed(_))));

        *h.transcript.fail.lock() = false;
        alice.handle(save(id, "alice", "x = 1")).await.unwrap();

        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::ReceiveMessage(m)) if m.content == "x = 1"));
        assert!(h.hub.snippets.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_unsaved_snippets_dropped_with_room() {
        let h = harness();
        let (alice, _rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (bob, _rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;
        alice.handle(create_snippet(Uuid::new_v4(), "a")).await.unwrap();
        alice.handle(create_snippet(Uuid::new_v4(), "b")).await.unwrap();

        alice.disconnect().await;
        // bob is still in the room
        assert_eq!(h.hub.snippets.len().await, 2);

        bob.handle(ClientEvent::LeaveRoom("issue-1".into()))
            .await
            .unwrap();
        assert_eq!(h.hub.snippets.len().await, 0);
    }

    #[tokio::test]
    async fn test_creator_disconnect_alone_drops_snippet() {
        let h = harness();
        let (alice, _rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        alice.handle(create_snippet(Uuid::new_v4(), "a")).await.unwrap();
        assert_eq!(h.hub.snippets.len().await, 1);

        alice.disconnect().await;
        assert_eq!(h.hub.snippets.len().await, 0);
    }

    fn upload(id: Uuid, files: &[(&str, &str)]) -> ClientEvent {
        ClientEvent::WorkspaceUpload(protocol::WorkspaceUpload {
            issue_id: "issue-1".into(),
            workspace_id: Some(id),
            name: "fix".into(),
            files: files
                .iter()
                .map(|(path, content)| protocol::UploadedFile {
                    path: path.to_string(),
                    content: content.to_string(),
                })
                .collect(),
        })
    }

    #[tokio::test]
    async fn test_workspace_upload_and_file_save() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;
        let id = Uuid::new_v4();

        alice
            .handle(upload(id, &[("src/lib.rs", "pub fn a() {}")]))
            .await
            .unwrap();
        assert!(rx_a.try_recv().is_err());
        match rx_b.try_recv().unwrap() {
            ServerEvent::WorkspaceCreated(w) => {
                assert_eq!(w.id, id);
                assert_eq!(w.files[0].language, "rust");
                assert_eq!(w.created_by, "alice");
            }
            other => panic!("Expected WorkspaceCreated, got {:?}", other),
        }

        alice
            .handle(ClientEvent::FileSave(protocol::FileSave {
                issue_id: "issue-1".into(),
                workspace_id: id,
                file_path: "src/main.py".into(),
                content: "print(1)".into(),
            }))
            .await
            .unwrap();
        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                ServerEvent::FileSaved(s) => {
                    assert_eq!(s.language, "python");
                    assert_eq!(s.size, 8);
                }
                other => panic!("Expected FileSaved, got {:?}", other),
            }
        }
        assert_eq!(h.transcript.workspaces.lock()[&id].files.len(), 2);
    }

    #[tokio::test]
    async fn test_workspace_too_large() {
        let h = harness_with(Config {
            max_workspace_bytes: 4,
            ..Config::default()
        });
        let (alice, _rx) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;

        let err = alice
            .handle(upload(Uuid::new_v4(), &[("a.txt", "12345")]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "workspace_too_large");
    }

    #[tokio::test]
    async fn test_flagged_workspace_not_relayed() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;
        let id = Uuid::new_v4();

        alice
            .handle(upload(id, &[("ok.rs", "fn a() {}"), (".env", &private_key())]))
            .await
            .unwrap();

        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::WorkspaceFlagged(f)) if f.file_path == ".env"));
        assert!(rx_b.try_recv().is_err());
        assert!(h.transcript.workspaces.lock().is_empty());
    }

    #[tokio::test]
    async fn test_workspace_moderation_can_be_disabled() {
        let h = harness_with(Config {
            moderate_workspace: false,
            ..Config::default()
        });
        let (alice, _rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;

        alice
            .handle(ClientEvent::FileEdit(protocol::FileEdit {
                issue_id: "issue-1".into(),
                workspace_id: Uuid::new_v4(),
                file_path: "notes.md".into(),
                content: "seed phrase".into(),
            }))
            .await
            .unwrap();

        assert!(matches!(rx_b.try_recv(), Ok(ServerEvent::FileUpdated(u)) if u.user_id == "alice"));
    }

    #[tokio::test]
    async fn test_file_open_goes_to_others() {
        let h = harness();
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (_bob, mut rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;

        alice
            .handle(ClientEvent::FileOpen(protocol::FileOpen {
                issue_id: "issue-1".into(),
                workspace_id: Uuid::new_v4(),
                file_path: "README.md".into(),
            }))
            .await
            .unwrap();

        assert!(rx_a.try_recv().is_err());
        assert!(matches!(rx_b.try_recv(), Ok(ServerEvent::FileOpened(o)) if o.file_path == "README.md"));
    }

    #[tokio::test]
    async fn test_save_file_unknown_workspace() {
        let h = harness();
        let (alice, _rx) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;

        let err = alice
            .handle(ClientEvent::FileSave(protocol::FileSave {
                issue_id: "issue-1".into(),
                workspace_id: Uuid::new_v4(),
                file_path: "a.rs".into(),
                content: "".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_handle_text_reports_malformed_frames() {
        let h = harness();
        let (alice, mut rx) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;

        alice.handle_text("not json").await;
        match rx.try_recv().unwrap() {
            ServerEvent::Error(e) => assert_eq!(e.code, "invalid_payload"),
            other => panic!("Expected Error, got {:?}", other),
        }

        // Still usable afterwards
        alice
            .handle_text(r#"{"event":"send_message","data":{"issueId":"issue-1","senderId":"alice","content":"hi"}}"#)
            .await;
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::ReceiveMessage(_))));
    }

    #[tokio::test]
    async fn test_leave_and_disconnect() {
        let h = harness();
        let (alice, _rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (bob, _rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-2").await;

        alice
            .handle(ClientEvent::LeaveRoom("issue-1".into()))
            .await
            .unwrap();
        assert_eq!(h.hub.registry.room_count().await, 1);

        bob.disconnect().await;
        assert_eq!(h.hub.registry.room_count().await, 0);
        assert_eq!(h.hub.registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_custom_policy_is_used() {
        struct AnyoneEdits;
        impl AccessPolicy for AnyoneEdits {
            fn can_delete_message(&self, _actor: &Identity, _message: &Message) -> bool {
                false
            }
            fn can_edit_snippet(&self, _actor: &Identity, _snippet: &SnippetSession) -> bool {
                true
            }
        }

        let transcript = Arc::new(MemoryTranscript::default());
        let hub = Hub::new(&Config::default(), transcript.clone()).with_policy(Arc::new(AnyoneEdits));
        let h = Harness {
            hub: Arc::new(hub),
            transcript,
        };
        let (alice, mut rx_a) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;
        let (bob, _rx_b) = join(&h, Identity::new("bob", "Bob"), "issue-1").await;
        let id = Uuid::new_v4();
        alice.handle(create_snippet(id, "")).await.unwrap();

        bob.handle(sync(id, "bob was here")).await.unwrap();
        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::CodeUpdate(u)) if u.code == "bob was here"));

        alice.handle(send("issue-1", "alice", "keep")).await.unwrap();
        let message_id = match rx_a.try_recv().unwrap() {
            ServerEvent::ReceiveMessage(m) => m.id,
            other => panic!("Expected ReceiveMessage, got {:?}", other),
        };
        let err = alice
            .handle(ClientEvent::DeleteMessage(protocol::DeleteMessage {
                issue_id: "issue-1".into(),
                message_id,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn test_custom_moderator_is_used() {
        struct BlockAll;
        impl Moderator for BlockAll {
            fn scan(&self, _text: &str) -> Verdict {
                Verdict::flagged("blocked")
            }
        }

        let transcript = Arc::new(MemoryTranscript::default());
        let hub = Hub::new(&Config::default(), transcript.clone()).with_moderator(Arc::new(BlockAll));
        let h = Harness {
            hub: Arc::new(hub),
            transcript,
        };
        let (alice, mut rx) = join(&h, Identity::new("alice", "Alice"), "issue-1").await;

        alice.handle(send("issue-1", "alice", "hello")).await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::MessageFlagged(f)) if f.reason == "blocked"));
    }
}

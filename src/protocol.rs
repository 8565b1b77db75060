//! Websocket event protocol
//!
//! Frames are JSON objects of the form `{"event": "<name>", "data": <payload>}`.
//! Event names and camelCase payload fields are shared with the web client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;
use crate::models::{Message, MessageType, Workspace};
use crate::room::Participant;

/// Events from client to server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join the room of an issue
    JoinRoom(String),
    /// Leave the room of an issue
    LeaveRoom(String),
    SendMessage(SendMessage),
    Typing(Typing),
    DeleteMessage(DeleteMessage),
    CodeSnippetCreate(CodeSnippetCreate),
    CodeSync(CodeSync),
    CodeSnippetSave(CodeSnippetSave),
    WorkspaceUpload(WorkspaceUpload),
    FileOpen(FileOpen),
    FileEdit(FileEdit),
    FileSave(FileSave),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub issue_id: String,
    pub sender_id: String,
    /// Ignored in favour of the connection's display name
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_avatar: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub issue_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    pub issue_id: String,
    pub message_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSnippetCreate {
    pub issue_id: String,
    /// Client-chosen id; generated when absent
    #[serde(default)]
    pub snippet_id: Option<Uuid>,
    pub language: String,
    #[serde(default)]
    pub initial_code: String,
    pub created_by: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSync {
    pub snippet_id: Uuid,
    pub issue_id: String,
    pub new_code: String,
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSnippetSave {
    pub snippet_id: Uuid,
    pub issue_id: String,
    pub final_code: String,
    pub language: String,
    pub sender_id: String,
    /// Ignored in favour of the connection's display name
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_avatar: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub path: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceUpload {
    pub issue_id: String,
    /// Client-chosen id; generated when absent
    #[serde(default)]
    pub workspace_id: Option<Uuid>,
    pub name: String,
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOpen {
    pub issue_id: String,
    pub workspace_id: Uuid,
    pub file_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEdit {
    pub issue_id: String,
    pub workspace_id: Uuid,
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSave {
    pub issue_id: String,
    pub workspace_id: Uuid,
    pub file_path: String,
    pub content: String,
}

impl ClientEvent {
    /// Decode and validate a text frame.
    ///
    /// A frame that fails here never reaches the dedup guards or the
    /// moderation gate.
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        let event: ClientEvent = serde_json::from_str(text)
            .map_err(|e| SessionError::InvalidPayload(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => "join_room",
            ClientEvent::LeaveRoom(_) => "leave_room",
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::DeleteMessage(_) => "delete_message",
            ClientEvent::CodeSnippetCreate(_) => "code_snippet_create",
            ClientEvent::CodeSync(_) => "code_sync",
            ClientEvent::CodeSnippetSave(_) => "code_snippet_save",
            ClientEvent::WorkspaceUpload(_) => "workspace_upload",
            ClientEvent::FileOpen(_) => "file_open",
            ClientEvent::FileEdit(_) => "file_edit",
            ClientEvent::FileSave(_) => "file_save",
        }
    }

    /// Room the event targets
    pub fn room_id(&self) -> &str {
        match self {
            ClientEvent::JoinRoom(room) | ClientEvent::LeaveRoom(room) => room,
            ClientEvent::SendMessage(p) => &p.issue_id,
            ClientEvent::Typing(p) => &p.issue_id,
            ClientEvent::DeleteMessage(p) => &p.issue_id,
            ClientEvent::CodeSnippetCreate(p) => &p.issue_id,
            ClientEvent::CodeSync(p) => &p.issue_id,
            ClientEvent::CodeSnippetSave(p) => &p.issue_id,
            ClientEvent::WorkspaceUpload(p) => &p.issue_id,
            ClientEvent::FileOpen(p) => &p.issue_id,
            ClientEvent::FileEdit(p) => &p.issue_id,
            ClientEvent::FileSave(p) => &p.issue_id,
        }
    }

    fn validate(&self) -> Result<(), SessionError> {
        require("issueId", self.room_id())?;

        match self {
            ClientEvent::JoinRoom(_) | ClientEvent::LeaveRoom(_) => Ok(()),
            ClientEvent::SendMessage(p) => {
                require("senderId", &p.sender_id)?;
                if p.content.trim().is_empty() && p.attachments.is_empty() {
                    return Err(SessionError::EmptyMessage);
                }
                Ok(())
            }
            ClientEvent::Typing(p) => require("userId", &p.user_id),
            ClientEvent::DeleteMessage(_) => Ok(()),
            ClientEvent::CodeSnippetCreate(p) => {
                require("language", &p.language)?;
                require("createdBy", &p.created_by)
            }
            ClientEvent::CodeSync(p) => require("language", &p.language),
            ClientEvent::CodeSnippetSave(p) => {
                require("language", &p.language)?;
                require("senderId", &p.sender_id)?;
                if p.final_code.trim().is_empty() {
                    return Err(SessionError::EmptyMessage);
                }
                Ok(())
            }
            ClientEvent::WorkspaceUpload(p) => {
                require("name", &p.name)?;
                if p.files.is_empty() {
                    return Err(SessionError::InvalidPayload(
                        "files must not be empty".to_string(),
                    ));
                }
                p.files.iter().try_for_each(|f| require("path", &f.path))
            }
            ClientEvent::FileOpen(p) => require("filePath", &p.file_path),
            ClientEvent::FileEdit(p) => require("filePath", &p.file_path),
            ClientEvent::FileSave(p) => require("filePath", &p.file_path),
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), SessionError> {
    if value.trim().is_empty() {
        Err(SessionError::InvalidPayload(format!("{} is required", field)))
    } else {
        Ok(())
    }
}

/// Events from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Acknowledges a join to the joiner
    RoomJoined(RoomJoined),
    /// A clean message, delivered to the whole room
    ReceiveMessage(Message),
    /// A blocked message, delivered to its sender only
    MessageFlagged(FlaggedMessage),
    /// A message could not be persisted
    MessageFailed(MessageFailed),
    UserTyping(UserTyping),
    /// Id of the deleted message
    MessageDeleted(Uuid),
    CodeSnippetCreated(CodeSnippetCreated),
    CodeUpdate(CodeUpdate),
    CodeFlagged(CodeFlagged),
    WorkspaceCreated(Workspace),
    WorkspaceFlagged(WorkspaceFlagged),
    FileOpened(FileOpened),
    FileUpdated(FileUpdated),
    FileSaved(FileSaved),
    /// Rejected event
    Error(ErrorEvent),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    pub issue_id: String,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlaggedMessage {
    #[serde(flatten)]
    pub message: Message,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFailed {
    pub issue_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet_id: Option<Uuid>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSnippetCreated {
    pub snippet_id: Uuid,
    pub language: String,
    pub code: String,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeUpdate {
    pub snippet_id: Uuid,
    pub code: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeFlagged {
    pub snippet_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceFlagged {
    pub workspace_id: Uuid,
    pub file_path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOpened {
    pub workspace_id: Uuid,
    pub file_path: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdated {
    pub workspace_id: Uuid,
    pub file_path: String,
    pub content: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSaved {
    pub workspace_id: Uuid,
    pub file_path: String,
    pub language: String,
    pub size: u64,
    pub user_id: String,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub code: String,
    pub message: String,
}

impl From<&SessionError> for ErrorEvent {
    fn from(err: &SessionError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

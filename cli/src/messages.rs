//! WebSocket event types for the huddle protocol
//!
//! These types mirror the server's protocol. Some fields may not be used
//! directly by the CLI but are part of the complete protocol.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of chat message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    #[default]
    Text,
    File,
    Code,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub language: String,
    pub snippet_id: Uuid,
}

/// A chat message as stored by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub issue_id: String,
    pub sender: Sender,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub metadata: Option<MessageMetadata>,
    pub flagged: bool,
    #[serde(default)]
    pub flag_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Participant information for presence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub connection_id: Uuid,
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Events sent from client to server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom(String),
    LeaveRoom(String),
    SendMessage(SendMessage),
    Typing(Typing),
    DeleteMessage(DeleteMessage),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub issue_id: String,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub issue_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    pub issue_id: String,
    pub message_id: Uuid,
}

/// Events sent from server to client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomJoined(RoomJoined),
    ReceiveMessage(ChatMessage),
    MessageFlagged(FlaggedMessage),
    MessageFailed(MessageFailed),
    UserTyping(UserTyping),
    MessageDeleted(Uuid),
    CodeSnippetCreated(CodeSnippetCreated),
    CodeUpdate(CodeUpdate),
    CodeFlagged(CodeFlagged),
    // Workspace payloads are only displayed, never inspected
    WorkspaceCreated(serde_json::Value),
    WorkspaceFlagged(serde_json::Value),
    FileOpened(serde_json::Value),
    FileUpdated(serde_json::Value),
    FileSaved(serde_json::Value),
    Error(ErrorEvent),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    pub issue_id: String,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlaggedMessage {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFailed {
    pub issue_id: String,
    #[serde(default)]
    pub snippet_id: Option<Uuid>,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSnippetCreated {
    pub snippet_id: Uuid,
    pub language: String,
    pub code: String,
    pub created_by: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeUpdate {
    pub snippet_id: Uuid,
    pub code: String,
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeFlagged {
    pub snippet_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEvent {
    pub code: String,
    pub message: String,
}

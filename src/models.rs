//! Data models for room transcripts and workspaces

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

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::File => "FILE",
            MessageType::Code => "CODE",
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEXT" => Ok(MessageType::Text),
            "FILE" => Ok(MessageType::File),
            "CODE" => Ok(MessageType::Code),
            _ => Err(format!("Invalid message type: {}", s)),
        }
    }
}

/// Who sent a message, as rendered by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Extra data carried by CODE messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub language: String,
    pub snippet_id: Uuid,
}

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub issue_id: String,
    pub sender: Sender,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub attachments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    pub flagged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A message that has not been written to the transcript yet
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub issue_id: String,
    pub sender: Sender,
    pub content: String,
    pub message_type: MessageType,
    pub attachments: Vec<String>,
    pub metadata: Option<MessageMetadata>,
    pub flagged: bool,
    pub flag_reason: Option<String>,
}

/// A file inside a workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceFile {
    pub path: String,
    pub content: String,
    pub language: String,
    pub size: u64,
}

impl WorkspaceFile {
    /// Build a file record, detecting the language from the path
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = path.into();
        let content = content.into();
        Self {
            language: detect_language(&path).to_string(),
            size: content.len() as u64,
            path,
            content,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSummary {
    pub total_files: u64,
    pub total_size: u64,
}

/// A named collection of files attached to an issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: Uuid,
    pub issue_id: String,
    pub name: String,
    pub created_by: String,
    pub files: Vec<WorkspaceFile>,
    pub summary: WorkspaceSummary,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(
        id: Uuid,
        issue_id: impl Into<String>,
        name: impl Into<String>,
        created_by: impl Into<String>,
        files: Vec<WorkspaceFile>,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        let summary = WorkspaceSummary {
            total_files: files.len() as u64,
            total_size: files.iter().map(|f| f.size).sum(),
        };

        Self {
            id,
            issue_id: issue_id.into(),
            name: name.into(),
            created_by: created_by.into(),
            files,
            summary,
            created_at: now,
            expires_at: now + ttl,
        }
    }
}

/// Guess a language identifier from a file extension
pub fn detect_language(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "rs" => "rust",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "py" => "python",
        "sol" => "solidity",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "json" => "json",
        "md" => "markdown",
        "html" | "htm" => "html",
        "css" => "css",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        _ => "plaintext",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_as_str() {
        assert_eq!(MessageType::Text.as_str(), "TEXT");
        assert_eq!(MessageType::File.as_str(), "FILE");
        assert_eq!(MessageType::Code.as_str(), "CODE");
    }

    #[test]
    fn test_message_type_from_str() {
        assert_eq!("CODE".parse::<MessageType>().unwrap(), MessageType::Code);
        assert!("code".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_message_wire_shape() {
        let message = Message {
            id: Uuid::nil(),
            issue_id: "issue-42".to_string(),
            sender: Sender {
                id: "u1".to_string(),
                name: "Alice".to_string(),
                avatar: None,
            },
            content: "hello".to_string(),
            message_type: MessageType::Text,
            attachments: vec![],
            metadata: None,
            flagged: false,
            flag_reason: None,
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["_id"], Uuid::nil().to_string());
        assert_eq!(json["issueId"], "issue-42");
        assert_eq!(json["type"], "TEXT");
        assert!(json.get("metadata").is_none());
        assert!(json.get("flagReason").is_none());
    }

    #[test]
    fn test_workspace_file_detects_language() {
        let file = WorkspaceFile::new("contracts/Escrow.sol", "pragma solidity ^0.8.0;");
        assert_eq!(file.language, "solidity");
        assert_eq!(file.size, 23);
    }

    #[test]
    fn test_detect_language_fallback() {
        assert_eq!(detect_language("Makefile"), "plaintext");
        assert_eq!(detect_language("src/MAIN.RS"), "rust");
    }

    #[test]
    fn test_workspace_summary() {
        let files = vec![
            WorkspaceFile::new("a.rs", "fn main() {}"),
            WorkspaceFile::new("b.py", "print(1)"),
        ];
        let workspace = Workspace::new(
            Uuid::new_v4(),
            "issue-1",
            "demo",
            "u1",
            files,
            chrono::Duration::hours(1),
        );

        assert_eq!(workspace.summary.total_files, 2);
        assert_eq!(workspace.summary.total_size, 20);
        assert!(workspace.expires_at > workspace.created_at);
    }
}

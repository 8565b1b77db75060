//! Transcript and workspace persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    Message, MessageMetadata, NewMessage, Sender, Workspace, WorkspaceFile, WorkspaceSummary,
};

/// Durable storage the collaboration core writes through.
///
/// Everything else about issues and users lives in the surrounding
/// application; this is the only persistence the websocket layer needs.
#[async_trait]
pub trait Transcript: Send + Sync {
    async fn persist_message(&self, message: NewMessage) -> Result<Message>;

    async fn get_message(&self, id: Uuid) -> Result<Message>;

    async fn delete_message(&self, id: Uuid) -> Result<()>;

    /// Messages of a room, oldest first
    async fn messages_for_room(&self, issue_id: &str, include_flagged: bool)
        -> Result<Vec<Message>>;

    async fn save_workspace(&self, workspace: &Workspace) -> Result<()>;

    /// Insert or replace one file of an existing workspace
    async fn save_workspace_file(&self, workspace_id: Uuid, file: &WorkspaceFile) -> Result<()>;
}

/// Run the embedded migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::Internal(format!("Migration failed: {}", e)))
}

/// SQLite-backed store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_workspace(&self, id: Uuid) -> Result<Workspace> {
        let row = sqlx::query_as::<_, WorkspaceRow>(
            r#"
            SELECT id, issue_id, name, created_by, total_files, total_size, created_at, expires_at
            FROM workspaces
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Workspace {} not found", id)))?;

        let files = sqlx::query_as::<_, WorkspaceFileRow>(
            r#"
            SELECT path, content, language, size
            FROM workspace_files
            WHERE workspace_id = ?
            ORDER BY path ASC
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        row.into_workspace(files.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl Transcript for Store {
    async fn persist_message(&self, message: NewMessage) -> Result<Message> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let attachments = serde_json::to_string(&message.attachments)
            .map_err(|e| AppError::Internal(format!("Invalid attachments: {}", e)))?;
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::Internal(format!("Invalid metadata: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, issue_id, sender_id, sender_name, sender_avatar, content,
                                  message_type, attachments, metadata, flagged, flag_reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&message.issue_id)
        .bind(&message.sender.id)
        .bind(&message.sender.name)
        .bind(&message.sender.avatar)
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(attachments)
        .bind(metadata)
        .bind(message.flagged)
        .bind(&message.flag_reason)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Message {
            id,
            issue_id: message.issue_id,
            sender: message.sender,
            content: message.content,
            message_type: message.message_type,
            attachments: message.attachments,
            metadata: message.metadata,
            flagged: message.flagged,
            flag_reason: message.flag_reason,
            created_at: now,
        })
    }

    async fn get_message(&self, id: Uuid) -> Result<Message> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, issue_id, sender_id, sender_name, sender_avatar, content, message_type,
                   attachments, metadata, flagged, flag_reason, created_at
            FROM messages
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Message {} not found", id)))?;

        row.try_into()
    }

    async fn delete_message(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Message {} not found", id)));
        }
        Ok(())
    }

    async fn messages_for_room(
        &self,
        issue_id: &str,
        include_flagged: bool,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, issue_id, sender_id, sender_name, sender_avatar, content, message_type,
                   attachments, metadata, flagged, flag_reason, created_at
            FROM messages
            WHERE issue_id = ? AND (? OR flagged = 0)
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(issue_id)
        .bind(include_flagged)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn save_workspace(&self, workspace: &Workspace) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workspaces (id, issue_id, name, created_by, total_files, total_size, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(workspace.id.to_string())
        .bind(&workspace.issue_id)
        .bind(&workspace.name)
        .bind(&workspace.created_by)
        .bind(workspace.summary.total_files as i64)
        .bind(workspace.summary.total_size as i64)
        .bind(workspace.created_at)
        .bind(workspace.expires_at)
        .execute(&mut *tx)
        .await?;

        for file in &workspace.files {
            sqlx::query(
                r#"
                INSERT INTO workspace_files (workspace_id, path, content, language, size)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(workspace.id.to_string())
            .bind(&file.path)
            .bind(&file.content)
            .bind(&file.language)
            .bind(file.size as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_workspace_file(&self, workspace_id: Uuid, file: &WorkspaceFile) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM workspaces WHERE id = ?")
            .bind(workspace_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        if exists == 0 {
            return Err(AppError::NotFound(format!(
                "Workspace {} not found",
                workspace_id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO workspace_files (workspace_id, path, content, language, size)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (workspace_id, path)
            DO UPDATE SET content = excluded.content, language = excluded.language, size = excluded.size
            "#,
        )
        .bind(workspace_id.to_string())
        .bind(&file.path)
        .bind(&file.content)
        .bind(&file.language)
        .bind(file.size as i64)
        .execute(&mut *tx)
        .await?;

        // Keep the summary in step with the files
        sqlx::query(
            r#"
            UPDATE workspaces
            SET total_files = (SELECT COUNT(*) FROM workspace_files WHERE workspace_id = ?1),
                total_size = (SELECT COALESCE(SUM(size), 0) FROM workspace_files WHERE workspace_id = ?1)
            WHERE id = ?1
            "#,
        )
        .bind(workspace_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    issue_id: String,
    sender_id: String,
    sender_name: String,
    sender_avatar: Option<String>,
    content: String,
    message_type: String,
    attachments: String,
    metadata: Option<String>,
    flagged: bool,
    flag_reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = AppError;

    fn try_from(row: MessageRow) -> Result<Self> {
        let metadata = row
            .metadata
            .map(|s| serde_json::from_str::<MessageMetadata>(&s))
            .transpose()
            .map_err(|e| AppError::Internal(format!("Invalid metadata: {}", e)))?;

        Ok(Message {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| AppError::Internal(format!("Invalid UUID: {}", e)))?,
            issue_id: row.issue_id,
            sender: Sender {
                id: row.sender_id,
                name: row.sender_name,
                avatar: row.sender_avatar,
            },
            content: row.content,
            message_type: row
                .message_type
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid message type: {}", e)))?,
            attachments: serde_json::from_str(&row.attachments)
                .map_err(|e| AppError::Internal(format!("Invalid attachments: {}", e)))?,
            metadata,
            flagged: row.flagged,
            flag_reason: row.flag_reason,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    issue_id: String,
    name: String,
    created_by: String,
    total_files: i64,
    total_size: i64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl WorkspaceRow {
    fn into_workspace(self, files: Vec<WorkspaceFile>) -> Result<Workspace> {
        Ok(Workspace {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| AppError::Internal(format!("Invalid UUID: {}", e)))?,
            issue_id: self.issue_id,
            name: self.name,
            created_by: self.created_by,
            files,
            summary: WorkspaceSummary {
                total_files: self.total_files.max(0) as u64,
                total_size: self.total_size.max(0) as u64,
            },
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkspaceFileRow {
    path: String,
    content: String,
    language: String,
    size: i64,
}

impl From<WorkspaceFileRow> for WorkspaceFile {
    fn from(row: WorkspaceFileRow) -> Self {
        WorkspaceFile {
            path: row.path,
            content: row.content,
            language: row.language,
            size: row.size.max(0) as u64,
        }
    }
}

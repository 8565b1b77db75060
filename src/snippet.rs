//! Ephemeral collaborative code snippets
//!
//! A snippet lives in memory from `code_snippet_create` until it is saved
//! as a CODE message or its room empties. Peers only ever receive copies of
//! its code.

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnippetState {
    /// Announced to the room, no edits yet
    Created,
    /// At least one edit has been relayed
    Editing,
}

#[derive(Debug, Clone)]
pub struct SnippetSession {
    pub id: Uuid,
    pub issue_id: String,
    pub language: String,
    pub code: String,
    pub created_by: String,
    pub state: SnippetState,
}

impl SnippetSession {
    pub fn new(
        issue_id: impl Into<String>,
        language: impl Into<String>,
        code: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            issue_id: issue_id.into(),
            language: language.into(),
            code: code.into(),
            created_by: created_by.into(),
            state: SnippetState::Created,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }
}

/// Snippets currently being edited, across all rooms
#[derive(Default)]
pub struct SnippetTable {
    snippets: RwLock<HashMap<Uuid, SnippetSession>>,
}

impl SnippetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a snippet; returns `false` if the id is already live
    pub async fn insert(&self, snippet: SnippetSession) -> bool {
        let mut snippets = self.snippets.write().await;
        if snippets.contains_key(&snippet.id) {
            return false;
        }
        snippets.insert(snippet.id, snippet);
        true
    }

    pub async fn get(&self, id: Uuid) -> Option<SnippetSession> {
        self.snippets.read().await.get(&id).cloned()
    }

    /// Replace the code of a live snippet; returns `false` if it is gone
    pub async fn apply_edit(&self, id: Uuid, code: &str, language: &str) -> bool {
        let mut snippets = self.snippets.write().await;
        match snippets.get_mut(&id) {
            Some(snippet) => {
                snippet.code = code.to_string();
                snippet.language = language.to_string();
                snippet.state = SnippetState::Editing;
                true
            }
            None => false,
        }
    }

    /// End the session once the snippet has been saved
    pub async fn finish(&self, id: Uuid) -> Option<SnippetSession> {
        self.snippets.write().await.remove(&id)
    }

    /// Drop every snippet of a room; returns how many were dropped
    pub async fn remove_room(&self, issue_id: &str) -> usize {
        let mut snippets = self.snippets.write().await;
        let before = snippets.len();
        snippets.retain(|_, s| s.issue_id != issue_id);
        before - snippets.len()
    }

    pub async fn len(&self) -> usize {
        self.snippets.read().await.len()
    }
}

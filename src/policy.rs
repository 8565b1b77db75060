//! Authorization decisions for room actions
//!
//! The session layer never decides on its own who may delete a message or
//! edit a snippet; it asks an [`AccessPolicy`] supplied at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::Message;
use crate::room::{Identity, Role};
use crate::snippet::SnippetSession;

/// Capabilities that go beyond acting on one's own content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Can delete messages sent by others
    DeleteAnyMessage,
    /// Can push edits to snippets created by others
    EditAnySnippet,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::DeleteAnyMessage => "delete_any_message",
            Capability::EditAnySnippet => "edit_any_snippet",
        }
    }

    /// Default capabilities granted to a role
    pub fn for_role(role: Role) -> HashSet<Capability> {
        let mut caps = HashSet::new();
        match role {
            Role::User => {}
            Role::Moderator => {
                caps.insert(Capability::DeleteAnyMessage);
            }
            Role::Admin => {
                caps.insert(Capability::DeleteAnyMessage);
                caps.insert(Capability::EditAnySnippet);
            }
        }
        caps
    }
}

pub trait AccessPolicy: Send + Sync {
    fn can_delete_message(&self, actor: &Identity, message: &Message) -> bool;
    fn can_edit_snippet(&self, actor: &Identity, snippet: &SnippetSession) -> bool;
}

/// Owners act on their own content; elevated roles get role capabilities
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerPolicy;

impl AccessPolicy for OwnerPolicy {
    fn can_delete_message(&self, actor: &Identity, message: &Message) -> bool {
        message.sender.id == actor.id
            || Capability::for_role(actor.role).contains(&Capability::DeleteAnyMessage)
    }

    fn can_edit_snippet(&self, actor: &Identity, snippet: &SnippetSession) -> bool {
        snippet.created_by == actor.id
            || Capability::for_role(actor.role).contains(&Capability::EditAnySnippet)
    }
}

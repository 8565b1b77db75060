//! WebSocket server handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{AppError, Result};
use crate::room::{Identity, Role};
use crate::session::{Hub, Session};
use crate::AppState;

/// Identity resolved by the upstream auth layer, passed on the upgrade URL.
///
/// `role` is only honoured when the hub trusts client roles; it grants
/// moderation rights, so it must come from the proxy and not the browser.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub role: Option<String>,
}

impl ConnectQuery {
    fn into_identity(self, trust_role: bool) -> Result<Identity> {
        let user_id = self.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(AppError::BadRequest("userId is required".to_string()));
        }

        let role = match self.role.as_deref() {
            Some(role) if trust_role => role.parse::<Role>().map_err(AppError::BadRequest)?,
            Some(role) => {
                tracing::debug!(%user_id, role, "Ignoring untrusted role");
                Role::default()
            }
            None => Role::default(),
        };
        let display_name = self
            .display_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| user_id.clone());

        let mut identity = Identity::new(user_id, display_name).with_role(role);
        if let Some(avatar) = self.avatar_url {
            identity = identity.with_avatar(avatar);
        }
        Ok(identity)
    }
}

/// WebSocket handler
pub async fn handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response> {
    let identity = query.into_identity(state.hub.trusts_client_role())?;
    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, identity)))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, identity: Identity) {
    let (mut sender, mut receiver) = socket.split();

    // Everything addressed to this connection goes through its outbox, so
    // a slow client never stalls a broadcast.
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::connect(hub, identity, tx).await;
    let connection_id = session.id();

    let writer = tokio::spawn(async move {
        let mut outbox = UnboundedReceiverStream::new(rx);
        while let Some(event) = outbox.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(%connection_id, "Failed to encode event: {}", e);
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(text)).await {
                tracing::debug!(%connection_id, "Failed to send event: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(%connection_id, "WebSocket error: {}", e);
                break;
            }
        };

        session.handle_text(&text).await;
    }

    // Dropping the registry's outbox ends the writer
    session.disconnect().await;
    if let Err(e) = writer.await {
        tracing::error!(%connection_id, "Writer task failed: {}", e);
    }
}

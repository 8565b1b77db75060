//! HTTP routes next to the websocket endpoint

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::Result;
use crate::models::Message;
use crate::store::Transcript;
use crate::AppState;

pub async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default)]
    pub include_flagged: bool,
}

/// Transcript of a room, oldest first
pub async fn room_messages(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>> {
    let messages = state
        .store
        .messages_for_room(&room_id, query.include_flagged)
        .await?;
    Ok(Json(messages))
}

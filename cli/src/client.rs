//! WebSocket client for the huddle server

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use uuid::Uuid;

use crate::messages::{
    ClientEvent, DeleteMessage, MessageType, Participant, SendMessage, ServerEvent, Typing,
};

/// Who this client speaks as
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub name: String,
}

/// Add the identity query parameters the server expects on upgrade
pub fn connect_url(server: &str, user: &User) -> Result<Url> {
    let mut url = Url::parse(server)?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(anyhow!("Unsupported scheme: {}", other)),
    }
    url.query_pairs_mut()
        .append_pair("userId", &user.id)
        .append_pair("displayName", &user.name);
    Ok(url)
}

/// WebSocket client for huddle rooms
pub struct HuddleClient {
    user: User,
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<ServerEvent>,
    #[allow(dead_code)]
    handle: tokio::task::JoinHandle<()>,
}

impl HuddleClient {
    /// Connect to a huddle server as `user`
    pub async fn connect(server: &str, user: User) -> Result<Self> {
        let url = connect_url(server, &user)?;
        tracing::info!("Connecting to {}", url);

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        // Channel for outgoing frames
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(32);

        // Channel for incoming parsed events
        let (in_tx, in_rx) = mpsc::channel::<ServerEvent>(256);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = out_rx.recv() => {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(result) = read.next() => {
                        match result {
                            Ok(Message::Text(text)) => {
                                match serde_json::from_str::<ServerEvent>(&text) {
                                    Ok(event) => {
                                        if in_tx.send(event).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("Failed to parse event: {} - {}", e, text);
                                    }
                                }
                            }
                            Ok(Message::Close(_)) => break,
                            Err(e) => {
                                tracing::error!("WebSocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    else => break,
                }
            }
        });

        tracing::info!("Connected as {}", user.id);

        Ok(Self {
            user,
            tx: out_tx,
            rx: in_rx,
            handle,
        })
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    async fn send(&self, event: ClientEvent) -> Result<()> {
        let json = serde_json::to_string(&event)?;
        self.tx
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| anyhow!("Failed to send event: {}", e))
    }

    /// Receive the next event from the server
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.rx.try_recv().ok()
    }

    /// Join a room and wait for the acknowledgement
    pub async fn join(&mut self, room_id: &str) -> Result<Vec<Participant>> {
        self.send(ClientEvent::JoinRoom(room_id.to_string())).await?;

        while let Some(event) = self.recv().await {
            match event {
                ServerEvent::RoomJoined(ack) if ack.issue_id == room_id => {
                    return Ok(ack.participants);
                }
                ServerEvent::Error(e) => {
                    return Err(anyhow!("Server error ({}): {}", e.code, e.message));
                }
                _ => continue,
            }
        }

        Err(anyhow!("Connection closed"))
    }

    pub async fn leave(&mut self, room_id: &str) -> Result<()> {
        self.send(ClientEvent::LeaveRoom(room_id.to_string())).await
    }

    /// Send a text message (non-blocking, returns immediately)
    pub async fn send_message(&mut self, room_id: &str, content: String) -> Result<()> {
        self.send(ClientEvent::SendMessage(SendMessage {
            issue_id: room_id.to_string(),
            sender_id: self.user.id.clone(),
            sender_name: Some(self.user.name.clone()),
            content,
            message_type: MessageType::Text,
            attachments: Vec::new(),
        }))
        .await
    }

    pub async fn typing(&mut self, room_id: &str) -> Result<()> {
        self.send(ClientEvent::Typing(Typing {
            issue_id: room_id.to_string(),
            user_id: self.user.id.clone(),
        }))
        .await
    }

    pub async fn delete_message(&mut self, room_id: &str, message_id: Uuid) -> Result<()> {
        self.send(ClientEvent::DeleteMessage(DeleteMessage {
            issue_id: room_id.to_string(),
            message_id,
        }))
        .await
    }

    /// Listen for events until callback returns false
    pub async fn listen<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(ServerEvent) -> bool,
    {
        while let Some(event) = self.recv().await {
            if !callback(event) {
                break;
            }
        }
        Ok(())
    }
}

//! WebSocket upgrade handler

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::game::broadcast::{Peer, PeerId, PeerMessage};
use crate::game::r#match::format_id;
use crate::game::registry::{MatchCommand, MatchHandle};
use crate::ws::protocol::Handshake;
use crate::ws::session::{ClientSession, ServerSequence};

/// Time a new connection gets to send its handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let handshake = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut ws_stream)).await {
        Ok(Some(handshake)) => handshake,
        Ok(None) => {
            let _ = ws_sink.send(Message::Close(None)).await;
            return;
        }
        Err(_) => {
            warn!("Handshake timed out");
            let _ = ws_sink.send(Message::Close(None)).await;
            return;
        }
    };

    let Some(handle) = state.registry.get(handshake.game_id) else {
        error!(match_id = %format_id(handshake.game_id), "No game exists with that ID");
        let _ = ws_sink.send(Message::Close(None)).await;
        return;
    };

    let (peer, peer_rx) = Peer::channel();
    let session = ClientSession::new(handshake, peer.id());
    info!(
        peer_id = %peer.id(),
        match_id = %format_id(session.game_id()),
        token = %format_id(session.player_token()),
        "Client connected"
    );

    let mut writer_handle = tokio::spawn(run_writer(ws_sink, peer_rx, peer.id()));

    // The writer ends once the match closes this peer, which also ends the reader
    let token = session.player_token();
    tokio::select! {
        _ = run_reader(ws_stream, session, &peer, &handle) => {}
        _ = &mut writer_handle => {
            debug!(peer_id = %peer.id(), "Writer finished, closing reader");
        }
    }

    // Leave the match in the same step the socket goes away
    handle
        .send(MatchCommand::Disconnect {
            peer_id: peer.id(),
            token,
        })
        .await;

    writer_handle.abort();
    info!(peer_id = %peer.id(), "Client disconnected");
}

/// Wait for the 12-byte handshake frame
async fn read_handshake(ws_stream: &mut SplitStream<WebSocket>) -> Option<Handshake> {
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Binary(data)) => {
                return match Handshake::parse(&data) {
                    Ok(handshake) => Some(handshake),
                    Err(e) => {
                        error!(error = %e, "Handshake failed");
                        None
                    }
                };
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Text(_)) => {
                warn!("Expected a binary handshake, got text");
                return None;
            }
            Ok(Message::Close(_)) => return None,
            Err(e) => {
                debug!(error = %e, "WebSocket error before handshake");
                return None;
            }
        }
    }
    None
}

/// Reader loop: WebSocket -> match task
async fn run_reader(
    mut ws_stream: SplitStream<WebSocket>,
    mut session: ClientSession,
    peer: &Peer,
    handle: &MatchHandle,
) {
    let peer_id = session.peer_id();
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Binary(data)) => match session.accept_frame(&data) {
                Ok(packet) => {
                    let command = MatchCommand::Packet {
                        peer: peer.clone(),
                        token: session.player_token(),
                        packet,
                    };
                    if !handle.send(command).await {
                        debug!(peer_id = %peer_id, "Match is gone");
                        break;
                    }
                }
                Err(e) => {
                    warn!(peer_id = %peer_id, error = %e, "Dropped client packet");
                }
            },
            Ok(Message::Text(_)) => {
                warn!(peer_id = %peer_id, "Received text message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(peer_id = %peer_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(peer_id = %peer_id, error = %e, "WebSocket error");
                break;
            }
        }
    }
}

/// Writer loop: peer queue -> WebSocket, numbering frames per connection
async fn run_writer(
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut peer_rx: mpsc::Receiver<PeerMessage>,
    peer_id: PeerId,
) {
    let mut sequence = ServerSequence::default();
    while let Some(message) = peer_rx.recv().await {
        match message {
            PeerMessage::Packet(packet) => {
                let frame = sequence.stamp(&packet);
                if let Err(e) = ws_sink.send(Message::Binary(frame.to_vec())).await {
                    debug!(peer_id = %peer_id, error = %e, "WebSocket send failed");
                    break;
                }
            }
            PeerMessage::Close => {
                debug!(peer_id = %peer_id, "Closing connection");
                let _ = ws_sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

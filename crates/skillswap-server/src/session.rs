//! Per-connection WebSocket tasks.
//!
//! Each connection gets a write task that drains the registry queue and
//! sends keepalive pings, and a read loop that decodes inbound frames and
//! dispatches them by type. Either side ending tears the session down.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use skillswap_shared::constants::WRITE_TIMEOUT_SECS;
use skillswap_shared::protocol::{PeerAnnounce, PieceRequest, PieceResponse};
use skillswap_shared::{Frame, PeerStatus, UserId};
use skillswap_store::ChatPayload;

use crate::api::AppState;
use crate::error::ServerError;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: i64,
}

/// `GET /ws?user_id=N`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Result<Response, ServerError> {
    let user_id = UserId(query.user_id);
    if !user_id.is_valid() {
        return Err(ServerError::Validation("user_id is required".into()));
    }

    let max_frame = state.config.max_frame_size;
    Ok(ws
        .max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| run_session(socket, state, user_id)))
}

async fn run_session(socket: WebSocket, state: AppState, user_id: UserId) {
    let session = match state.registry.connect(user_id).await {
        Ok(session) => session,
        Err(e) => {
            error!(user = %user_id, error = %e, "Could not register session");
            return;
        }
    };
    let session_id = session.id;
    info!(user = %user_id, session = %session_id, "WebSocket session started");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        sink,
        session.outbound,
        state.config.ping_interval,
        user_id,
    ));

    tokio::select! {
        _ = read_loop(stream, &state, user_id, session_id) => {}
        _ = &mut writer => {
            debug!(user = %user_id, session = %session_id, "Write side finished first");
        }
    }

    state.registry.disconnect(user_id, session_id).await;

    // Closing the queue lets the writer send its close frame.
    if !writer.is_finished()
        && timeout(Duration::from_secs(WRITE_TIMEOUT_SECS), &mut writer)
            .await
            .is_err()
    {
        writer.abort();
    }

    info!(user = %user_id, session = %session_id, "WebSocket session ended");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    ping_every: Duration,
    user_id: UserId,
) {
    let write_timeout = Duration::from_secs(WRITE_TIMEOUT_SECS);
    let mut ping = tokio::time::interval(ping_every);
    // The first tick fires immediately.
    ping.tick().await;

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(frame) = next else {
                    let _ = timeout(write_timeout, sink.send(Message::Close(None))).await;
                    break;
                };
                let text = match frame.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(user = %user_id, kind = frame.kind(), error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                match timeout(write_timeout, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(user = %user_id, error = %e, "WebSocket write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(user = %user_id, "WebSocket write timed out");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if timeout(write_timeout, sink.send(Message::Ping(Vec::new())))
                    .await
                    .map_or(true, |sent| sent.is_err())
                {
                    debug!(user = %user_id, "Keepalive ping failed");
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    user_id: UserId,
    session_id: Uuid,
) {
    loop {
        let next = match timeout(state.config.read_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                info!(user = %user_id, "Read deadline expired");
                break;
            }
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(user = %user_id, error = %e, "WebSocket read failure");
                break;
            }
            None => break,
        };

        state.registry.touch(user_id, session_id).await;

        match message {
            Message::Text(text) => match Frame::from_text(&text) {
                Ok(frame) => dispatch(state, user_id, session_id, frame).await,
                Err(e) => {
                    warn!(user = %user_id, error = %e, "Undecodable frame, closing session");
                    break;
                }
            },
            Message::Binary(_) => {
                warn!(user = %user_id, "Binary frames are not supported, closing session");
                break;
            }
            // Pings are answered by the transport; either way the deadline resets.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }
}

/// Route one inbound frame. Failures go back to this session only.
async fn dispatch(state: &AppState, user_id: UserId, session_id: Uuid, frame: Frame) {
    let kind = frame.kind();

    let result = match frame {
        Frame::Chat(chat) => state
            .delivery
            .send(user_id, chat.receiver_id, ChatPayload::Text(chat.content))
            .await
            .map(|_| ()),
        Frame::File(file) => state
            .delivery
            .send(user_id, file.receiver_id, ChatPayload::File(file.file_id))
            .await
            .map(|_| ()),
        Frame::PeerAnnounce(announce) => handle_announce(state, user_id, session_id, announce).await,
        Frame::PeerLeave(leave) => {
            state
                .registry
                .leave(user_id, session_id, leave.resource_id)
                .await;
            Ok(())
        }
        Frame::PieceRequest(request) => handle_piece_request(state, user_id, request).await,
        Frame::PieceResponse(response) => {
            debug!(
                user = %user_id,
                resource_id = %response.resource_id,
                piece = response.piece_index,
                "Ignoring piece_response sent by a client"
            );
            Ok(())
        }
        _ => {
            debug!(user = %user_id, kind, "Ignoring server-only frame from client");
            Ok(())
        }
    };

    if let Err(e) = result {
        match &e {
            ServerError::Validation(_) | ServerError::NotFound(_) | ServerError::Forbidden(_) => {
                debug!(user = %user_id, kind, error = %e, "Frame rejected");
            }
            _ => warn!(user = %user_id, kind, error = %e, "Frame handling failed"),
        }
        state
            .registry
            .unicast(user_id, Frame::error(e.frame_code(), e.public_message()))
            .await;
    }
}

async fn handle_announce(
    state: &AppState,
    user_id: UserId,
    session_id: Uuid,
    announce: PeerAnnounce,
) -> Result<(), ServerError> {
    let progress = announce.progress;
    let report = announce.status.map(|status| {
        let progress = progress.unwrap_or(match status {
            PeerStatus::Leeching => 0.0,
            PeerStatus::Seeding | PeerStatus::Completed => 100.0,
        });
        (status, progress)
    });

    state
        .announce(user_id, announce.resource_id, report, Some(session_id))
        .await
        .map(|_| ())
}

async fn handle_piece_request(
    state: &AppState,
    user_id: UserId,
    request: PieceRequest,
) -> Result<(), ServerError> {
    let resource = state.gate.require(user_id, request.resource_id)?;
    let piece_data = state.pieces.read_piece(&resource, request.piece_index).await?;

    state
        .registry
        .unicast(
            user_id,
            Frame::PieceResponse(PieceResponse {
                resource_id: request.resource_id,
                piece_index: request.piece_index,
                piece_data,
            }),
        )
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use skillswap_shared::protocol::{ChatFrame, PeerLeave};
    use skillswap_shared::ResourceId;
    use skillswap_store::Database;
    use tempfile::TempDir;

    use super::*;
    use crate::config::ServerConfig;
    use crate::piece_store::Upload;
    use crate::registry::Session;

    async fn test_state() -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            content_dir: dir.path().join("content"),
            piece_size: 4,
            ..ServerConfig::default()
        };
        let state = AppState::build(config, Database::open_in_memory().unwrap())
            .await
            .unwrap();
        (state, dir)
    }

    async fn upload(state: &AppState, data: &[u8]) -> ResourceId {
        let upload = Upload {
            owner_id: UserId(1),
            title: "Fingerpicking".into(),
            file_name: "picking.txt".into(),
            skill_name: Some("guitar".into()),
            ..Upload::default()
        };
        state.pieces.create(upload, data, None).await.unwrap().id
    }

    /// Frames queued for `session`, minus presence noise. The `is_online`
    /// round trip makes sure the registry has handled everything sent so far.
    async fn drain(state: &AppState, session: &mut Session) -> Vec<Frame> {
        state.registry.is_online(session.user_id).await.unwrap();
        let mut frames = Vec::new();
        while let Ok(frame) = session.outbound.try_recv() {
            if !matches!(frame, Frame::PeerConnect(_) | Frame::PeerDisconnect(_)) {
                frames.push(frame);
            }
        }
        frames
    }

    fn announce(resource_id: ResourceId, status: Option<PeerStatus>, progress: Option<f64>) -> Frame {
        Frame::PeerAnnounce(PeerAnnounce {
            resource_id,
            status,
            progress,
        })
    }

    #[tokio::test]
    async fn chat_sender_is_the_session_user() {
        let (state, _dir) = test_state().await;
        let alice = state.registry.connect(UserId(1)).await.unwrap();
        let mut bob = state.registry.connect(UserId(2)).await.unwrap();

        let chat = Frame::Chat(ChatFrame {
            message_id: None,
            sender_id: UserId(99),
            receiver_id: UserId(2),
            content: "hola".into(),
            created_at: None,
        });
        dispatch(&state, UserId(1), alice.id, chat).await;

        match drain(&state, &mut bob).await.as_slice() {
            [Frame::Chat(received)] => {
                assert_eq!(received.sender_id, UserId(1));
                assert_eq!(received.content, "hola");
                assert!(received.message_id.is_some());
            }
            other => panic!("expected one chat frame, got {other:?}"),
        }

        let history = state.delivery.history(UserId(1), UserId(2), None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender_id, UserId(1));
        assert!(history[0].delivered);
    }

    #[tokio::test]
    async fn piece_request_answers_with_base64_bytes() {
        let (state, _dir) = test_state().await;
        let rid = upload(&state, b"01234567").await;
        let mut owner = state.registry.connect(UserId(1)).await.unwrap();

        let request = Frame::PieceRequest(PieceRequest {
            resource_id: rid,
            piece_index: 0,
        });
        dispatch(&state, UserId(1), owner.id, request).await;

        let frames = drain(&state, &mut owner).await;
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::PieceResponse(response) => {
                assert_eq!(response.resource_id, rid);
                assert_eq!(response.piece_data, b"0123");
            }
            other => panic!("expected piece_response, got {other:?}"),
        }
        let text = frames[0].to_text().unwrap();
        assert!(text.contains(r#""type":"piece_response""#));
        assert!(text.contains(r#""piece_data":"MDEyMw==""#));
    }

    #[tokio::test]
    async fn errors_reach_only_the_requester() {
        let (state, _dir) = test_state().await;
        let rid = upload(&state, b"01234567").await;
        let mut owner = state.registry.connect(UserId(1)).await.unwrap();
        let mut stranger = state.registry.connect(UserId(2)).await.unwrap();

        // Same length, different bytes: the digest check must catch it.
        let resource = state.gate.require(UserId(1), rid).unwrap();
        let path = state.config.content_dir.join(&resource.stored_name);
        tokio::fs::write(&path, b"XXXXXXXX").await.unwrap();

        let request = Frame::PieceRequest(PieceRequest {
            resource_id: rid,
            piece_index: 1,
        });
        dispatch(&state, UserId(1), owner.id, request.clone()).await;

        assert_eq!(
            drain(&state, &mut owner).await,
            vec![Frame::error("not_found", "Piece not found")]
        );
        assert!(drain(&state, &mut stranger).await.is_empty());

        dispatch(&state, UserId(2), stranger.id, request).await;
        match drain(&state, &mut stranger).await.as_slice() {
            [Frame::Error(e)] => assert_eq!(e.code, "forbidden"),
            other => panic!("expected one error frame, got {other:?}"),
        }
        assert!(drain(&state, &mut owner).await.is_empty());
    }

    #[tokio::test]
    async fn announce_reaches_joined_sessions() {
        let (state, _dir) = test_state().await;
        let rid = upload(&state, b"01234567").await;
        let grant = state.gate.request(UserId(2), UserId(1), "guitar", "").unwrap();
        state.gate.respond(grant.id, UserId(1), true).unwrap();

        let mut owner = state.registry.connect(UserId(1)).await.unwrap();
        let mut learner = state.registry.connect(UserId(2)).await.unwrap();
        let mut bystander = state.registry.connect(UserId(3)).await.unwrap();

        // A status-less announce only joins.
        dispatch(&state, UserId(1), owner.id, announce(rid, None, None)).await;
        let frames = drain(&state, &mut owner).await;
        assert!(matches!(frames.as_slice(), [Frame::PeerList(_), Frame::SwarmUpdate(_)]));

        dispatch(
            &state,
            UserId(2),
            learner.id,
            announce(rid, Some(PeerStatus::Leeching), Some(25.0)),
        )
        .await;

        match drain(&state, &mut learner).await.as_slice() {
            [Frame::PeerList(list), Frame::SwarmUpdate(update)] => {
                assert_eq!(list.resource_id, rid);
                assert_eq!(list.peers.len(), 2);
                assert_eq!(update.swarm_stats.leechers, 1);
            }
            other => panic!("expected peer_list then swarm_update, got {other:?}"),
        }
        match drain(&state, &mut owner).await.as_slice() {
            [Frame::SwarmUpdate(update)] => {
                assert_eq!(update.swarm_stats.seeders, 1);
                assert_eq!(update.swarm_stats.leechers, 1);
            }
            other => panic!("expected one swarm_update, got {other:?}"),
        }
        assert!(drain(&state, &mut bystander).await.is_empty());
    }

    #[tokio::test]
    async fn peer_leave_stops_swarm_updates() {
        let (state, _dir) = test_state().await;
        let rid = upload(&state, b"01234567").await;
        let mut owner = state.registry.connect(UserId(1)).await.unwrap();

        dispatch(&state, UserId(1), owner.id, announce(rid, None, None)).await;
        drain(&state, &mut owner).await;

        let leave = Frame::PeerLeave(PeerLeave { resource_id: rid });
        dispatch(&state, UserId(1), owner.id, leave).await;

        state
            .announce(UserId(1), rid, Some((PeerStatus::Seeding, 100.0)), None)
            .await
            .unwrap();
        assert!(drain(&state, &mut owner).await.is_empty());
    }

    #[tokio::test]
    async fn rejected_announce_does_not_join() {
        let (state, _dir) = test_state().await;
        let rid = upload(&state, b"01234567").await;
        let mut owner = state.registry.connect(UserId(1)).await.unwrap();
        let mut stranger = state.registry.connect(UserId(2)).await.unwrap();

        dispatch(
            &state,
            UserId(1),
            owner.id,
            announce(rid, Some(PeerStatus::Leeching), Some(150.0)),
        )
        .await;
        match drain(&state, &mut owner).await.as_slice() {
            [Frame::Error(e)] => assert_eq!(e.code, "validation"),
            other => panic!("expected one error frame, got {other:?}"),
        }

        dispatch(&state, UserId(2), stranger.id, announce(rid, None, None)).await;
        match drain(&state, &mut stranger).await.as_slice() {
            [Frame::Error(e)] => assert_eq!(e.code, "forbidden"),
            other => panic!("expected one error frame, got {other:?}"),
        }

        // Neither session joined, so a later accepted announce reaches nobody.
        state
            .announce(UserId(1), rid, Some((PeerStatus::Seeding, 100.0)), None)
            .await
            .unwrap();
        assert!(drain(&state, &mut owner).await.is_empty());
        assert!(drain(&state, &mut stranger).await.is_empty());
    }
}

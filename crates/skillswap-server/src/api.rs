use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, Method},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use skillswap_shared::protocol::{PeerList, SwarmUpdate};
use skillswap_shared::{Frame, PeerInfo, PeerStatus, ResourceId, SwarmStats, UserId};
use skillswap_store::{
    AccessGrant, ChatMessage, ChatPayload, Database, GrantDirection, Resource, SkillConnection,
    SkillLink, SkillResource, StoreError,
};

use crate::access::{AccessGate, SkillCount};
use crate::config::ServerConfig;
use crate::db::{shared, with_db, SharedDb};
use crate::delivery::{MessageDelivery, PendingReplay};
use crate::error::ServerError;
use crate::piece_store::{PieceStore, Upload};
use crate::registry::{spawn_registry, RegistryConfig, RegistryCounters, RegistryHandle};
use crate::session::ws_handler;
use crate::tracker::{GlobalStats, SwarmTracker};

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDb,
    pub registry: RegistryHandle,
    pub delivery: MessageDelivery,
    pub pieces: PieceStore,
    pub tracker: SwarmTracker,
    pub gate: AccessGate,
    pub config: Arc<ServerConfig>,
}

/// What an announce hands back to the announcer.
#[derive(Debug, Serialize)]
pub struct AnnounceResult {
    pub peers: Vec<PeerInfo>,
    pub stats: SwarmStats,
}

impl AppState {
    /// Wire every component to one database and spawn the registry.
    pub async fn build(config: ServerConfig, db: Database) -> Result<Self, ServerError> {
        let db = shared(db);

        let registry = spawn_registry(
            RegistryConfig {
                queue_capacity: config.session_queue_capacity,
            },
            Some(Arc::new(PendingReplay::new(db.clone()))),
        );
        let pieces = PieceStore::new(
            config.content_dir.clone(),
            config.max_upload_size,
            config.piece_size,
            db.clone(),
        )
        .await?;

        Ok(Self {
            delivery: MessageDelivery::new(db.clone(), registry.clone()),
            tracker: SwarmTracker::new(db.clone(), config.swarm_stale_after),
            gate: AccessGate::new(db.clone()),
            pieces,
            registry,
            db,
            config: Arc::new(config),
        })
    }

    /// Gate, record and broadcast a peer announce.
    ///
    /// Without a `report` the peer only joins the swarm. With a `session`
    /// the peer's connection joins the resource and receives the peer list.
    pub async fn announce(
        &self,
        user_id: UserId,
        resource_id: ResourceId,
        report: Option<(PeerStatus, f64)>,
        session: Option<Uuid>,
    ) -> Result<AnnounceResult, ServerError> {
        self.gate.require(user_id, resource_id)?;

        let stats = match report {
            Some((status, progress)) => {
                self.tracker
                    .announce(user_id, resource_id, status, progress)?
            }
            None => self.tracker.stats(resource_id)?,
        };
        let peers = self.tracker.peers_of(resource_id)?;

        // Only an accepted announce joins the resource's broadcasts.
        if let Some(session_id) = session {
            self.registry.join(user_id, session_id, resource_id).await;
            self.registry
                .unicast(
                    user_id,
                    Frame::PeerList(PeerList {
                        resource_id,
                        peers: peers.clone(),
                    }),
                )
                .await;
        }

        self.registry
            .broadcast_to_resource(
                resource_id,
                Frame::SwarmUpdate(SwarmUpdate {
                    resource_id,
                    swarm_stats: stats.clone(),
                }),
            )
            .await;

        Ok(AnnounceResult { peers, stats })
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    // Multipart framing on top of the file itself.
    let body_limit = state.config.max_upload_size.saturating_add(1024 * 1024);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/resources", get(resource_list))
        .route("/resource", post(resource_upload))
        .route("/resource/:id", get(resource_info))
        .route("/resource/:id/piece/:index", get(piece_download))
        .route("/announce", post(announce))
        .route("/swarm/:id/stats", get(swarm_stats))
        .route("/swarm/:id/peers", get(swarm_peers))
        .route("/stats", get(global_stats))
        .route("/skill-resource", post(link_skill))
        .route("/skills", get(skill_summary))
        .route("/skills/:skill/resources", get(skill_resources))
        .route("/skill-connections", get(skill_connections))
        .route("/skill-connections/check", get(skill_connection_check))
        .route("/grants", post(grant_request).get(grant_list))
        .route("/grants/:id/respond", post(grant_respond))
        .route("/grants/:id/cancel", post(grant_cancel))
        .route("/messages", post(send_message))
        .route("/history", get(history))
        .route("/users/online", get(users_online))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    online_sessions: usize,
    #[serde(flatten)]
    registry: RegistryCounters,
}

async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ServerError> {
    let online_sessions = state.registry.online_users().await?.len();
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online_sessions,
        registry: state.registry.counters(),
    }))
}

// ─── Resources ───

async fn resource_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Resource>, ServerError> {
    let mut upload = Upload::default();
    let mut piece_size = None;
    let mut data = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::Validation(format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            upload.file_name = field.file_name().unwrap_or("upload").to_string();
            upload.mime_type = field.content_type().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ServerError::Validation(format!("Failed to read field: {}", e)))?;
            data = Some(bytes);
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ServerError::Validation(format!("Failed to read field: {}", e)))?;
        match name.as_str() {
            "owner_id" => upload.owner_id = UserId(parse_field(&name, &value)?),
            "title" => upload.title = value,
            "description" => upload.description = value,
            "skill_name" => upload.skill_name = Some(value),
            "piece_size" if !value.trim().is_empty() => {
                piece_size = Some(parse_field(&name, &value)?)
            }
            _ => {}
        }
    }

    let data = data.ok_or_else(|| {
        ServerError::Validation("Missing 'file' field in multipart form".to_string())
    })?;

    let resource = state.pieces.create(upload, &data, piece_size).await?;
    info!(resource_id = %resource.id, size = data.len(), "Resource uploaded via API");
    Ok(Json(resource))
}

#[derive(Deserialize)]
struct ResourceListQuery {
    user_id: i64,
    #[serde(default)]
    owner_id: Option<i64>,
}

async fn resource_list(
    State(state): State<AppState>,
    Query(query): Query<ResourceListQuery>,
) -> Result<Json<Vec<Resource>>, ServerError> {
    let resources = state
        .gate
        .catalog(UserId(query.user_id), query.owner_id.map(UserId))?;
    Ok(Json(resources))
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ServerError> {
    value
        .trim()
        .parse()
        .map_err(|_| ServerError::Validation(format!("Invalid {name}: {value}")))
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: i64,
}

async fn resource_info(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Resource>, ServerError> {
    let resource = state.gate.require(UserId(query.user_id), ResourceId(id))?;
    Ok(Json(resource))
}

async fn piece_download(
    State(state): State<AppState>,
    Path((id, index)): Path<(i64, u32)>,
    Query(query): Query<UserQuery>,
) -> Result<impl IntoResponse, ServerError> {
    let resource = state.gate.require(UserId(query.user_id), ResourceId(id))?;
    let data = state.pieces.read_piece(&resource, index).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data))
}

// ─── Swarm ───

#[derive(Deserialize)]
struct AnnounceRequest {
    user_id: i64,
    resource_id: i64,
    status: String,
    progress: f64,
}

async fn announce(
    State(state): State<AppState>,
    Json(req): Json<AnnounceRequest>,
) -> Result<Json<AnnounceResult>, ServerError> {
    let status: PeerStatus = req
        .status
        .parse()
        .map_err(|e: skillswap_shared::SharedError| ServerError::Validation(e.to_string()))?;

    let result = state
        .announce(
            UserId(req.user_id),
            ResourceId(req.resource_id),
            Some((status, req.progress)),
            None,
        )
        .await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct StatsQuery {
    #[serde(default)]
    active: bool,
}

async fn swarm_stats(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<SwarmStats>, ServerError> {
    let stats = if query.active {
        state.tracker.active_stats(ResourceId(id))?
    } else {
        state.tracker.stats(ResourceId(id))?
    };
    Ok(Json(stats))
}

async fn swarm_peers(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<PeerInfo>>, ServerError> {
    Ok(Json(state.tracker.peers_of(ResourceId(id))?))
}

async fn global_stats(State(state): State<AppState>) -> Result<Json<GlobalStats>, ServerError> {
    Ok(Json(state.tracker.global_stats()?))
}

// ─── Skills & grants ───

#[derive(Deserialize)]
struct LinkSkillRequest {
    owner_id: i64,
    skill_name: String,
    resource_id: i64,
    #[serde(default)]
    is_public: bool,
}

async fn link_skill(
    State(state): State<AppState>,
    Json(req): Json<LinkSkillRequest>,
) -> Result<Json<SkillLink>, ServerError> {
    let link = state.gate.link_skill(
        UserId(req.owner_id),
        &req.skill_name,
        ResourceId(req.resource_id),
        req.is_public,
    )?;
    Ok(Json(link))
}

async fn skill_summary(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<SkillCount>>, ServerError> {
    Ok(Json(state.gate.skill_counts(UserId(query.user_id))?))
}

async fn skill_resources(
    State(state): State<AppState>,
    Path(skill): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<SkillResource>>, ServerError> {
    Ok(Json(
        state.gate.skill_resources(&skill, UserId(query.user_id))?,
    ))
}

async fn skill_connections(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<SkillConnection>>, ServerError> {
    Ok(Json(state.gate.connections(UserId(query.user_id))?))
}

#[derive(Deserialize)]
struct ConnectionCheckQuery {
    user_id: i64,
    #[serde(default)]
    skill_name: String,
}

#[derive(Serialize)]
struct ConnectionCheck {
    has_connection: bool,
}

async fn skill_connection_check(
    State(state): State<AppState>,
    Query(query): Query<ConnectionCheckQuery>,
) -> Result<Json<ConnectionCheck>, ServerError> {
    let has_connection = state
        .gate
        .has_connection(UserId(query.user_id), &query.skill_name)?;
    Ok(Json(ConnectionCheck { has_connection }))
}

#[derive(Deserialize)]
struct GrantRequest {
    requester_id: i64,
    owner_id: i64,
    skill_name: String,
    #[serde(default)]
    message: String,
}

async fn grant_request(
    State(state): State<AppState>,
    Json(req): Json<GrantRequest>,
) -> Result<Json<AccessGrant>, ServerError> {
    let grant = state.gate.request(
        UserId(req.requester_id),
        UserId(req.owner_id),
        &req.skill_name,
        &req.message,
    )?;
    Ok(Json(grant))
}

#[derive(Deserialize)]
struct GrantListQuery {
    user_id: i64,
    #[serde(default)]
    direction: Option<String>,
}

async fn grant_list(
    State(state): State<AppState>,
    Query(query): Query<GrantListQuery>,
) -> Result<Json<Vec<AccessGrant>>, ServerError> {
    let direction = match query.direction.as_deref() {
        None | Some("received") => GrantDirection::Received,
        Some("sent") => GrantDirection::Sent,
        Some(other) => {
            return Err(ServerError::Validation(format!(
                "direction must be 'sent' or 'received', got '{other}'"
            )))
        }
    };
    Ok(Json(state.gate.list(UserId(query.user_id), direction)?))
}

#[derive(Deserialize)]
struct GrantRespondRequest {
    user_id: i64,
    approve: bool,
}

async fn grant_respond(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<GrantRespondRequest>,
) -> Result<Json<AccessGrant>, ServerError> {
    Ok(Json(state.gate.respond(id, UserId(req.user_id), req.approve)?))
}

async fn grant_cancel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UserQuery>,
) -> Result<Json<AccessGrant>, ServerError> {
    Ok(Json(state.gate.cancel(id, UserId(req.user_id))?))
}

// ─── Messages & presence ───

#[derive(Deserialize)]
struct SendMessageRequest {
    sender_id: i64,
    receiver_id: i64,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    file_id: Option<i64>,
}

async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<ChatMessage>, ServerError> {
    let payload = match (req.content, req.file_id) {
        (_, Some(file_id)) => ChatPayload::File(file_id),
        (Some(content), None) => ChatPayload::Text(content),
        (None, None) => {
            return Err(ServerError::Validation(
                "either content or file_id is required".into(),
            ))
        }
    };

    let message = state
        .delivery
        .send(UserId(req.sender_id), UserId(req.receiver_id), payload)
        .await?;
    Ok(Json(message))
}

#[derive(Deserialize)]
struct HistoryQuery {
    user1: i64,
    user2: i64,
    #[serde(default)]
    limit: Option<u32>,
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ChatMessage>>, ServerError> {
    let messages = state
        .delivery
        .history(UserId(query.user1), UserId(query.user2), query.limit)?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
struct OnlineQuery {
    #[serde(default)]
    ids: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Presence {
    user_id: UserId,
    #[serde(default)]
    display_name: Option<String>,
    online: bool,
}

fn display_name(db: &SharedDb, user_id: UserId) -> Result<Option<String>, ServerError> {
    with_db(db, |db| match db.get_user(user_id) {
        Ok(user) => Ok(user.display_name),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e),
    })
}

async fn users_online(
    State(state): State<AppState>,
    Query(query): Query<OnlineQuery>,
) -> Result<Json<Vec<Presence>>, ServerError> {
    let online: Vec<UserId> = state
        .registry
        .online_users()
        .await?
        .into_iter()
        .map(|info| info.user_id)
        .collect();

    let requested = match query.ids.as_deref().filter(|ids| !ids.trim().is_empty()) {
        Some(ids) => ids
            .split(',')
            .map(|raw| parse_field("ids", raw).map(UserId))
            .collect::<Result<Vec<_>, ServerError>>()?,
        None => online.clone(),
    };

    let presence = requested
        .into_iter()
        .map(|user_id| -> Result<Presence, ServerError> {
            Ok(Presence {
                user_id,
                display_name: display_name(&state.db, user_id)?,
                online: online.contains(&user_id),
            })
        })
        .collect::<Result<Vec<_>, ServerError>>()?;

    Ok(Json(presence))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

//! RPC dispatch: every method a client can call after the handshake.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use roomcast_agent_pool::{AgentTarget, ChatCall, Dispatcher, PoolError, build_context};
use roomcast_protocol::constants::{codes, events, methods, now_ts};
use roomcast_protocol::envelope::{Event, Request, Response};
use roomcast_protocol::joincode;
use roomcast_protocol::messages::{
    AgentAddRequest, AgentAddResponse, AgentRef, AgentRemoveRequest, AgentTypingEvent, InviteInfo,
    MemberInfo, Profile, ProfileUpdateRequest, ProfileUpdateResponse, RoomCreateRequest,
    RoomCreateResponse, RoomHistoryRequest, RoomHistoryResponse, RoomIdRequest, RoomInfoResponse,
    RoomJoinRequest, RoomJoinResponse, RoomListResponse, RoomMessage, RoomSendRequest,
    RoomSendResponse, RoomSummary,
};

use crate::connection::Sender;
use crate::handshake::SessionInfo;
use crate::rooms::RoomRegistry;
use crate::store::{
    AgentConfig, HISTORY_DEFAULT_LIMIT, HISTORY_MAX_LIMIT, Store, StoreError,
};

/// Shared state every RPC handler sees.
pub struct HubContext {
    pub store: Arc<dyn Store>,
    pub registry: Arc<RoomRegistry>,
    pub agents: Arc<dyn Dispatcher>,
    /// Host baked into portable join codes.
    pub public_host: String,
}

struct RpcError {
    code: String,
    message: String,
}

impl RpcError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, message)
    }
}

impl From<StoreError> for RpcError {
    fn from(e: StoreError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("malformed parameters: {e}"))
    }
}

/// Handles one request and queues the response on the connection.
pub async fn dispatch(
    ctx: Arc<HubContext>,
    session: Arc<SessionInfo>,
    conn_id: u64,
    req: Request,
    sender: Sender,
) {
    let response = match handle(&ctx, &session, conn_id, &req).await {
        Ok(res) => res,
        Err(e) => {
            debug!(method = %req.method, code = %e.code, "rpc failed: {}", e.message);
            req.reply_error(e.code, e.message)
        }
    };
    sender.respond(response);
}

async fn handle(
    ctx: &Arc<HubContext>,
    session: &SessionInfo,
    conn_id: u64,
    req: &Request,
) -> Result<Response, RpcError> {
    match req.method.as_str() {
        methods::ROOM_LIST => room_list(ctx, session, req).await,
        methods::ROOM_CREATE => room_create(ctx, session, req).await,
        methods::ROOM_JOIN => room_join(ctx, session, req).await,
        methods::ROOM_LEAVE => room_leave(ctx, session, req).await,
        methods::ROOM_INFO => room_info(ctx, session, req).await,
        methods::ROOM_HISTORY => room_history(ctx, session, req).await,
        methods::ROOM_SEND => room_send(ctx, session, conn_id, req).await,
        methods::ROOM_AGENT_ADD => room_agent_add(ctx, session, req).await,
        methods::ROOM_AGENT_REMOVE => room_agent_remove(ctx, session, req).await,
        methods::INVITE_CREATE => invite_create(ctx, session, req).await,
        methods::PROFILE_UPDATE => profile_update(ctx, session, req).await,
        methods::CONNECT => Err(RpcError::new(
            codes::FORBIDDEN,
            "connection is already authenticated",
        )),
        other => Err(RpcError::new(
            codes::UNKNOWN_METHOD,
            format!("unknown method {other:?}"),
        )),
    }
}

/// The room must exist and the caller must be a member.
fn require_member(ctx: &HubContext, room_id: &str, user_id: &str) -> Result<(), RpcError> {
    ctx.store.room(room_id)?;
    if !ctx.store.is_member(room_id, user_id)? {
        return Err(RpcError::new(codes::FORBIDDEN, "not a room member"));
    }
    Ok(())
}

/// Display name: the saved profile wins over the handshake value.
fn display_name_for(ctx: &HubContext, session: &SessionInfo) -> Result<String, RpcError> {
    Ok(ctx
        .store
        .profile(&session.user_id)?
        .map(|p| p.display_name)
        .unwrap_or_else(|| session.display_name.clone()))
}

/// Fallback name for members who never sent a profile or handshake.
fn short_name(user_id: &str) -> String {
    user_id.chars().take(8).collect()
}

fn mint_invite(ctx: &HubContext, room_id: &str) -> Result<InviteInfo, RpcError> {
    let code = joincode::generate_invite_code();
    ctx.store.save_invite(&code, room_id)?;
    let join_code = joincode::encode(&ctx.public_host, &code)
        .map_err(|e| RpcError::internal(format!("failed to encode join code: {e}")))?;
    Ok(InviteInfo { code, join_code })
}

fn reply<T: serde::Serialize>(req: &Request, payload: &T) -> Result<Response, RpcError> {
    req.reply(Some(payload))
        .map_err(|e| RpcError::internal(format!("failed to serialize response: {e}")))
}

async fn room_list(
    ctx: &Arc<HubContext>,
    session: &SessionInfo,
    req: &Request,
) -> Result<Response, RpcError> {
    let rooms = ctx.store.rooms_for_user(&session.user_id)?;
    reply(req, &RoomListResponse { rooms })
}

async fn room_create(
    ctx: &Arc<HubContext>,
    session: &SessionInfo,
    req: &Request,
) -> Result<Response, RpcError> {
    let params: RoomCreateRequest = req.parse_params()?;
    if params.name.trim().is_empty() {
        return Err(RpcError::new(codes::INVALID_PARAMS, "room name is empty"));
    }

    let room = RoomSummary {
        id: Uuid::new_v4().to_string(),
        name: params.name,
        topic: params.topic,
        owner: session.user_id.clone(),
        created_at: now_ts(),
    };
    ctx.store.create_room(room.clone())?;
    ctx.store.add_member(&room.id, &session.user_id)?;
    ctx.registry.subscribe_user(&session.user_id, &room.id).await;

    let invite = mint_invite(ctx, &room.id)?;
    reply(req, &RoomCreateResponse { room, invite })
}

async fn room_join(
    ctx: &Arc<HubContext>,
    session: &SessionInfo,
    req: &Request,
) -> Result<Response, RpcError> {
    let params: RoomJoinRequest = req.parse_params()?;

    // Accept the portable join-code form as well as a bare invite code.
    let invite = match joincode::decode(&params.code) {
        Ok((_host, invite)) => invite,
        Err(_) => params.code.clone(),
    };

    let room_id = ctx.store.invite(&invite)?;
    let room = ctx.store.room(&room_id)?;
    ctx.store.add_member(&room_id, &session.user_id)?;
    ctx.registry.subscribe_user(&session.user_id, &room_id).await;
    reply(req, &RoomJoinResponse { room })
}

async fn room_leave(
    ctx: &Arc<HubContext>,
    session: &SessionInfo,
    req: &Request,
) -> Result<Response, RpcError> {
    let params: RoomIdRequest = req.parse_params()?;
    require_member(ctx, &params.room_id, &session.user_id)?;
    ctx.store.remove_member(&params.room_id, &session.user_id)?;
    ctx.registry
        .unsubscribe_user(&session.user_id, &params.room_id)
        .await;
    req.reply::<()>(None)
        .map_err(|e| RpcError::internal(e.to_string()))
}

async fn room_info(
    ctx: &Arc<HubContext>,
    session: &SessionInfo,
    req: &Request,
) -> Result<Response, RpcError> {
    let params: RoomIdRequest = req.parse_params()?;
    let room = ctx.store.room(&params.room_id)?;
    require_member(ctx, &params.room_id, &session.user_id)?;

    let mut members = Vec::new();
    for user_id in ctx.store.members(&params.room_id)? {
        let display_name = ctx
            .store
            .profile(&user_id)?
            .map(|p| p.display_name)
            .unwrap_or_else(|| short_name(&user_id));
        let online = ctx.registry.is_user_online(&user_id).await;
        members.push(MemberInfo {
            user_id,
            display_name,
            online,
        });
    }

    let agents = ctx
        .store
        .agents(&params.room_id)?
        .into_iter()
        .map(|a| AgentRef {
            id: a.id,
            name: a.name,
        })
        .collect();

    reply(
        req,
        &RoomInfoResponse {
            room,
            members,
            agents,
        },
    )
}

async fn room_history(
    ctx: &Arc<HubContext>,
    session: &SessionInfo,
    req: &Request,
) -> Result<Response, RpcError> {
    let params: RoomHistoryRequest = req.parse_params()?;
    require_member(ctx, &params.room_id, &session.user_id)?;

    let limit = params
        .limit
        .unwrap_or(HISTORY_DEFAULT_LIMIT)
        .min(HISTORY_MAX_LIMIT);
    let messages = ctx
        .store
        .history(&params.room_id, params.before.as_deref(), limit)?;
    reply(req, &RoomHistoryResponse { messages })
}

async fn room_send(
    ctx: &Arc<HubContext>,
    session: &SessionInfo,
    conn_id: u64,
    req: &Request,
) -> Result<Response, RpcError> {
    let params: RoomSendRequest = req.parse_params()?;
    if params.body.trim().is_empty() {
        return Err(RpcError::new(codes::INVALID_PARAMS, "message body is empty"));
    }
    require_member(ctx, &params.room_id, &session.user_id)?;

    let message = RoomMessage {
        id: Uuid::new_v4().to_string(),
        room_id: params.room_id.clone(),
        sender: session.user_id.clone(),
        sender_name: display_name_for(ctx, session)?,
        sender_kind: "user".into(),
        body: params.body,
        ts: now_ts(),
    };
    let stored = ctx
        .store
        .append_message(message.clone(), params.idempotency_key.as_deref())?;

    // A deduplicated resend returns the stored message without a second
    // broadcast or agent relay.
    if stored.id == message.id {
        let ev = Event::new(events::ROOM_MESSAGE, Some(&stored))
            .map_err(|e| RpcError::internal(e.to_string()))?;
        ctx.registry
            .broadcast(&params.room_id, &ev, Some(conn_id))
            .await;
        spawn_agent_relay(ctx.clone(), stored.clone());
    }

    reply(req, &RoomSendResponse { message: stored })
}

async fn room_agent_add(
    ctx: &Arc<HubContext>,
    session: &SessionInfo,
    req: &Request,
) -> Result<Response, RpcError> {
    let params: AgentAddRequest = req.parse_params()?;
    require_member(ctx, &params.room_id, &session.user_id)?;
    if params.name.trim().is_empty() || params.name.contains(char::is_whitespace) {
        return Err(RpcError::new(
            codes::INVALID_PARAMS,
            "agent name must be non-empty without whitespace",
        ));
    }
    if params.address.trim().is_empty() {
        return Err(RpcError::new(codes::INVALID_PARAMS, "agent address is empty"));
    }

    let agent = AgentConfig {
        id: Uuid::new_v4().to_string(),
        name: params.name,
        address: params.address,
        credential: params.credential,
    };
    ctx.store.add_agent(&params.room_id, agent.clone())?;
    reply(
        req,
        &AgentAddResponse {
            agent: AgentRef {
                id: agent.id,
                name: agent.name,
            },
        },
    )
}

async fn room_agent_remove(
    ctx: &Arc<HubContext>,
    session: &SessionInfo,
    req: &Request,
) -> Result<Response, RpcError> {
    let params: AgentRemoveRequest = req.parse_params()?;
    require_member(ctx, &params.room_id, &session.user_id)?;
    ctx.store.remove_agent(&params.room_id, &params.agent_id)?;
    req.reply::<()>(None)
        .map_err(|e| RpcError::internal(e.to_string()))
}

async fn invite_create(
    ctx: &Arc<HubContext>,
    session: &SessionInfo,
    req: &Request,
) -> Result<Response, RpcError> {
    let params: RoomIdRequest = req.parse_params()?;
    require_member(ctx, &params.room_id, &session.user_id)?;
    let invite = mint_invite(ctx, &params.room_id)?;
    reply(req, &invite)
}

async fn profile_update(
    ctx: &Arc<HubContext>,
    session: &SessionInfo,
    req: &Request,
) -> Result<Response, RpcError> {
    let params: ProfileUpdateRequest = req.parse_params()?;

    let mut profile = ctx
        .store
        .profile(&session.user_id)?
        .unwrap_or_else(|| Profile {
            user_id: session.user_id.clone(),
            display_name: session.display_name.clone(),
            status: String::new(),
        });

    if let Some(display_name) = params.display_name {
        if display_name.trim().is_empty() {
            return Err(RpcError::new(codes::INVALID_PARAMS, "display name is empty"));
        }
        profile.display_name = display_name;
    }
    if let Some(status) = params.status {
        profile.status = status;
    }

    ctx.store.save_profile(profile.clone())?;
    reply(req, &ProfileUpdateResponse { profile })
}

// ---------------------------------------------------------------------------
// Agent relay
// ---------------------------------------------------------------------------

/// Agents in the room whose `@name` appears in the message body.
fn find_mentions(body: &str, agents: &[AgentConfig]) -> Vec<AgentConfig> {
    agents
        .iter()
        .filter(|a| body.contains(&format!("@{}", a.name)))
        .cloned()
        .collect()
}

/// Relays a freshly stored user message to every mentioned agent, one
/// task per agent so a slow service never delays the others.
fn spawn_agent_relay(ctx: Arc<HubContext>, message: RoomMessage) {
    let agents = match ctx.store.agents(&message.room_id) {
        Ok(agents) => agents,
        Err(e) => {
            warn!(room = %message.room_id, "failed to load agents: {e}");
            return;
        }
    };
    for agent in find_mentions(&message.body, &agents) {
        let ctx = ctx.clone();
        let message = message.clone();
        tokio::spawn(async move {
            relay_to_agent(ctx, message, agent).await;
        });
    }
}

async fn relay_to_agent(ctx: Arc<HubContext>, message: RoomMessage, agent: AgentConfig) {
    let typing = AgentTypingEvent {
        room_id: message.room_id.clone(),
        agent_id: agent.id.clone(),
        agent_name: agent.name.clone(),
    };
    match Event::new(events::AGENT_TYPING, Some(&typing)) {
        Ok(ev) => ctx.registry.broadcast(&message.room_id, &ev, None).await,
        Err(e) => warn!("failed to build typing event: {e}"),
    }

    let context = match ctx
        .store
        .history(&message.room_id, None, HISTORY_DEFAULT_LIMIT)
    {
        Ok(history) => build_context(&history),
        Err(e) => {
            warn!(room = %message.room_id, "failed to load history for context: {e}");
            String::new()
        }
    };

    let call = ChatCall {
        room_id: message.room_id.clone(),
        target: AgentTarget {
            id: agent.id.clone(),
            name: agent.name.clone(),
            address: agent.address.clone(),
            credential: agent.credential.clone(),
        },
        context,
        prompt: message.body.clone(),
    };

    let body = match ctx.agents.chat(call).await {
        Ok(text) => text,
        // Another completion for this (room, agent) is still running;
        // the mention is intentionally dropped.
        Err(PoolError::InFlight) => {
            debug!(agent = %agent.name, room = %message.room_id, "agent already replying");
            return;
        }
        // Failures surface in the room instead of vanishing into logs.
        Err(e) => {
            warn!(agent = %agent.name, room = %message.room_id, "agent call failed: {e}");
            format!("({} could not reply: {e})", agent.name)
        }
    };

    let reply = RoomMessage {
        id: Uuid::new_v4().to_string(),
        room_id: message.room_id.clone(),
        sender: agent.id.clone(),
        sender_name: agent.name.clone(),
        sender_kind: "agent".into(),
        body,
        ts: now_ts(),
    };
    match ctx.store.append_message(reply, None) {
        Ok(stored) => match Event::new(events::ROOM_MESSAGE, Some(&stored)) {
            Ok(ev) => ctx.registry.broadcast(&message.room_id, &ev, None).await,
            Err(e) => warn!("failed to build message event: {e}"),
        },
        Err(e) => warn!(room = %message.room_id, "failed to store agent reply: {e}"),
    }
}

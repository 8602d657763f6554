//! HTTP surface: a read-only invite preview.
//!
//! `GET /invite/:code` lets a landing page show what a join code leads
//! to before the person installs a client. It never redeems the invite.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use roomcast_protocol::joincode;

use crate::rpc::HubContext;
use crate::store::Store;

/// Public view of what an invite leads to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitePreview {
    pub room_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    pub members: usize,
}

/// Resolves an invite or join code to its room preview.
pub fn invite_preview(store: &dyn Store, code: &str) -> Option<InvitePreview> {
    let invite = match joincode::decode(code) {
        Ok((_host, invite)) => invite,
        Err(_) => code.to_string(),
    };
    let room_id = store.invite(&invite).ok()?;
    let room = store.room(&room_id).ok()?;
    let members = store.members(&room_id).map(|m| m.len()).unwrap_or(0);
    Some(InvitePreview {
        room_name: room.name,
        topic: room.topic,
        members,
    })
}

async fn invite_handler(
    State(ctx): State<Arc<HubContext>>,
    Path(code): Path<String>,
) -> Result<Json<InvitePreview>, StatusCode> {
    invite_preview(ctx.store.as_ref(), &code)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Builds the HTTP router.
pub fn router(ctx: Arc<HubContext>) -> Router {
    Router::new()
        .route("/invite/:code", get(invite_handler))
        .with_state(ctx)
}

/// Serves the router until cancellation.
pub async fn serve(
    listener: tokio::net::TcpListener,
    ctx: Arc<HubContext>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!("http listener on {}", listener.local_addr()?);
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_protocol::messages::RoomSummary;

    use crate::store::MemoryStore;

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_room(RoomSummary {
                id: "r1".into(),
                name: "general".into(),
                topic: "daily chatter".into(),
                owner: "alice".into(),
                created_at: "2026-01-01T00:00:00.000Z".into(),
            })
            .unwrap();
        store.add_member("r1", "alice").unwrap();
        store.add_member("r1", "bob").unwrap();
        store.save_invite("W7Q2M4KX", "r1").unwrap();
        store
    }

    #[test]
    fn preview_resolves_bare_invite() {
        let store = seeded_store();
        let preview = invite_preview(&store, "W7Q2M4KX").unwrap();
        assert_eq!(preview.room_name, "general");
        assert_eq!(preview.topic, "daily chatter");
        assert_eq!(preview.members, 2);
    }

    #[test]
    fn preview_resolves_join_code() {
        let store = seeded_store();
        let code = joincode::encode("hub.test:9470", "W7Q2M4KX").unwrap();
        let preview = invite_preview(&store, &code).unwrap();
        assert_eq!(preview.room_name, "general");
    }

    #[test]
    fn preview_of_unknown_code_is_none() {
        let store = seeded_store();
        assert!(invite_preview(&store, "NOPE0000").is_none());
    }
}

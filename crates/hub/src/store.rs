//! Room, message, invite and profile storage.
//!
//! The trait is synchronous: every method is a short map operation, and
//! keeping it sync lets RPC handlers call it without holding an async
//! lock across awaits.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use roomcast_protocol::constants::codes;
use roomcast_protocol::messages::{Profile, RoomMessage, RoomSummary};

/// Default page size for history queries.
pub const HISTORY_DEFAULT_LIMIT: usize = 50;

/// Hard cap on one history page.
pub const HISTORY_MAX_LIMIT: usize = 200;

/// Full agent participant record, including the credential that never
/// leaves the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub address: String,
    pub credential: String,
}

/// Storage errors, carrying their wire error code.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// The structured wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => codes::NOT_FOUND,
            StoreError::Backend(_) => codes::DB_ERROR,
        }
    }
}

/// Persistence seam for the hub.
pub trait Store: Send + Sync + 'static {
    fn create_room(&self, room: RoomSummary) -> Result<(), StoreError>;
    fn room(&self, room_id: &str) -> Result<RoomSummary, StoreError>;
    /// Rooms the user is a member of, oldest first.
    fn rooms_for_user(&self, user_id: &str) -> Result<Vec<RoomSummary>, StoreError>;

    fn add_member(&self, room_id: &str, user_id: &str) -> Result<(), StoreError>;
    fn remove_member(&self, room_id: &str, user_id: &str) -> Result<(), StoreError>;
    fn members(&self, room_id: &str) -> Result<Vec<String>, StoreError>;
    fn is_member(&self, room_id: &str, user_id: &str) -> Result<bool, StoreError>;

    /// Appends a message. If `idempotency_key` was already used in this
    /// room the previously stored message is returned instead and
    /// nothing is written.
    fn append_message(
        &self,
        message: RoomMessage,
        idempotency_key: Option<&str>,
    ) -> Result<RoomMessage, StoreError>;

    /// The most recent `limit` messages strictly before the `before`
    /// timestamp cursor (or the newest messages if `None`), oldest first.
    fn history(
        &self,
        room_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RoomMessage>, StoreError>;

    fn save_invite(&self, code: &str, room_id: &str) -> Result<(), StoreError>;
    /// Resolves an invite code to its room id.
    fn invite(&self, code: &str) -> Result<String, StoreError>;

    fn add_agent(&self, room_id: &str, agent: AgentConfig) -> Result<(), StoreError>;
    fn remove_agent(&self, room_id: &str, agent_id: &str) -> Result<(), StoreError>;
    fn agents(&self, room_id: &str) -> Result<Vec<AgentConfig>, StoreError>;

    fn profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError>;
    fn save_profile(&self, profile: Profile) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, RoomSummary>,
    /// room id -> member user ids
    members: HashMap<String, HashSet<String>>,
    /// room id -> ordered messages
    messages: HashMap<String, Vec<RoomMessage>>,
    /// (room id, idempotency key) -> message id
    idempotency: HashMap<(String, String), String>,
    /// invite code -> room id
    invites: HashMap<String, String>,
    agents: HashMap<String, Vec<AgentConfig>>,
    profiles: HashMap<String, Profile>,
}

/// In-memory store. Room state is lost on restart; device tokens are
/// persisted separately and survive.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))
    }
}

impl Store for MemoryStore {
    fn create_room(&self, room: RoomSummary) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner.members.entry(room.id.clone()).or_default();
        inner.messages.entry(room.id.clone()).or_default();
        inner.rooms.insert(room.id.clone(), room);
        Ok(())
    }

    fn room(&self, room_id: &str) -> Result<RoomSummary, StoreError> {
        self.read()?
            .rooms
            .get(room_id)
            .cloned()
            .ok_or(StoreError::NotFound("room"))
    }

    fn rooms_for_user(&self, user_id: &str) -> Result<Vec<RoomSummary>, StoreError> {
        let inner = self.read()?;
        let mut rooms: Vec<RoomSummary> = inner
            .rooms
            .values()
            .filter(|r| {
                inner
                    .members
                    .get(&r.id)
                    .is_some_and(|m| m.contains(user_id))
            })
            .cloned()
            .collect();
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rooms)
    }

    fn add_member(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if !inner.rooms.contains_key(room_id) {
            return Err(StoreError::NotFound("room"));
        }
        inner
            .members
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        Ok(())
    }

    fn remove_member(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        match inner.members.get_mut(room_id) {
            Some(set) => {
                set.remove(user_id);
                Ok(())
            }
            None => Err(StoreError::NotFound("room")),
        }
    }

    fn members(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.read()?;
        let set = inner
            .members
            .get(room_id)
            .ok_or(StoreError::NotFound("room"))?;
        let mut members: Vec<String> = set.iter().cloned().collect();
        members.sort();
        Ok(members)
    }

    fn is_member(&self, room_id: &str, user_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .read()?
            .members
            .get(room_id)
            .is_some_and(|m| m.contains(user_id)))
    }

    fn append_message(
        &self,
        message: RoomMessage,
        idempotency_key: Option<&str>,
    ) -> Result<RoomMessage, StoreError> {
        let mut inner = self.write()?;
        if !inner.rooms.contains_key(&message.room_id) {
            return Err(StoreError::NotFound("room"));
        }

        if let Some(key) = idempotency_key {
            let dedupe_key = (message.room_id.clone(), key.to_string());
            if let Some(existing_id) = inner.idempotency.get(&dedupe_key) {
                let existing = inner
                    .messages
                    .get(&message.room_id)
                    .and_then(|msgs| msgs.iter().find(|m| &m.id == existing_id))
                    .cloned()
                    .ok_or(StoreError::NotFound("message"))?;
                return Ok(existing);
            }
            inner.idempotency.insert(dedupe_key, message.id.clone());
        }

        inner
            .messages
            .entry(message.room_id.clone())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    fn history(
        &self,
        room_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RoomMessage>, StoreError> {
        let inner = self.read()?;
        let msgs = inner
            .messages
            .get(room_id)
            .ok_or(StoreError::NotFound("room"))?;

        // Wire timestamps are fixed-width RFC 3339 UTC, so the string
        // order is the time order.
        let filtered: Vec<&RoomMessage> = match before {
            Some(cursor) => msgs.iter().filter(|m| m.ts.as_str() < cursor).collect(),
            None => msgs.iter().collect(),
        };
        let start = filtered.len().saturating_sub(limit);
        Ok(filtered[start..].iter().map(|m| (*m).clone()).collect())
    }

    fn save_invite(&self, code: &str, room_id: &str) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if !inner.rooms.contains_key(room_id) {
            return Err(StoreError::NotFound("room"));
        }
        inner.invites.insert(code.to_string(), room_id.to_string());
        Ok(())
    }

    fn invite(&self, code: &str) -> Result<String, StoreError> {
        self.read()?
            .invites
            .get(code)
            .cloned()
            .ok_or(StoreError::NotFound("invite"))
    }

    fn add_agent(&self, room_id: &str, agent: AgentConfig) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if !inner.rooms.contains_key(room_id) {
            return Err(StoreError::NotFound("room"));
        }
        inner.agents.entry(room_id.to_string()).or_default().push(agent);
        Ok(())
    }

    fn remove_agent(&self, room_id: &str, agent_id: &str) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let agents = inner
            .agents
            .get_mut(room_id)
            .ok_or(StoreError::NotFound("agent"))?;
        let before = agents.len();
        agents.retain(|a| a.id != agent_id);
        if agents.len() == before {
            return Err(StoreError::NotFound("agent"));
        }
        Ok(())
    }

    fn agents(&self, room_id: &str) -> Result<Vec<AgentConfig>, StoreError> {
        Ok(self.read()?.agents.get(room_id).cloned().unwrap_or_default())
    }

    fn profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError> {
        Ok(self.read()?.profiles.get(user_id).cloned())
    }

    fn save_profile(&self, profile: Profile) -> Result<(), StoreError> {
        self.write()?
            .profiles
            .insert(profile.user_id.clone(), profile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str, created_at: &str) -> RoomSummary {
        RoomSummary {
            id: id.into(),
            name: format!("room {id}"),
            topic: String::new(),
            owner: "owner".into(),
            created_at: created_at.into(),
        }
    }

    fn msg(room_id: &str, id: &str, ts: &str) -> RoomMessage {
        RoomMessage {
            id: id.into(),
            room_id: room_id.into(),
            sender: "d1".into(),
            sender_name: "Alice".into(),
            sender_kind: "user".into(),
            body: format!("message {id}"),
            ts: ts.into(),
        }
    }

    #[test]
    fn rooms_for_user_honors_membership_and_order() {
        let store = MemoryStore::new();
        store.create_room(room("r2", "2026-01-02T00:00:00.000Z")).unwrap();
        store.create_room(room("r1", "2026-01-01T00:00:00.000Z")).unwrap();
        store.create_room(room("r3", "2026-01-03T00:00:00.000Z")).unwrap();
        store.add_member("r1", "alice").unwrap();
        store.add_member("r2", "alice").unwrap();
        store.add_member("r3", "bob").unwrap();

        let rooms = store.rooms_for_user("alice").unwrap();
        let ids: Vec<&str> = rooms.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r1", "r2"]);
        assert!(store.rooms_for_user("nobody").unwrap().is_empty());
    }

    #[test]
    fn membership_add_remove() {
        let store = MemoryStore::new();
        store.create_room(room("r1", "t")).unwrap();
        assert!(!store.is_member("r1", "alice").unwrap());

        store.add_member("r1", "alice").unwrap();
        assert!(store.is_member("r1", "alice").unwrap());
        assert_eq!(store.members("r1").unwrap(), ["alice"]);

        store.remove_member("r1", "alice").unwrap();
        assert!(!store.is_member("r1", "alice").unwrap());

        assert!(matches!(
            store.add_member("missing", "alice"),
            Err(StoreError::NotFound("room"))
        ));
    }

    #[test]
    fn append_is_idempotent_per_key() {
        let store = MemoryStore::new();
        store.create_room(room("r1", "t")).unwrap();

        let first = store
            .append_message(msg("r1", "m1", "2026-01-01T00:00:01.000Z"), Some("k1"))
            .unwrap();
        let replay = store
            .append_message(msg("r1", "m2", "2026-01-01T00:00:02.000Z"), Some("k1"))
            .unwrap();

        assert_eq!(replay.id, first.id, "replay must return the stored message");
        assert_eq!(store.history("r1", None, 10).unwrap().len(), 1);

        // A different key appends normally.
        store
            .append_message(msg("r1", "m3", "2026-01-01T00:00:03.000Z"), Some("k2"))
            .unwrap();
        assert_eq!(store.history("r1", None, 10).unwrap().len(), 2);
    }

    #[test]
    fn history_pages_backwards_with_cursor() {
        let store = MemoryStore::new();
        store.create_room(room("r1", "t")).unwrap();
        for i in 0..5 {
            store
                .append_message(
                    msg("r1", &format!("m{i}"), &format!("2026-01-01T00:00:0{i}.000Z")),
                    None,
                )
                .unwrap();
        }

        let newest = store.history("r1", None, 2).unwrap();
        let ids: Vec<&str> = newest.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m3", "m4"], "newest page, oldest first");

        let older = store
            .history("r1", Some("2026-01-01T00:00:03.000Z"), 2)
            .unwrap();
        let ids: Vec<&str> = older.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2"], "cursor is exclusive");

        assert!(store
            .history("r1", Some("2026-01-01T00:00:00.000Z"), 2)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn invites_resolve_to_rooms() {
        let store = MemoryStore::new();
        store.create_room(room("r1", "t")).unwrap();
        store.save_invite("W7Q2M4KX", "r1").unwrap();

        assert_eq!(store.invite("W7Q2M4KX").unwrap(), "r1");
        assert!(matches!(
            store.invite("NOPE1234"),
            Err(StoreError::NotFound("invite"))
        ));
        assert!(matches!(
            store.save_invite("X", "missing"),
            Err(StoreError::NotFound("room"))
        ));
    }

    #[test]
    fn agents_add_list_remove() {
        let store = MemoryStore::new();
        store.create_room(room("r1", "t")).unwrap();
        let agent = AgentConfig {
            id: "a1".into(),
            name: "helper".into(),
            address: "ws://agents.test/ws".into(),
            credential: "cred".into(),
        };
        store.add_agent("r1", agent.clone()).unwrap();
        assert_eq!(store.agents("r1").unwrap(), [agent]);

        store.remove_agent("r1", "a1").unwrap();
        assert!(store.agents("r1").unwrap().is_empty());
        assert!(matches!(
            store.remove_agent("r1", "a1"),
            Err(StoreError::NotFound("agent"))
        ));
    }

    #[test]
    fn profiles_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.profile("d1").unwrap().is_none());

        let profile = Profile {
            user_id: "d1".into(),
            display_name: "Alice".into(),
            status: "away".into(),
        };
        store.save_profile(profile.clone()).unwrap();
        assert_eq!(store.profile("d1").unwrap(), Some(profile));
    }

    #[test]
    fn store_error_codes() {
        assert_eq!(StoreError::NotFound("room").code(), "not_found");
        assert_eq!(StoreError::Backend("x".into()).code(), "db_error");
    }
}

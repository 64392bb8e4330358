//! Room-based chat relay backed by the persisted message log.
//!
//! A room is identified by the sorted pair of its participants. Every
//! connection owns an unbounded channel; the socket layer drains it and
//! emits `receive_message`. Broadcast reaches all members of the room,
//! the sender's own connections included.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use proxima_shared::errors::{AppError, ErrorCode};

use crate::models::{Message, NewMessage, UserPair};
use crate::store::{run_blocking, MessageStore, UserStore};

pub type ConnectionId = String;

// --- Room ids ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomId(UserPair);

const UUID_LEN: usize = 36;

impl RoomId {
    pub fn for_pair(a: Uuid, b: Uuid) -> Result<Self, AppError> {
        if a == b {
            return Err(AppError::new(ErrorCode::InvalidMessage, "a room needs two distinct participants"));
        }
        Ok(Self(UserPair::new(a, b)))
    }

    /// Accepts only the canonical form `{low}-{high}` with lowercase
    /// hyphenated ids in ascending order.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let invalid = || AppError::new(ErrorCode::ValidationError, format!("invalid room id: {raw}"));

        if !raw.is_ascii() || raw.len() != 2 * UUID_LEN + 1 || raw.as_bytes()[UUID_LEN] != b'-' {
            return Err(invalid());
        }
        let (first, second) = (&raw[..UUID_LEN], &raw[UUID_LEN + 1..]);
        let a = Uuid::parse_str(first).map_err(|_| invalid())?;
        let b = Uuid::parse_str(second).map_err(|_| invalid())?;

        let room = Self::for_pair(a, b).map_err(|_| invalid())?;
        if room.to_string() != raw {
            return Err(invalid());
        }
        Ok(room)
    }

    pub fn contains(&self, user: Uuid) -> bool {
        self.0.contains(user)
    }

    pub fn participants(&self) -> (Uuid, Uuid) {
        (self.0.low(), self.0.high())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.0.low(), self.0.high())
    }
}

// --- Registry ---

struct Connection {
    user: Option<Uuid>,
    outbox: mpsc::UnboundedSender<Message>,
    rooms: HashSet<RoomId>,
}

/// Room membership: room -> connections and connection -> rooms. The two
/// maps are never locked in the order rooms -> connections.
#[derive(Default)]
pub struct RoomRegistry {
    connections: DashMap<ConnectionId, Connection>,
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
}

impl RoomRegistry {
    pub fn connect(&self, id: ConnectionId, user: Option<Uuid>) -> mpsc::UnboundedReceiver<Message> {
        let (outbox, inbox) = mpsc::unbounded_channel();
        if let Some(previous) = self.connections.insert(id.clone(), Connection { user, outbox, rooms: HashSet::new() }) {
            self.leave_all(&id, previous.rooms);
        }
        inbox
    }

    /// Returns false when the connection is unknown.
    pub fn join(&self, id: &str, room: RoomId) -> bool {
        let Some(mut connection) = self.connections.get_mut(id) else {
            return false;
        };
        if connection.rooms.insert(room) {
            self.rooms.entry(room).or_default().insert(id.to_owned());
        }
        true
    }

    pub fn user_of(&self, id: &str) -> Option<Uuid> {
        self.connections.get(id).and_then(|c| c.user)
    }

    pub fn disconnect(&self, id: &str) {
        if let Some((_, connection)) = self.connections.remove(id) {
            self.leave_all(id, connection.rooms);
        }
    }

    fn leave_all(&self, id: &str, rooms: HashSet<RoomId>) {
        for room in rooms {
            if let Some(mut members) = self.rooms.get_mut(&room) {
                members.remove(id);
            }
            self.rooms.remove_if(&room, |_, members| members.is_empty());
        }
    }

    pub fn members(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Queues `message` for every connection in `room`. Returns how many
    /// connections it was queued for.
    pub fn broadcast(&self, room: &RoomId, message: &Message) -> usize {
        self.members(room)
            .iter()
            .filter_map(|id| self.connections.get(id.as_str()))
            .filter(|c| c.outbox.send(message.clone()).is_ok())
            .count()
    }
}

// --- Channel ---

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    /// Room the client believes it is talking in, if it sent one.
    pub room: Option<String>,
}

pub struct MessagingChannel {
    messages: Arc<dyn MessageStore>,
    users: Arc<dyn UserStore>,
    registry: Arc<RoomRegistry>,
    room_locks: Arc<DashMap<RoomId, Arc<Mutex<()>>>>,
    max_message_len: usize,
}

impl MessagingChannel {
    pub fn new(messages: Arc<dyn MessageStore>, users: Arc<dyn UserStore>, max_message_len: usize) -> Self {
        Self {
            messages,
            users,
            registry: Arc::new(RoomRegistry::default()),
            room_locks: Arc::new(DashMap::new()),
            max_message_len,
        }
    }

    pub fn connect(&self, connection: ConnectionId, user: Option<Uuid>) -> mpsc::UnboundedReceiver<Message> {
        self.registry.connect(connection, user)
    }

    /// Adds the connection to a room. Authenticated connections may only
    /// join rooms they participate in.
    pub fn join(&self, connection: &str, raw_room: &str) -> Result<RoomId, AppError> {
        let room = RoomId::parse(raw_room)?;
        if let Some(user) = self.registry.user_of(connection) {
            if !room.contains(user) {
                return Err(AppError::new(ErrorCode::NotRoomParticipant, "you are not a participant of this room"));
            }
        }
        if !self.registry.join(connection, room) {
            return Err(AppError::bad_request("connection is not registered"));
        }
        tracing::debug!(connection, room = %room, "joined room");
        Ok(room)
    }

    pub fn disconnect(&self, connection: &str) {
        self.registry.disconnect(connection);
    }

    /// Validates, persists, then broadcasts to the room. Nothing is
    /// broadcast when persisting fails.
    ///
    /// Persist and broadcast run on their own task, so a caller that stops
    /// waiting (a dropped HTTP request, a timed out socket ack) cannot leave
    /// a stored message that live members never received.
    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<Message, AppError> {
        let trimmed = outgoing.content.trim();
        if trimmed.is_empty() {
            return Err(AppError::new(ErrorCode::InvalidMessage, "message content must not be empty"));
        }
        if outgoing.content.chars().count() > self.max_message_len {
            return Err(AppError::new(
                ErrorCode::InvalidMessage,
                format!("message must be at most {} characters", self.max_message_len),
            ));
        }
        if outgoing.sender_id == outgoing.receiver_id {
            return Err(AppError::new(ErrorCode::InvalidMessage, "cannot send a message to yourself"));
        }

        let room = RoomId::for_pair(outgoing.sender_id, outgoing.receiver_id)?;
        if let Some(claimed) = outgoing.room.as_deref() {
            if claimed != room.to_string() {
                return Err(AppError::new(ErrorCode::RoomMismatch, "room does not match sender and receiver"));
            }
        }

        let users = self.users.clone();
        let (low, high) = room.participants();
        let found = run_blocking(move || users.find_many(&[low, high])).await?;
        if found.len() < 2 {
            return Err(AppError::new(ErrorCode::UserNotFound, "user not found"));
        }

        let new_message = NewMessage {
            room_id: room.to_string(),
            sender_id: outgoing.sender_id,
            receiver_id: outgoing.receiver_id,
            content: outgoing.content,
        };
        let relay = tokio::spawn(relay(
            self.messages.clone(),
            self.registry.clone(),
            self.room_locks.clone(),
            room,
            new_message,
        ));
        relay.await.map_err(|e| AppError::internal(format!("message relay task failed: {e}")))?
    }

    pub async fn history(&self, a: Uuid, b: Uuid) -> Result<Vec<Message>, AppError> {
        let room = RoomId::for_pair(a, b)?;
        let messages = self.messages.clone();
        Ok(run_blocking(move || messages.history(&room.to_string())).await?)
    }

    /// Rooms with at least one connected member.
    pub fn active_rooms(&self) -> usize {
        self.registry.rooms.len()
    }
}

/// Persists one message and queues it for every room member, holding the
/// room's lock throughout so live delivery order equals log order.
async fn relay(
    messages: Arc<dyn MessageStore>,
    registry: Arc<RoomRegistry>,
    room_locks: Arc<DashMap<RoomId, Arc<Mutex<()>>>>,
    room: RoomId,
    new_message: NewMessage,
) -> Result<Message, AppError> {
    let lock = room_locks.entry(room).or_default().clone();
    let result = {
        let _guard = lock.lock().await;
        match run_blocking(move || messages.append(new_message)).await {
            Ok(message) => {
                let delivered = registry.broadcast(&room, &message);
                counter!("messages_sent_total").increment(1);
                tracing::debug!(room = %room, message_id = %message.id, delivered, "message relayed");
                Ok(message)
            }
            Err(e) => {
                tracing::warn!(room = %room, error = %e, "message not persisted, nothing broadcast");
                Err(AppError::from(e))
            }
        }
    };
    drop(lock);
    // Only the map holds the lock once no sender is waiting on it.
    room_locks.remove_if(&room, |_, lock| Arc::strong_count(lock) == 1);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::models::NewUser;
    use crate::store::memory::{MemoryMessageStore, MemoryUserStore};
    use crate::store::StoreError;

    fn registered(n: usize) -> (Arc<MemoryUserStore>, Vec<Uuid>) {
        let users = Arc::new(MemoryUserStore::default());
        let ids = (0..n)
            .map(|i| {
                users
                    .insert(NewUser {
                        name: format!("user{i}"),
                        email: format!("user{i}@example.com"),
                        password_hash: "x".into(),
                    })
                    .unwrap()
                    .id
            })
            .collect();
        (users, ids)
    }

    fn channel_with(messages: Arc<dyn MessageStore>, n: usize) -> (MessagingChannel, Vec<Uuid>) {
        let (users, ids) = registered(n);
        (MessagingChannel::new(messages, users, 4000), ids)
    }

    fn channel() -> MessagingChannel {
        channel_with(Arc::new(MemoryMessageStore::default()), 0).0
    }

    fn outgoing(from: Uuid, to: Uuid, content: &str) -> OutgoingMessage {
        OutgoingMessage { sender_id: from, receiver_id: to, content: content.into(), room: None }
    }

    #[test]
    fn room_id_is_symmetric_and_sorted() {
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let ab = RoomId::for_pair(a, b).unwrap();
        assert_eq!(ab, RoomId::for_pair(b, a).unwrap());

        let mut ids = [a.to_string(), b.to_string()];
        ids.sort();
        assert_eq!(ab.to_string(), ids.join("-"));
        assert_eq!(RoomId::parse(&ab.to_string()).unwrap(), ab);
    }

    #[test]
    fn non_canonical_room_ids_are_rejected() {
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let room = RoomId::for_pair(a, b).unwrap();
        let (low, high) = room.participants();

        assert!(RoomId::parse(&format!("{high}-{low}")).is_err());
        assert!(RoomId::parse(&room.to_string().to_uppercase()).is_err());
        assert!(RoomId::parse(&format!("{a}-{a}")).is_err());
        assert!(RoomId::parse("general").is_err());
    }

    #[tokio::test]
    async fn sender_receives_its_own_message() {
        let (chat, ids) = channel_with(Arc::new(MemoryMessageStore::default()), 2);
        let (a, b) = (ids[0], ids[1]);
        let room = RoomId::for_pair(a, b).unwrap().to_string();

        let mut alice = chat.connect("alice".into(), None);
        let mut bob = chat.connect("bob".into(), None);
        chat.join("alice", &room).unwrap();
        chat.join("alice", &room).unwrap();
        chat.join("bob", &room).unwrap();

        let sent = chat.send(outgoing(a, b, "hello")).await.unwrap();
        assert_eq!(alice.recv().await.unwrap(), sent);
        assert_eq!(bob.recv().await.unwrap(), sent);
        // Joining twice did not duplicate delivery.
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_leaves_every_room() {
        let chat = channel();
        let (a, b, c) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        let ab = RoomId::for_pair(a, b).unwrap();
        let ac = RoomId::for_pair(a, c).unwrap();

        let _inbox = chat.connect("conn".into(), None);
        chat.join("conn", &ab.to_string()).unwrap();
        chat.join("conn", &ac.to_string()).unwrap();
        assert_eq!(chat.active_rooms(), 2);

        chat.disconnect("conn");
        assert_eq!(chat.active_rooms(), 0);
        assert!(chat.join("conn", &ab.to_string()).is_err());
    }

    #[tokio::test]
    async fn authenticated_connection_only_joins_own_rooms() {
        let chat = channel();
        let (me, other, stranger) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        let _inbox = chat.connect("conn".into(), Some(me));

        assert!(chat.join("conn", &RoomId::for_pair(me, other).unwrap().to_string()).is_ok());
        let err = chat
            .join("conn", &RoomId::for_pair(other, stranger).unwrap().to_string())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotRoomParticipant);
    }

    #[tokio::test]
    async fn invalid_messages_are_rejected() {
        let chat = channel();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());

        assert_eq!(chat.send(outgoing(a, b, "   ")).await.unwrap_err().code(), ErrorCode::InvalidMessage);
        assert_eq!(chat.send(outgoing(a, a, "hi")).await.unwrap_err().code(), ErrorCode::InvalidMessage);
        let long = "x".repeat(4001);
        assert_eq!(chat.send(outgoing(a, b, &long)).await.unwrap_err().code(), ErrorCode::InvalidMessage);

        let mut wrong_room = outgoing(a, b, "hi");
        wrong_room.room = Some(RoomId::for_pair(a, Uuid::now_v7()).unwrap().to_string());
        assert_eq!(chat.send(wrong_room).await.unwrap_err().code(), ErrorCode::RoomMismatch);
    }

    #[tokio::test]
    async fn history_returns_every_message_in_order() {
        let (chat, ids) = channel_with(Arc::new(MemoryMessageStore::default()), 2);
        let (a, b) = (ids[0], ids[1]);
        for i in 0..10 {
            let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
            chat.send(outgoing(from, to, &format!("m{i}"))).await.unwrap();
        }

        let log = chat.history(b, a).await.unwrap();
        assert_eq!(log.len(), 10);
        assert!(log.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        let contents: Vec<&str> = log.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents[0], "m0");
        assert_eq!(contents[9], "m9");
    }

    struct BrokenLog;

    impl MessageStore for BrokenLog {
        fn append(&self, _: NewMessage) -> Result<Message, StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }
        fn history(&self, _: &str) -> Result<Vec<Message>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn persistence_failure_broadcasts_nothing() {
        let (chat, ids) = channel_with(Arc::new(BrokenLog), 2);
        let (a, b) = (ids[0], ids[1]);
        let mut inbox = chat.connect("conn".into(), None);
        chat.join("conn", &RoomId::for_pair(a, b).unwrap().to_string()).unwrap();

        let err = chat.send(outgoing(a, b, "hello")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageUnavailable);
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_participants_are_rejected() {
        let (chat, ids) = channel_with(Arc::new(MemoryMessageStore::default()), 1);

        let err = chat.send(outgoing(ids[0], Uuid::now_v7(), "hi")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UserNotFound);
        let err = chat.send(outgoing(Uuid::now_v7(), Uuid::now_v7(), "hi")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UserNotFound);
        assert!(chat.history(ids[0], Uuid::now_v7()).await.unwrap().is_empty());
    }

    struct SlowLog(MemoryMessageStore);

    impl MessageStore for SlowLog {
        fn append(&self, message: NewMessage) -> Result<Message, StoreError> {
            std::thread::sleep(Duration::from_millis(200));
            self.0.append(message)
        }
        fn history(&self, room_id: &str) -> Result<Vec<Message>, StoreError> {
            self.0.history(room_id)
        }
    }

    #[tokio::test]
    async fn abandoned_send_still_reaches_the_room() {
        let (chat, ids) = channel_with(Arc::new(SlowLog(MemoryMessageStore::default())), 2);
        let (a, b) = (ids[0], ids[1]);
        let mut bob = chat.connect("bob".into(), None);
        chat.join("bob", &RoomId::for_pair(a, b).unwrap().to_string()).unwrap();

        let gave_up = tokio::time::timeout(Duration::from_millis(50), chat.send(outgoing(a, b, "hello"))).await;
        assert!(gave_up.is_err());

        let delivered = tokio::time::timeout(Duration::from_secs(2), bob.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.content, "hello");
        assert_eq!(chat.history(a, b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn room_locks_are_released_after_sending() {
        let (chat, ids) = channel_with(Arc::new(MemoryMessageStore::default()), 3);
        chat.send(outgoing(ids[0], ids[1], "one")).await.unwrap();
        chat.send(outgoing(ids[0], ids[2], "two")).await.unwrap();
        assert!(chat.room_locks.is_empty());
    }
}

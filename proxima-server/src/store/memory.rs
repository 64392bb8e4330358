//! In-memory backend. Used when no database is configured and by tests.
//!
//! Every map is a sharded `DashMap`; no lock spans unrelated users, pairs or
//! rooms. Where two maps are touched together the order is always
//! records -> cells and edges -> partners.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::geo::{BoundingBox, Coordinates};
use crate::models::{
    LikeOutcome, LocationRecord, MatchEdge, Message, NewMessage, NewUser, ProfileChanges, User, UserPair,
};

use super::{LikeStore, LocationStore, MessageStore, StoreError, UserStore};

// --- Users ---

#[derive(Default)]
pub struct MemoryUserStore {
    users: DashMap<Uuid, User>,
    emails: DashMap<String, Uuid>,
}

impl UserStore for MemoryUserStore {
    fn insert(&self, new_user: NewUser) -> Result<User, StoreError> {
        match self.emails.entry(new_user.email.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateEmail),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let user = User {
                    id: Uuid::now_v7(),
                    name: new_user.name,
                    email: new_user.email,
                    password_hash: new_user.password_hash,
                    gender: None,
                    age: None,
                    bio: None,
                    photo_url: None,
                    created_at: now,
                    updated_at: now,
                };
                self.users.insert(user.id, user.clone());
                slot.insert(user.id);
                Ok(user)
            }
        }
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let id = match self.emails.get(email) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.find_by_id(id)
    }

    fn find_many(&self, ids: &[Uuid]) -> Result<Vec<User>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.users.get(id).map(|u| u.clone()))
            .collect())
    }

    fn update_profile(&self, id: Uuid, changes: &ProfileChanges) -> Result<Option<User>, StoreError> {
        Ok(self.users.get_mut(&id).map(|mut user| {
            changes.apply_to(&mut user, Utc::now());
            user.clone()
        }))
    }
}

// --- Locations ---

type Cell = (i32, i32);

/// Past this many grid cells a query scans all records instead.
const MAX_QUERY_CELLS: usize = 4096;

/// Uniform lat/lon grid over the latest record of each user.
pub struct MemoryLocationStore {
    cell_deg: f64,
    records: DashMap<Uuid, LocationRecord>,
    cells: DashMap<Cell, HashSet<Uuid>>,
}

impl MemoryLocationStore {
    pub fn new(cell_deg: f64) -> Self {
        Self {
            cell_deg,
            records: DashMap::new(),
            cells: DashMap::new(),
        }
    }

    fn cell_of(&self, coordinates: &Coordinates) -> Cell {
        (
            (coordinates.latitude / self.cell_deg).floor() as i32,
            (coordinates.longitude / self.cell_deg).floor() as i32,
        )
    }

    fn add_to_cell(&self, cell: Cell, user_id: Uuid) {
        self.cells.entry(cell).or_default().insert(user_id);
    }

    fn remove_from_cell(&self, cell: Cell, user_id: Uuid) {
        if let Some(mut members) = self.cells.get_mut(&cell) {
            members.remove(&user_id);
        }
        self.cells.remove_if(&cell, |_, members| members.is_empty());
    }

    fn cells_covering(&self, area: &BoundingBox) -> Option<Vec<Cell>> {
        let row_lo = (area.min_lat / self.cell_deg).floor() as i32;
        let row_hi = (area.max_lat / self.cell_deg).floor() as i32;
        let rows = (row_hi - row_lo + 1).max(0) as usize;

        let col_spans: Vec<(i32, i32)> = area
            .lon_ranges
            .iter()
            .map(|(w, e)| ((w / self.cell_deg).floor() as i32, (e / self.cell_deg).floor() as i32))
            .collect();
        let cols: usize = col_spans.iter().map(|(lo, hi)| (hi - lo + 1).max(0) as usize).sum();

        if rows.saturating_mul(cols) > MAX_QUERY_CELLS {
            return None;
        }

        let mut cells = Vec::with_capacity(rows * cols);
        for row in row_lo..=row_hi {
            for (lo, hi) in &col_spans {
                for col in *lo..=*hi {
                    cells.push((row, col));
                }
            }
        }
        Some(cells)
    }

    fn candidate_ids(&self, area: &BoundingBox) -> HashSet<Uuid> {
        match self.cells_covering(area) {
            Some(cells) => {
                let mut ids = HashSet::new();
                for cell in cells {
                    if let Some(members) = self.cells.get(&cell) {
                        ids.extend(members.iter().copied());
                    }
                }
                ids
            }
            None => self.records.iter().map(|r| *r.key()).collect(),
        }
    }
}

impl LocationStore for MemoryLocationStore {
    fn upsert(&self, record: LocationRecord) -> Result<(), StoreError> {
        let new_cell = self.cell_of(&record.coordinates);
        match self.records.entry(record.user_id) {
            Entry::Occupied(mut existing) => {
                if existing.get().updated_at > record.updated_at {
                    return Ok(());
                }
                let old_cell = self.cell_of(&existing.get().coordinates);
                if old_cell != new_cell {
                    self.remove_from_cell(old_cell, record.user_id);
                    self.add_to_cell(new_cell, record.user_id);
                }
                existing.insert(record);
            }
            Entry::Vacant(slot) => {
                self.add_to_cell(new_cell, record.user_id);
                slot.insert(record);
            }
        }
        Ok(())
    }

    fn get(&self, user_id: Uuid) -> Result<Option<LocationRecord>, StoreError> {
        Ok(self.records.get(&user_id).map(|r| *r))
    }

    fn candidates(&self, area: &BoundingBox, fresh_since: DateTime<Utc>) -> Result<Vec<LocationRecord>, StoreError> {
        let ids = self.candidate_ids(area);
        Ok(ids
            .into_iter()
            .filter_map(|id| self.records.get(&id).map(|r| *r))
            .filter(|r| r.updated_at >= fresh_since && area.contains(&r.coordinates))
            .collect())
    }

    fn prune_stale(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let stale: Vec<Uuid> = self
            .records
            .iter()
            .filter(|r| r.updated_at < before)
            .map(|r| *r.key())
            .collect();

        let mut removed = 0;
        for user_id in stale {
            // Re-check under the entry lock: the user may have moved since the scan.
            if let Entry::Occupied(entry) = self.records.entry(user_id) {
                if entry.get().updated_at < before {
                    let cell = self.cell_of(&entry.get().coordinates);
                    self.remove_from_cell(cell, user_id);
                    entry.remove();
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

// --- Likes ---

#[derive(Debug, Default, Clone, Copy)]
struct PairEdges {
    low_likes_high: Option<DateTime<Utc>>,
    high_likes_low: Option<DateTime<Utc>>,
}

impl PairEdges {
    fn matched_at(&self) -> Option<DateTime<Utc>> {
        match (self.low_likes_high, self.high_likes_low) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct MemoryLikeStore {
    edges: DashMap<UserPair, PairEdges>,
    /// Users each user has a like edge with, in either direction.
    partners: DashMap<Uuid, HashSet<Uuid>>,
}

impl LikeStore for MemoryLikeStore {
    fn like(&self, liker: Uuid, liked: Uuid, at: DateTime<Utc>) -> Result<LikeOutcome, StoreError> {
        let pair = UserPair::new(liker, liked);
        let mut entry = self.edges.entry(pair).or_default();
        let edges = entry.value_mut();

        let was_matched = edges.matched_at().is_some();
        let slot = if liker == pair.low() {
            &mut edges.low_likes_high
        } else {
            &mut edges.high_likes_low
        };
        let inserted = slot.is_none();
        if inserted {
            *slot = Some(at);
        }
        let matched = edges.matched_at().is_some();

        if inserted {
            self.partners.entry(liker).or_default().insert(liked);
            self.partners.entry(liked).or_default().insert(liker);
        }
        drop(entry);

        Ok(LikeOutcome {
            liked: true,
            matched,
            new_match: matched && !was_matched,
        })
    }

    fn matches_of(&self, user: Uuid) -> Result<Vec<MatchEdge>, StoreError> {
        let partners: Vec<Uuid> = match self.partners.get(&user) {
            Some(set) => set.iter().copied().collect(),
            None => return Ok(Vec::new()),
        };

        let mut matches: Vec<MatchEdge> = partners
            .into_iter()
            .filter_map(|partner_id| {
                let edges = self.edges.get(&UserPair::new(user, partner_id))?;
                edges.matched_at().map(|matched_at| MatchEdge { partner_id, matched_at })
            })
            .collect();
        matches.sort_by(|a, b| b.matched_at.cmp(&a.matched_at).then(a.partner_id.cmp(&b.partner_id)));
        Ok(matches)
    }
}

// --- Messages ---

#[derive(Default)]
pub struct MemoryMessageStore {
    rooms: DashMap<String, Vec<Message>>,
}

impl MessageStore for MemoryMessageStore {
    fn append(&self, new_message: NewMessage) -> Result<Message, StoreError> {
        let mut log = self.rooms.entry(new_message.room_id.clone()).or_default();
        let now = Utc::now();
        let created_at = match log.last() {
            Some(last) if last.created_at > now => last.created_at,
            _ => now,
        };
        let message = Message {
            id: Uuid::now_v7(),
            room_id: new_message.room_id,
            sender_id: new_message.sender_id,
            receiver_id: new_message.receiver_id,
            content: new_message.content,
            created_at,
        };
        log.push(message.clone());
        Ok(message)
    }

    fn history(&self, room_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self.rooms.get(room_id).map(|log| log.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn record(user_id: Uuid, lat: f64, lon: f64, at: DateTime<Utc>) -> LocationRecord {
        LocationRecord {
            user_id,
            coordinates: Coordinates::new(lat, lon).unwrap(),
            updated_at: at,
        }
    }

    fn new_user(email: &str) -> NewUser {
        NewUser {
            name: "Test".into(),
            email: email.into(),
            password_hash: "hash".into(),
        }
    }

    #[test]
    fn duplicate_email_is_rejected() {
        let store = MemoryUserStore::default();
        store.insert(new_user("a@example.com")).unwrap();
        assert!(matches!(
            store.insert(new_user("a@example.com")),
            Err(StoreError::DuplicateEmail)
        ));
    }

    #[test]
    fn moving_user_changes_grid_cell() {
        let store = MemoryLocationStore::new(0.05);
        let user = Uuid::now_v7();
        let now = Utc::now();
        store.upsert(record(user, 37.0, -122.0, now)).unwrap();
        store.upsert(record(user, 40.0, -122.0, now + Duration::seconds(1))).unwrap();

        let old_area = BoundingBox::around(&Coordinates::new(37.0, -122.0).unwrap(), 5.0);
        assert!(store.candidates(&old_area, now - Duration::minutes(1)).unwrap().is_empty());

        let new_area = BoundingBox::around(&Coordinates::new(40.0, -122.0).unwrap(), 5.0);
        let found = store.candidates(&new_area, now - Duration::minutes(1)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(store.cells.len(), 1);
    }

    #[test]
    fn older_update_never_overwrites_newer() {
        let store = MemoryLocationStore::new(0.05);
        let user = Uuid::now_v7();
        let now = Utc::now();
        store.upsert(record(user, 10.0, 10.0, now)).unwrap();
        store.upsert(record(user, 20.0, 20.0, now - Duration::seconds(5))).unwrap();

        let current = store.get(user).unwrap().unwrap();
        assert_eq!(current.coordinates.latitude, 10.0);
    }

    #[test]
    fn prune_removes_only_stale_records() {
        let store = MemoryLocationStore::new(0.05);
        let now = Utc::now();
        let stale = Uuid::now_v7();
        let fresh = Uuid::now_v7();
        store.upsert(record(stale, 1.0, 1.0, now - Duration::minutes(30))).unwrap();
        store.upsert(record(fresh, 1.0, 1.0, now)).unwrap();

        assert_eq!(store.prune_stale(now - Duration::minutes(15)).unwrap(), 1);
        assert!(store.get(stale).unwrap().is_none());
        assert!(store.get(fresh).unwrap().is_some());
    }

    #[test]
    fn huge_area_falls_back_to_scan() {
        let store = MemoryLocationStore::new(0.05);
        let now = Utc::now();
        store.upsert(record(Uuid::now_v7(), 0.0, 0.0, now)).unwrap();
        store.upsert(record(Uuid::now_v7(), 45.0, 90.0, now)).unwrap();

        let world = BoundingBox { min_lat: -90.0, max_lat: 90.0, lon_ranges: vec![(-180.0, 180.0)] };
        assert!(store.cells_covering(&world).is_none());
        assert_eq!(store.candidates(&world, now - Duration::minutes(1)).unwrap().len(), 2);
    }

    #[test]
    fn repeated_like_is_idempotent() {
        let store = MemoryLikeStore::default();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let now = Utc::now();

        let first = store.like(a, b, now).unwrap();
        let second = store.like(a, b, now).unwrap();
        assert_eq!(first, LikeOutcome { liked: true, matched: false, new_match: false });
        assert_eq!(first, second);

        let back = store.like(b, a, now).unwrap();
        assert_eq!(back, LikeOutcome { liked: true, matched: true, new_match: true });
        let again = store.like(b, a, now).unwrap();
        assert_eq!(again, LikeOutcome { liked: true, matched: true, new_match: false });

        assert_eq!(store.matches_of(a).unwrap()[0].partner_id, b);
        assert_eq!(store.matches_of(b).unwrap()[0].partner_id, a);
    }

    #[test]
    fn concurrent_reciprocal_likes_report_exactly_one_new_match() {
        for _ in 0..200 {
            let store = Arc::new(MemoryLikeStore::default());
            let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let handles: Vec<_> = [(a, b), (b, a)]
                .into_iter()
                .map(|(liker, liked)| {
                    let store = store.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        store.like(liker, liked, Utc::now()).unwrap()
                    })
                })
                .collect();
            let outcomes: Vec<LikeOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert!(outcomes.iter().any(|o| o.matched), "both reported no match");
            assert_eq!(outcomes.iter().filter(|o| o.new_match).count(), 1);
        }
    }

    #[test]
    fn one_sided_like_is_not_a_match() {
        let store = MemoryLikeStore::default();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        store.like(a, b, Utc::now()).unwrap();
        assert!(store.matches_of(a).unwrap().is_empty());
        assert!(store.matches_of(b).unwrap().is_empty());
    }

    #[test]
    fn message_times_never_decrease_within_room() {
        let store = MemoryMessageStore::default();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        for i in 0..50 {
            store
                .append(NewMessage {
                    room_id: "room".into(),
                    sender_id: a,
                    receiver_id: b,
                    content: format!("m{i}"),
                })
                .unwrap();
        }
        let log = store.history("room").unwrap();
        assert_eq!(log.len(), 50);
        assert!(log.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(log[0].content, "m0");
        assert!(store.history("other").unwrap().is_empty());
    }
}

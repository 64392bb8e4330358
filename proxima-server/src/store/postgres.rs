//! Postgres backend over the shared r2d2 pool.
//!
//! Pair-level and room-level atomicity come from transaction-scoped advisory
//! locks, so concurrent writers on different pairs or rooms never wait on
//! each other.

use chrono::{DateTime, Utc};
use diesel::dsl::{exists, max};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Double, Timestamptz, Uuid as SqlUuid};
use uuid::Uuid;

use proxima_shared::clients::db::DbPool;

use crate::geo::{BoundingBox, Coordinates};
use crate::models::{
    Gender, LikeOutcome, LocationRecord, MatchEdge, Message, NewMessage, NewUser, ProfileChanges, User, UserPair,
};
use crate::schema::{likes, locations, messages, users};

use super::{LikeStore, LocationStore, MessageStore, StoreError, UserStore};

// --- Rows ---

#[derive(Debug, Queryable)]
#[diesel(table_name = users)]
struct UserRow {
    id: Uuid,
    name: String,
    email: String,
    password_hash: String,
    gender: Option<String>,
    age: Option<i32>,
    bio: Option<String>,
    photo_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            name: row.name,
            email: row.email,
            password_hash: row.password_hash,
            gender: row.gender.and_then(|g| g.parse::<Gender>().ok()),
            age: row.age,
            bio: row.bio,
            photo_url: row.photo_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = users)]
struct NewUserRow<'a> {
    id: Uuid,
    name: &'a str,
    email: &'a str,
    password_hash: &'a str,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(AsChangeset)]
#[diesel(table_name = users)]
struct ProfileChangeset<'a> {
    gender: Option<&'a str>,
    age: Option<i32>,
    bio: Option<&'a str>,
    photo_url: Option<&'a str>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Queryable)]
#[diesel(table_name = locations)]
struct LocationRow {
    user_id: Uuid,
    latitude: f64,
    longitude: f64,
    updated_at: DateTime<Utc>,
}

impl From<LocationRow> for LocationRecord {
    fn from(row: LocationRow) -> Self {
        LocationRecord {
            user_id: row.user_id,
            coordinates: Coordinates { latitude: row.latitude, longitude: row.longitude },
            updated_at: row.updated_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = likes)]
struct NewLikeRow {
    id: Uuid,
    liker_id: Uuid,
    liked_id: Uuid,
    created_at: DateTime<Utc>,
}

#[derive(QueryableByName)]
struct MatchRow {
    #[diesel(sql_type = SqlUuid)]
    partner_id: Uuid,
    #[diesel(sql_type = Timestamptz)]
    matched_at: DateTime<Utc>,
}

#[derive(Debug, Queryable)]
#[diesel(table_name = messages)]
struct MessageRow {
    _seq: i64,
    id: Uuid,
    room_id: String,
    sender_id: Uuid,
    receiver_id: Uuid,
    content: String,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            room_id: row.room_id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = messages)]
struct NewMessageRow<'a> {
    id: Uuid,
    room_id: &'a str,
    sender_id: Uuid,
    receiver_id: Uuid,
    content: &'a str,
    created_at: DateTime<Utc>,
}

// --- Errors and locks ---

fn map_diesel(err: DieselError) -> StoreError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => StoreError::NotFound,
        DieselError::DatabaseError(
            DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::SerializationFailure,
            info,
        ) => StoreError::Unavailable(info.message().to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

/// Stable 64-bit key for `pg_advisory_xact_lock` (FNV-1a).
fn advisory_key(namespace: &[u8], parts: &[&[u8]]) -> i64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in namespace.iter().chain(parts.iter().flat_map(|p| p.iter())) {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash as i64
}

fn pair_lock_key(pair: &UserPair) -> i64 {
    advisory_key(b"like", &[pair.low().as_bytes(), pair.high().as_bytes()])
}

fn room_lock_key(room_id: &str) -> i64 {
    advisory_key(b"room", &[room_id.as_bytes()])
}

fn advisory_lock(conn: &mut PgConnection, key: i64) -> QueryResult<()> {
    diesel::sql_query("SELECT pg_advisory_xact_lock($1)")
        .bind::<BigInt, _>(key)
        .execute(conn)
        .map(|_| ())
}

// --- Store ---

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
        self.pool.get().map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl UserStore for PgStore {
    fn insert(&self, new_user: NewUser) -> Result<User, StoreError> {
        let mut conn = self.conn()?;
        let now = Utc::now();
        let row = NewUserRow {
            id: Uuid::now_v7(),
            name: &new_user.name,
            email: &new_user.email,
            password_hash: &new_user.password_hash,
            created_at: now,
            updated_at: now,
        };

        diesel::insert_into(users::table)
            .values(&row)
            .get_result::<UserRow>(&mut conn)
            .map(User::from)
            .map_err(|e| match e {
                DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => StoreError::DuplicateEmail,
                other => map_diesel(other),
            })
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let mut conn = self.conn()?;
        users::table
            .find(id)
            .first::<UserRow>(&mut conn)
            .optional()
            .map(|row| row.map(User::from))
            .map_err(map_diesel)
    }

    fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let mut conn = self.conn()?;
        users::table
            .filter(users::email.eq(email))
            .first::<UserRow>(&mut conn)
            .optional()
            .map(|row| row.map(User::from))
            .map_err(map_diesel)
    }

    fn find_many(&self, ids: &[Uuid]) -> Result<Vec<User>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        users::table
            .filter(users::id.eq_any(ids.to_vec()))
            .load::<UserRow>(&mut conn)
            .map(|rows| rows.into_iter().map(User::from).collect())
            .map_err(map_diesel)
    }

    fn update_profile(&self, id: Uuid, changes: &ProfileChanges) -> Result<Option<User>, StoreError> {
        let mut conn = self.conn()?;
        let changeset = ProfileChangeset {
            gender: changes.gender.map(|g| g.as_str()),
            age: changes.age,
            bio: changes.bio.as_deref(),
            photo_url: changes.photo_url.as_deref(),
            updated_at: Utc::now(),
        };

        diesel::update(users::table.find(id))
            .set(&changeset)
            .get_result::<UserRow>(&mut conn)
            .optional()
            .map(|row| row.map(User::from))
            .map_err(map_diesel)
    }

    fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::sql_query("SELECT 1").execute(&mut conn).map(|_| ()).map_err(map_diesel)
    }
}

impl LocationStore for PgStore {
    fn upsert(&self, record: LocationRecord) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::sql_query(
            "INSERT INTO locations (user_id, latitude, longitude, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id) DO UPDATE \
             SET latitude = EXCLUDED.latitude, \
                 longitude = EXCLUDED.longitude, \
                 updated_at = EXCLUDED.updated_at \
             WHERE locations.updated_at <= EXCLUDED.updated_at",
        )
        .bind::<SqlUuid, _>(record.user_id)
        .bind::<Double, _>(record.coordinates.latitude)
        .bind::<Double, _>(record.coordinates.longitude)
        .bind::<Timestamptz, _>(record.updated_at)
        .execute(&mut conn)
        .map(|_| ())
        .map_err(map_diesel)
    }

    fn get(&self, user_id: Uuid) -> Result<Option<LocationRecord>, StoreError> {
        let mut conn = self.conn()?;
        locations::table
            .find(user_id)
            .first::<LocationRow>(&mut conn)
            .optional()
            .map(|row| row.map(LocationRecord::from))
            .map_err(map_diesel)
    }

    fn candidates(&self, area: &BoundingBox, fresh_since: DateTime<Utc>) -> Result<Vec<LocationRecord>, StoreError> {
        let mut conn = self.conn()?;
        let mut query = locations::table
            .filter(locations::latitude.between(area.min_lat, area.max_lat))
            .filter(locations::updated_at.ge(fresh_since))
            .into_boxed();

        query = match area.lon_ranges.as_slice() {
            [(west, east)] => query.filter(locations::longitude.between(*west, *east)),
            [(w1, e1), (w2, e2)] => query.filter(
                locations::longitude
                    .between(*w1, *e1)
                    .or(locations::longitude.between(*w2, *e2)),
            ),
            _ => query,
        };

        query
            .load::<LocationRow>(&mut conn)
            .map(|rows| rows.into_iter().map(LocationRecord::from).collect())
            .map_err(map_diesel)
    }

    fn prune_stale(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        diesel::delete(locations::table.filter(locations::updated_at.lt(before)))
            .execute(&mut conn)
            .map_err(map_diesel)
    }
}

impl LikeStore for PgStore {
    fn like(&self, liker: Uuid, liked: Uuid, at: DateTime<Utc>) -> Result<LikeOutcome, StoreError> {
        let mut conn = self.conn()?;
        let pair = UserPair::new(liker, liked);

        conn.transaction::<_, DieselError, _>(|conn| {
            advisory_lock(conn, pair_lock_key(&pair))?;

            let reciprocal: bool = diesel::select(exists(
                likes::table
                    .filter(likes::liker_id.eq(liked))
                    .filter(likes::liked_id.eq(liker)),
            ))
            .get_result(conn)?;

            let inserted = diesel::insert_into(likes::table)
                .values(&NewLikeRow { id: Uuid::now_v7(), liker_id: liker, liked_id: liked, created_at: at })
                .on_conflict((likes::liker_id, likes::liked_id))
                .do_nothing()
                .execute(conn)?;

            Ok(LikeOutcome {
                liked: true,
                matched: reciprocal,
                new_match: reciprocal && inserted == 1,
            })
        })
        .map_err(map_diesel)
    }

    fn matches_of(&self, user: Uuid) -> Result<Vec<MatchEdge>, StoreError> {
        let mut conn = self.conn()?;
        diesel::sql_query(
            "SELECT mine.liked_id AS partner_id, \
                    GREATEST(mine.created_at, theirs.created_at) AS matched_at \
             FROM likes mine \
             JOIN likes theirs \
               ON theirs.liker_id = mine.liked_id AND theirs.liked_id = mine.liker_id \
             WHERE mine.liker_id = $1 \
             ORDER BY matched_at DESC, partner_id",
        )
        .bind::<SqlUuid, _>(user)
        .load::<MatchRow>(&mut conn)
        .map(|rows| {
            rows.into_iter()
                .map(|r| MatchEdge { partner_id: r.partner_id, matched_at: r.matched_at })
                .collect()
        })
        .map_err(map_diesel)
    }
}

impl MessageStore for PgStore {
    fn append(&self, new_message: NewMessage) -> Result<Message, StoreError> {
        let mut conn = self.conn()?;

        conn.transaction::<_, DieselError, _>(|conn| {
            advisory_lock(conn, room_lock_key(&new_message.room_id))?;

            let last: Option<DateTime<Utc>> = messages::table
                .filter(messages::room_id.eq(&new_message.room_id))
                .select(max(messages::created_at))
                .first(conn)?;
            let now = Utc::now();
            let created_at = last.map_or(now, |last| last.max(now));

            diesel::insert_into(messages::table)
                .values(&NewMessageRow {
                    id: Uuid::now_v7(),
                    room_id: &new_message.room_id,
                    sender_id: new_message.sender_id,
                    receiver_id: new_message.receiver_id,
                    content: &new_message.content,
                    created_at,
                })
                .get_result::<MessageRow>(conn)
        })
        .map(Message::from)
        .map_err(map_diesel)
    }

    fn history(&self, room_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.conn()?;
        messages::table
            .filter(messages::room_id.eq(room_id))
            .order((messages::created_at.asc(), messages::seq.asc()))
            .load::<MessageRow>(&mut conn)
            .map(|rows| rows.into_iter().map(Message::from).collect())
            .map_err(map_diesel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_lock_key_ignores_argument_order() {
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        assert_eq!(pair_lock_key(&UserPair::new(a, b)), pair_lock_key(&UserPair::new(b, a)));
        assert_ne!(pair_lock_key(&UserPair::new(a, b)), pair_lock_key(&UserPair::new(a, Uuid::now_v7())));
    }

    #[test]
    fn lock_namespaces_do_not_collide() {
        assert_ne!(advisory_key(b"like", &[b"x"]), advisory_key(b"room", &[b"x"]));
        assert_eq!(room_lock_key("a-b"), room_lock_key("a-b"));
    }

    #[test]
    fn foreign_key_violation_means_missing_user() {
        let err = DieselError::DatabaseError(
            DatabaseErrorKind::ForeignKeyViolation,
            Box::new(String::from("likes_liked_id_fkey")),
        );
        assert!(matches!(map_diesel(err), StoreError::NotFound));
        assert!(matches!(map_diesel(DieselError::NotFound), StoreError::Backend(_)));
    }
}

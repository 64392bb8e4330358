use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use uuid::Uuid;

use proxima_shared::errors::{AppError, ErrorCode};
use proxima_shared::types::Ack;

use crate::config::LocationConfig;
use crate::geo::{BoundingBox, Coordinates};
use crate::models::{Gender, LocationRecord, ProfileView, UserWithPosition};
use crate::store::{run_blocking, LocationStore, StoreError, UserStore};

/// Parses the `gender` query filter. Absent, empty and `all` mean no filter.
pub fn parse_gender_filter(raw: Option<&str>) -> Result<Option<Gender>, AppError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) if value.eq_ignore_ascii_case("all") => Ok(None),
        Some(value) => value
            .parse::<Gender>()
            .map(Some)
            .map_err(|_| AppError::new(ErrorCode::ValidationError, "gender must be male, female, other or all")),
    }
}

#[derive(Debug, Clone)]
pub struct NearbyQuery {
    pub center: Coordinates,
    pub exclude: Uuid,
    pub gender: Option<Gender>,
    pub radius_km: Option<f64>,
}

/// Latest position per user and proximity queries over it.
pub struct LocationIndex {
    locations: Arc<dyn LocationStore>,
    users: Arc<dyn UserStore>,
    config: LocationConfig,
}

impl LocationIndex {
    pub fn new(locations: Arc<dyn LocationStore>, users: Arc<dyn UserStore>, config: LocationConfig) -> Self {
        Self { locations, users, config }
    }

    /// Records the caller's position. A transient storage failure is
    /// reported as a skipped update rather than an error; the client sends a
    /// fresh position on its next tick anyway.
    pub async fn update_position(&self, user_id: Uuid, latitude: f64, longitude: f64) -> Result<Ack, AppError> {
        let coordinates = Coordinates::new(latitude, longitude)?;

        let users = self.users.clone();
        let locations = self.locations.clone();
        let result = run_blocking(move || {
            if users.find_by_id(user_id)?.is_none() {
                return Err(StoreError::NotFound);
            }
            locations.upsert(LocationRecord { user_id, coordinates, updated_at: Utc::now() })
        })
        .await;

        match result {
            Ok(()) => {
                counter!("location_updates_total").increment(1);
                tracing::debug!(user_id = %user_id, lat = latitude, lon = longitude, "position updated");
                Ok(Ack::ok())
            }
            Err(StoreError::NotFound) => Err(AppError::new(ErrorCode::UserNotFound, "user not found")),
            Err(e) if e.is_transient() => {
                tracing::warn!(user_id = %user_id, error = %e, "position update skipped");
                Ok(Ack::skipped())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fresh users within the radius, nearest first. Never fails on
    /// transient storage errors: an empty list is returned instead.
    pub async fn query_nearby(&self, query: NearbyQuery) -> Result<Vec<UserWithPosition>, AppError> {
        let radius_km = self.effective_radius(query.radius_km)?;
        let area = BoundingBox::around(&query.center, radius_km);
        let fresh_since = Utc::now() - chrono::Duration::seconds(self.config.ttl_secs);

        let locations = self.locations.clone();
        let users = self.users.clone();
        let center = query.center;
        let exclude = query.exclude;
        let result = run_blocking(move || {
            let hits: Vec<(LocationRecord, f64)> = locations
                .candidates(&area, fresh_since)?
                .into_iter()
                .filter(|r| r.user_id != exclude)
                .map(|r| {
                    let d = center.distance_km(&r.coordinates);
                    (r, d)
                })
                .filter(|(_, d)| *d <= radius_km)
                .collect();

            let ids: Vec<Uuid> = hits.iter().map(|(r, _)| r.user_id).collect();
            let profiles: HashMap<Uuid, _> = users.find_many(&ids)?.into_iter().map(|u| (u.id, u)).collect();
            Ok((hits, profiles))
        })
        .await;

        let (hits, profiles) = match result {
            Ok(found) => found,
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "nearby query degraded to empty result");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut nearby: Vec<UserWithPosition> = hits
            .into_iter()
            .filter_map(|(record, distance_km)| {
                let user = profiles.get(&record.user_id)?;
                if query.gender.is_some() && user.gender != query.gender {
                    return None;
                }
                Some(UserWithPosition {
                    profile: ProfileView::public(user),
                    latitude: record.coordinates.latitude,
                    longitude: record.coordinates.longitude,
                    distance_km,
                    last_seen_at: record.updated_at,
                })
            })
            .collect();

        nearby.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km).then(a.profile.id.cmp(&b.profile.id)));
        nearby.truncate(self.config.nearby_limit);
        Ok(nearby)
    }

    fn effective_radius(&self, requested: Option<f64>) -> Result<f64, AppError> {
        match requested {
            None => Ok(self.config.radius_km),
            Some(r) if r.is_finite() && r > 0.0 => Ok(r.min(self.config.max_radius_km)),
            Some(_) => Err(AppError::new(ErrorCode::ValidationError, "radiusKm must be a positive number")),
        }
    }

    pub async fn prune_stale(&self) -> Result<usize, AppError> {
        let before = Utc::now() - chrono::Duration::seconds(self.config.ttl_secs);
        let locations = self.locations.clone();
        Ok(run_blocking(move || locations.prune_stale(before)).await?)
    }

    /// Periodically removes expired records until the runtime shuts down.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.prune_stale().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "stale locations pruned"),
                    Err(e) => tracing::warn!(error = %e, "location sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewUser, ProfileChanges, User};
    use crate::store::memory::{MemoryLocationStore, MemoryUserStore};
    use chrono::DateTime;

    struct Fixture {
        index: LocationIndex,
        users: Arc<MemoryUserStore>,
        locations: Arc<MemoryLocationStore>,
    }

    fn fixture() -> Fixture {
        let users = Arc::new(MemoryUserStore::default());
        let locations = Arc::new(MemoryLocationStore::new(0.05));
        let index = LocationIndex::new(locations.clone(), users.clone(), LocationConfig::default());
        Fixture { index, users, locations }
    }

    fn add_user(users: &MemoryUserStore, name: &str, gender: Gender) -> User {
        let user = users
            .insert(NewUser {
                name: name.into(),
                email: format!("{}@example.com", name.to_lowercase()),
                password_hash: "x".into(),
            })
            .unwrap();
        users
            .update_profile(user.id, &ProfileChanges { gender: Some(gender), ..Default::default() })
            .unwrap()
            .unwrap()
    }

    fn near(center: (f64, f64), exclude: Uuid) -> NearbyQuery {
        NearbyQuery {
            center: Coordinates::new(center.0, center.1).unwrap(),
            exclude,
            gender: None,
            radius_km: None,
        }
    }

    #[tokio::test]
    async fn nearby_finds_close_users_and_skips_far_ones() {
        let f = fixture();
        let a = add_user(&f.users, "A", Gender::Male);
        let b = add_user(&f.users, "B", Gender::Female);
        let c = add_user(&f.users, "C", Gender::Female);

        f.index.update_position(a.id, 37.0, -122.0).await.unwrap();
        f.index.update_position(b.id, 37.0001, -122.0001).await.unwrap();
        f.index.update_position(c.id, 40.0, -122.0).await.unwrap();

        let found = f.index.query_nearby(near((37.0, -122.0), a.id)).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|u| u.profile.id).collect();
        assert_eq!(ids, vec![b.id]);
        assert!(found[0].distance_km < 0.02);
        assert!(found[0].profile.email.is_none());
    }

    #[tokio::test]
    async fn nearby_never_returns_the_caller() {
        let f = fixture();
        let a = add_user(&f.users, "A", Gender::Male);
        f.index.update_position(a.id, 10.0, 10.0).await.unwrap();
        assert!(f.index.query_nearby(near((10.0, 10.0), a.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gender_filter_and_ordering() {
        let f = fixture();
        let me = add_user(&f.users, "Me", Gender::Other);
        let far_f = add_user(&f.users, "FarF", Gender::Female);
        let near_f = add_user(&f.users, "NearF", Gender::Female);
        let m = add_user(&f.users, "M", Gender::Male);

        f.index.update_position(far_f.id, 0.02, 0.0).await.unwrap();
        f.index.update_position(near_f.id, 0.01, 0.0).await.unwrap();
        f.index.update_position(m.id, 0.005, 0.0).await.unwrap();

        let mut query = near((0.0, 0.0), me.id);
        query.gender = parse_gender_filter(Some("female")).unwrap();
        let ids: Vec<Uuid> = f.index.query_nearby(query).await.unwrap().iter().map(|u| u.profile.id).collect();
        assert_eq!(ids, vec![near_f.id, far_f.id]);

        let all = f.index.query_nearby(near((0.0, 0.0), me.id)).await.unwrap();
        assert_eq!(all[0].profile.id, m.id);
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn stale_records_are_excluded() {
        let f = fixture();
        let me = add_user(&f.users, "Me", Gender::Male);
        let old = add_user(&f.users, "Old", Gender::Female);
        f.locations
            .upsert(LocationRecord {
                user_id: old.id,
                coordinates: Coordinates::new(0.0, 0.0).unwrap(),
                updated_at: Utc::now() - chrono::Duration::hours(1),
            })
            .unwrap();

        assert!(f.index.query_nearby(near((0.0, 0.0), me.id)).await.unwrap().is_empty());
        assert_eq!(f.index.prune_stale().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn radius_is_clamped_to_maximum() {
        let f = fixture();
        let me = add_user(&f.users, "Me", Gender::Male);
        let other = add_user(&f.users, "Other", Gender::Female);
        // ~66 km north
        f.index.update_position(other.id, 0.6, 0.0).await.unwrap();

        let mut query = near((0.0, 0.0), me.id);
        query.radius_km = Some(1000.0);
        assert!(f.index.query_nearby(query.clone()).await.unwrap().is_empty());

        query.radius_km = Some(-1.0);
        assert!(f.index.query_nearby(query).await.is_err());
    }

    #[tokio::test]
    async fn invalid_coordinates_and_unknown_users() {
        let f = fixture();
        let err = f.index.update_position(Uuid::now_v7(), 95.0, 0.0).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCoordinates);

        let err = f.index.update_position(Uuid::now_v7(), 1.0, 1.0).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UserNotFound);
    }

    struct DownLocations;

    impl LocationStore for DownLocations {
        fn upsert(&self, _: LocationRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }
        fn get(&self, _: Uuid) -> Result<Option<LocationRecord>, StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }
        fn candidates(&self, _: &BoundingBox, _: DateTime<Utc>) -> Result<Vec<LocationRecord>, StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }
        fn prune_stale(&self, _: DateTime<Utc>) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }
    }

    #[tokio::test]
    async fn transient_failures_degrade_gracefully() {
        let users = Arc::new(MemoryUserStore::default());
        let me = add_user(&users, "Me", Gender::Male);
        let index = LocationIndex::new(Arc::new(DownLocations), users, LocationConfig::default());

        let ack = index.update_position(me.id, 1.0, 1.0).await.unwrap();
        assert_eq!(ack, Ack::skipped());
        assert!(index.query_nearby(near((1.0, 1.0), me.id)).await.unwrap().is_empty());
    }

    #[test]
    fn gender_filter_parsing() {
        assert_eq!(parse_gender_filter(None).unwrap(), None);
        assert_eq!(parse_gender_filter(Some("all")).unwrap(), None);
        assert_eq!(parse_gender_filter(Some("male")).unwrap(), Some(Gender::Male));
        assert!(parse_gender_filter(Some("robot")).is_err());
    }
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::Coordinates;

// --- User ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            "other" => Ok(Gender::Other),
            _ => Err(format!("unknown gender: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub gender: Option<Gender>,
    pub age: Option<i32>,
    pub bio: Option<String>,
    pub photo_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
}

/// Partial profile update. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub gender: Option<Gender>,
    pub age: Option<i32>,
    pub bio: Option<String>,
    pub photo_url: Option<String>,
}

impl ProfileChanges {
    pub fn is_empty(&self) -> bool {
        self.gender.is_none() && self.age.is_none() && self.bio.is_none() && self.photo_url.is_none()
    }

    pub fn apply_to(&self, user: &mut User, at: DateTime<Utc>) {
        if let Some(gender) = self.gender {
            user.gender = Some(gender);
        }
        if let Some(age) = self.age {
            user.age = Some(age);
        }
        if let Some(bio) = &self.bio {
            user.bio = Some(bio.clone());
        }
        if let Some(photo_url) = &self.photo_url {
            user.photo_url = Some(photo_url.clone());
        }
        user.updated_at = at;
    }
}

/// Public profile attributes. `email` is only filled for the owner's own view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileView {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub gender: Option<Gender>,
    pub age: Option<i32>,
    pub bio: Option<String>,
    pub photo_url: Option<String>,
}

impl ProfileView {
    pub fn public(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: None,
            gender: user.gender,
            age: user.age,
            bio: user.bio.clone(),
            photo_url: user.photo_url.clone(),
        }
    }

    pub fn owner(user: &User) -> Self {
        Self {
            email: Some(user.email.clone()),
            ..Self::public(user)
        }
    }
}

// --- Location ---

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationRecord {
    pub user_id: Uuid,
    pub coordinates: Coordinates,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserWithPosition {
    #[serde(flatten)]
    pub profile: ProfileView,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_km: f64,
    pub last_seen_at: DateTime<Utc>,
}

// --- Likes & matches ---

/// Unordered pair of distinct users, stored low id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserPair {
    low: Uuid,
    high: Uuid,
}

impl UserPair {
    pub fn new(a: Uuid, b: Uuid) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn low(&self) -> Uuid {
        self.low
    }

    pub fn high(&self) -> Uuid {
        self.high
    }

    pub fn contains(&self, user: Uuid) -> bool {
        self.low == user || self.high == user
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LikeOutcome {
    pub liked: bool,
    pub matched: bool,
    /// True only for the call that completed the mutual pair.
    pub new_match: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchEdge {
    pub partner_id: Uuid,
    pub matched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchView {
    #[serde(flatten)]
    pub profile: ProfileView,
    pub matched_at: DateTime<Utc>,
}

// --- Messages ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub room_id: String,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: String,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_order_independent() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        assert_eq!(UserPair::new(a, b), UserPair::new(b, a));
    }

    #[test]
    fn gender_parses_case_insensitively() {
        assert_eq!("Female".parse::<Gender>().unwrap(), Gender::Female);
        assert!("robot".parse::<Gender>().is_err());
    }

    #[test]
    fn profile_changes_leave_absent_fields_alone() {
        let now = Utc::now();
        let mut user = User {
            id: Uuid::now_v7(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            password_hash: String::new(),
            gender: Some(Gender::Female),
            age: Some(30),
            bio: Some("hi".into()),
            photo_url: None,
            created_at: now,
            updated_at: now,
        };
        let changes = ProfileChanges { age: Some(31), ..Default::default() };
        changes.apply_to(&mut user, now);

        assert_eq!(user.age, Some(31));
        assert_eq!(user.gender, Some(Gender::Female));
        assert_eq!(user.bio.as_deref(), Some("hi"));
    }
}

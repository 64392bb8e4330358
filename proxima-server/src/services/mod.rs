pub mod identity;
pub mod location;
pub mod matching;
pub mod messaging;

pub use identity::{IdentityService, ProfileUpdate};
pub use location::{LocationIndex, NearbyQuery};
pub use matching::MatchEngine;
pub use messaging::{MessagingChannel, OutgoingMessage, RoomId};

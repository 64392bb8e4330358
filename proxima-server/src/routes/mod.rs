pub mod auth;
pub mod chat;
pub mod health;
pub mod location;
pub mod matches;
pub mod profile;

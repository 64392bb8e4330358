pub mod handlers;

pub use handlers::notify_new_match;

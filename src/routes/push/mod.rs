mod handler;

pub use handler::{subscribe, unsubscribe, vapid_public_key};

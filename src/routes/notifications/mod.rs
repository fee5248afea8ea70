mod handler;

pub use handler::{get_notifications, update_notifications};

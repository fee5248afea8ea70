mod handler;

pub use handler::{check_limit, get_subscription, increment_limit, update_subscription};

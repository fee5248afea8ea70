mod handler;

pub use handler::{query_wallet, update_wallet};

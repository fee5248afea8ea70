mod handler;

pub use handler::{list_audit, record_audit};

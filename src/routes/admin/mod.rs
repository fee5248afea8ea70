mod handler;

pub use handler::{data_cleanup, run_geofence_scan};

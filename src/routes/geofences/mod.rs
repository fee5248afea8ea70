mod handler;

pub use handler::{
    create_geofence, delete_geofence, list_geofence_events, list_geofences, list_locations,
    report_location,
};

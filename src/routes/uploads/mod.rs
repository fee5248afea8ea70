mod handler;

pub use handler::{upload_family_logo, upload_file, upload_medical, upload_trip_photo};

mod handler;
mod model;

pub use handler::{get_health_profile, save_health_profile};
pub use model::{HealthProfile, HealthProfileInput};

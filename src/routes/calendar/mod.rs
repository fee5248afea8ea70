mod handler;

pub use handler::export_calendar;

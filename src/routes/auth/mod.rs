mod handler;
mod model;

pub use handler::{change_password, login, logout, register};

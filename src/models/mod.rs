pub mod proctoring_config;
pub mod roster;
pub mod session;
pub mod violation;

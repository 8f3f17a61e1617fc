pub mod backend_client;
pub mod media_capture;
pub mod monitor_service;
pub mod session_clock;
pub mod session_machine;
pub mod session_runtime;
pub mod violation_detector;

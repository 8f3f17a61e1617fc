pub mod backend_dto;
pub mod monitor_dto;
pub mod session_dto;

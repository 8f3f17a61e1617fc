use crate::error::{Error, Result};
use dotenvy::dotenv;
use std::env;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub jwt_secret: String,
    pub exam_backend_url: String,
    pub student_rps: u32,
    pub instructor_rps: u32,
    pub backend_timeout_secs: u64,
    pub stale_after_secs: i64,
    pub detector_debounce_ms: i64,
    pub violation_report_attempts: u32,
    pub session_retention_secs: i64,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        Ok(Self {
            server_address: get_env("SERVER_ADDRESS")?,
            jwt_secret: get_env("JWT_SECRET")?,
            exam_backend_url: get_env("EXAM_BACKEND_URL")?,
            student_rps: get_env_parse("STUDENT_RPS")?,
            instructor_rps: get_env_parse("INSTRUCTOR_RPS")?,
            backend_timeout_secs: get_env_or("BACKEND_TIMEOUT_SECS", 10)?,
            stale_after_secs: get_env_or("STALE_AFTER_SECS", 120)?,
            detector_debounce_ms: get_env_or("DETECTOR_DEBOUNCE_MS", 500)?,
            violation_report_attempts: get_env_or("VIOLATION_REPORT_ATTEMPTS", 3)?,
            session_retention_secs: get_env_or("SESSION_RETENTION_SECS", 3600)?,
            log_format: get_env_or("LOG_FORMAT", LogFormat::Pretty)?,
        })
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_parse<T>(name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get_env(name)?;
    raw.parse()
        .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e)))
}

fn get_env_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e))),
        _ => Ok(default),
    }
}

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> &'static Config {
    CONFIG
        .get()
        .expect("Configuration has not been initialized")
}

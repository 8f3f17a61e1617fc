use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::middleware::auth::Claims;

const WINDOW: Duration = Duration::from_secs(1);
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct WindowState {
    start: Instant,
    count: u32,
}

/// Fixed one-second window per caller. Callers are told apart by the token
/// subject, so one noisy exam client cannot starve the others.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    rps: u32,
    windows: Arc<Mutex<HashMap<String, WindowState>>>,
}

impl RateLimiter {
    fn new(rps: u32) -> Self {
        Self {
            rps: rps.max(1),
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn allow(&self, caller: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        if windows.len() > SWEEP_THRESHOLD {
            windows.retain(|_, w| now.duration_since(w.start) < WINDOW);
        }
        let window = windows.entry(caller.to_string()).or_insert(WindowState {
            start: now,
            count: 0,
        });
        if now.duration_since(window.start) >= WINDOW {
            window.start = now;
            window.count = 0;
        }
        if window.count < self.rps {
            window.count += 1;
            true
        } else {
            false
        }
    }
}

pub async fn rps_middleware(
    State(state): State<RateLimiter>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let caller = req
        .extensions()
        .get::<Claims>()
        .map(|claims| claims.sub.clone())
        .unwrap_or_default();
    if !state.allow(&caller, Instant::now()) {
        tracing::debug!(%caller, "rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded").into_response();
    }
    next.run(req).await
}

pub fn new_rps_state(rps: u32) -> RateLimiter {
    RateLimiter::new(rps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_caller_gets_its_own_window() {
        let limiter = new_rps_state(2);
        let now = Instant::now();
        assert!(limiter.allow("stu-1", now));
        assert!(limiter.allow("stu-1", now));
        assert!(!limiter.allow("stu-1", now));
        assert!(limiter.allow("stu-2", now));
    }

    #[test]
    fn window_resets_after_a_second() {
        let limiter = new_rps_state(1);
        let now = Instant::now();
        assert!(limiter.allow("stu-1", now));
        assert!(!limiter.allow("stu-1", now + Duration::from_millis(999)));
        assert!(limiter.allow("stu-1", now + Duration::from_secs(1)));
    }
}

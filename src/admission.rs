//! Per-IP admission control.
//!
//! A fixed window anchored on the last allowed request: the first request from an
//! address is always allowed, a request more than `window` after the last allowed
//! one resets the count, and anything past `max_requests` inside the window is
//! denied without moving the anchor.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{AppError, AppState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy)]
struct RateLimitState {
    last_access: Instant,
    count: u32,
}

struct Table {
    by_ip: HashMap<IpAddr, RateLimitState>,
    last_sweep: Instant,
}

pub struct AdmissionController {
    max_requests: u32,
    window: Duration,
    table: Mutex<Table>,
}

impl AdmissionController {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            table: Mutex::new(Table {
                by_ip: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn admit(&self, ip: IpAddr) -> Admission {
        self.admit_at(ip, Instant::now())
    }

    pub fn admit_at(&self, ip: IpAddr, now: Instant) -> Admission {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);

        // an entry idle for longer than the window would be reset on its next
        // request anyway, so dropping it cannot change a decision
        if now.saturating_duration_since(table.last_sweep) > self.window {
            let window = self.window;
            table
                .by_ip
                .retain(|_, state| now.saturating_duration_since(state.last_access) <= window);
            table.last_sweep = now;
        }

        let Some(state) = table.by_ip.get_mut(&ip) else {
            table.by_ip.insert(ip, RateLimitState { last_access: now, count: 1 });
            return Admission::Allow;
        };

        if now.saturating_duration_since(state.last_access) > self.window {
            state.count = 1;
            state.last_access = now;
            return Admission::Allow;
        }

        state.count += 1;
        if state.count > self.max_requests {
            return Admission::Deny;
        }

        state.last_access = now;
        Admission::Allow
    }

    pub fn tracked(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).by_ip.len()
    }
}

pub async fn admit_middleware(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = peer.ip();
    match state.admission.admit(ip) {
        Admission::Allow => next.run(request).await,
        Admission::Deny => {
            tracing::warn!(%ip, path = %request.uri().path(), "admission denied");
            state.metrics.admission_denied.inc();
            AppError::TooManyRequests.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn thirty_allowed_then_denied() {
        let gate = AdmissionController::new(30, Duration::from_secs(5));
        let start = Instant::now();

        for i in 0..30 {
            let now = start + Duration::from_millis(i * 10);
            assert_eq!(gate.admit_at(ip(1), now), Admission::Allow, "request {}", i + 1);
        }
        assert_eq!(gate.admit_at(ip(1), start + Duration::from_millis(400)), Admission::Deny);
        assert_eq!(gate.admit_at(ip(1), start + Duration::from_millis(500)), Admission::Deny);
    }

    #[test]
    fn window_expiry_resets_count() {
        let gate = AdmissionController::new(30, Duration::from_secs(5));
        let start = Instant::now();

        for _ in 0..31 {
            gate.admit_at(ip(2), start);
        }
        assert_eq!(gate.admit_at(ip(2), start), Admission::Deny);

        let later = start + Duration::from_secs(6);
        assert_eq!(gate.admit_at(ip(2), later), Admission::Allow);
        // count restarted at 1, so 29 more fit
        for _ in 0..29 {
            assert_eq!(gate.admit_at(ip(2), later), Admission::Allow);
        }
        assert_eq!(gate.admit_at(ip(2), later), Admission::Deny);
    }

    #[test]
    fn denial_does_not_move_the_anchor() {
        let gate = AdmissionController::new(1, Duration::from_secs(5));
        let start = Instant::now();

        assert_eq!(gate.admit_at(ip(3), start), Admission::Allow);
        assert_eq!(gate.admit_at(ip(3), start + Duration::from_secs(4)), Admission::Deny);
        // 5.5s after the last allowed request, even though only 1.5s after the denial
        assert_eq!(gate.admit_at(ip(3), start + Duration::from_millis(5500)), Admission::Allow);
    }

    #[test]
    fn allowed_requests_move_the_anchor() {
        let gate = AdmissionController::new(2, Duration::from_secs(5));
        let start = Instant::now();

        assert_eq!(gate.admit_at(ip(4), start), Admission::Allow);
        assert_eq!(gate.admit_at(ip(4), start + Duration::from_secs(4)), Admission::Allow);
        // 8s from first contact but only 4s from the last allowed request
        assert_eq!(gate.admit_at(ip(4), start + Duration::from_secs(8)), Admission::Deny);
    }

    #[test]
    fn addresses_are_independent() {
        let gate = AdmissionController::new(1, Duration::from_secs(5));
        let now = Instant::now();

        assert_eq!(gate.admit_at(ip(5), now), Admission::Allow);
        assert_eq!(gate.admit_at(ip(5), now), Admission::Deny);
        assert_eq!(gate.admit_at(ip(6), now), Admission::Allow);
    }

    #[test]
    fn idle_entries_are_swept() {
        let gate = AdmissionController::new(30, Duration::from_secs(5));
        let start = Instant::now();

        for last in 0..10 {
            gate.admit_at(ip(last), start);
        }
        assert_eq!(gate.tracked(), 10);

        gate.admit_at(ip(200), start + Duration::from_secs(60));
        assert_eq!(gate.tracked(), 1);
    }
}

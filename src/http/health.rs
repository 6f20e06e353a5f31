//! `GET /healthz` — a process-wide registry of named probe closures,
//! constructed once at startup and passed explicitly (spec.md §9: no
//! hidden global singleton).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use super::AppState;

type ProbeFn = Box<dyn Fn() -> std::result::Result<(), String> + Send + Sync>;

struct Probe {
    name: String,
    check: ProbeFn,
}

#[derive(Default)]
pub struct HealthRegistry {
    probes: Vec<Probe>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        check: impl Fn() -> std::result::Result<(), String> + Send + Sync + 'static,
    ) {
        self.probes.push(Probe {
            name: name.into(),
            check: Box::new(check),
        });
    }

    /// Run every probe in registration order, stopping at the first
    /// failure.
    pub fn check_all(&self) -> std::result::Result<(), (String, String)> {
        for probe in &self.probes {
            if let Err(err) = (probe.check)() {
                return Err((probe.name.clone(), err));
            }
        }
        Ok(())
    }
}

pub async fn handle(State(state): State<AppState>) -> Response {
    match state.health.check_all() {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err((name, err)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{name} failed: {err}"),
        )
            .into_response(),
    }
}

/*!
 * Session Tracing
 * Structured logging for trace sessions using the tracing crate
 *
 * Environment variables:
 * - RUST_LOG: log filter (default: info)
 * - TRACE_STORE_LOG_JSON: JSON output when `1` or `true`
 */

use std::time::Instant;
use tracing::{debug, info, span, warn, Level, Span};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Binds slower than this are logged as warnings
const SLOW_BIND_MS: u128 = 250;

fn json_requested() -> bool {
    std::env::var("TRACE_STORE_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Install the global subscriber
///
/// Returns `false` if a subscriber was already installed, which is the
/// normal case when several tests initialise tracing.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if json_requested() {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = json_requested(), "trace store tracing initialized");
    }
    installed
}

/// Unique id correlating every log line of one session
pub fn generate_session_id() -> Uuid {
    Uuid::new_v4()
}

/// Span covering the bind of a whole session
pub struct SessionSpan {
    span: Span,
    start: Instant,
    session_id: Uuid,
}

impl SessionSpan {
    pub fn new(session_id: Uuid, readonly: bool, stores: usize) -> Self {
        let span = span!(
            Level::INFO,
            "trace_session",
            session = %session_id,
            readonly,
            stores,
            duration_ms = tracing::field::Empty,
            result = tracing::field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
            session_id,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn record_result(&self, success: bool) {
        self.span.record("result", if success { "success" } else { "error" });
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    /// Handle for work running on pool threads
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for SessionSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.span.record("duration_ms", duration.as_millis());
        let _entered = self.span.enter();

        if duration.as_millis() > SLOW_BIND_MS {
            warn!(
                session = %self.session_id,
                duration_ms = duration.as_millis(),
                slow = true,
                "slow session bind"
            );
        } else {
            debug!(
                session = %self.session_id,
                duration_us = duration.as_micros(),
                "session bind completed"
            );
        }
    }
}

#[inline]
pub fn span_session(session_id: Uuid, readonly: bool, stores: usize) -> SessionSpan {
    SessionSpan::new(session_id, readonly, stores)
}

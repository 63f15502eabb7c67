/*!
 * Monitoring
 * Tracing subscriber setup and session spans
 */

mod tracer;

pub use tracer::{generate_session_id, init_tracing, span_session, SessionSpan};

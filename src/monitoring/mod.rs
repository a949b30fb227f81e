/*!
 * Monitoring
 * Protocol-violation diagnostics and entry point tracing
 */

mod diagnostics;
mod tracer;

pub use diagnostics::{Diagnostics, Violation};
pub use tracer::{generate_trace_id, init_tracing, span_entry, EntrySpan};

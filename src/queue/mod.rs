/*!
 * Wait Element Queues
 */

mod element;
mod ordered;

pub use element::{ElementKind, WaitElement};
pub use ordered::{Fit, InsertError, OrderedQueue};

/*!
 * Synchronization Primitives
 *
 * Manual and auto reset events used at the few blocking points of the
 * engine: bind completion, suspended allocations, blocking allocations
 * waiting for the next prepared map, and rundown waiting for free maps.
 *
 * # Performance
 *
 * - Waiters park on a `parking_lot::Condvar`, never spin
 * - `set` on an already signaled event takes the lock once and returns
 */

mod event;

pub use event::{Event, ResetMode};

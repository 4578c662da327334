//! One-way notification hooks invoked from inside store mutations.

use crate::addr::Addr;

/// Observer of structural mutations.
///
/// Every callback fires while the mutating operation still holds the slot
/// locks involved, and before the operation returns. Implementations must
/// not call back into the store from a callback; doing so from under the
/// emitting lock is undefined.
pub trait EventSink: Send + Sync {
    /// `arc` was appended to the outgoing list of `source`.
    fn add_output_arc(&self, source: Addr, arc: Addr) {
        let _ = (source, arc);
    }

    /// `arc` was appended to the incoming list of `target`.
    fn add_input_arc(&self, target: Addr, arc: Addr) {
        let _ = (target, arc);
    }

    /// `arc` is about to leave the outgoing list of `source`.
    fn remove_output_arc(&self, source: Addr, arc: Addr) {
        let _ = (source, arc);
    }

    /// `arc` is about to leave the incoming list of `target`.
    fn remove_input_arc(&self, target: Addr, arc: Addr) {
        let _ = (target, arc);
    }

    /// `addr` entered the deletion closure; fired before any of its
    /// removal events so subscriptions can be torn down first.
    fn element_deleted(&self, addr: Addr) {
        let _ = addr;
    }

    /// `addr` is about to be erased; the slot still holds its pre-deletion
    /// state when this fires.
    fn element_removed(&self, addr: Addr) {
        let _ = addr;
    }
}

/// Sink that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl EventSink for NoopEvents {}

//! The fixed-size element record held by every slot.

use crate::addr::Addr;
use crate::checksum::Checksum;
use crate::types::ElementType;

/// Intrusive list pointers of a connector element.
///
/// A connector lives in two doubly-linked lists at once: the outgoing list
/// of its `begin` element (chained through `prev_out`/`next_out`) and the
/// incoming list of its `end` element (chained through `prev_in`/`next_in`).
/// Every pointer is an address; lists terminate at `Addr::EMPTY`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArcLinks {
    pub begin: Addr,
    pub end: Addr,
    pub prev_out: Addr,
    pub next_out: Addr,
    pub prev_in: Addr,
    pub next_in: Addr,
}

impl Default for ArcLinks {
    fn default() -> Self {
        Self {
            begin: Addr::EMPTY,
            end: Addr::EMPTY,
            prev_out: Addr::EMPTY,
            next_out: Addr::EMPTY,
            prev_in: Addr::EMPTY,
            next_in: Addr::EMPTY,
        }
    }
}

/// One slot's worth of element state.
///
/// The record is a fixed-size `Copy` value so the store can snapshot it
/// under a slot lock and reason about it after. Non-connector elements
/// keep `arc` at its empty default; non-link elements keep a zero
/// `checksum`. `first_out`/`first_in` head the incident arc lists of any
/// element class (connectors may themselves be endpoints of connectors).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Element {
    /// Element class and subtype bits; zero means the slot is empty.
    pub kind: ElementType,
    /// Checksum of the externally stored content (link elements).
    pub checksum: Checksum,
    /// Endpoints and list pointers (connector elements).
    pub arc: ArcLinks,
    /// Head of the outgoing arc list.
    pub first_out: Addr,
    /// Head of the incoming arc list.
    pub first_in: Addr,
}

impl Element {
    /// A node element with the given composed type.
    pub fn node(kind: ElementType) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// A fresh link element with cleared content.
    pub fn link() -> Self {
        Self {
            kind: ElementType::LINK,
            ..Self::default()
        }
    }

    /// A connector element between `begin` and `end`, not yet woven into
    /// any list.
    pub fn arc(kind: ElementType, begin: Addr, end: Addr) -> Self {
        Self {
            kind,
            arc: ArcLinks {
                begin,
                end,
                ..ArcLinks::default()
            },
            ..Self::default()
        }
    }
}

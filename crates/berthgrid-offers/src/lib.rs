//! berthgrid-offers — the perishable resource-offer registry.
//!
//! Offers granted by the resource manager are time-limited. The registry
//! stores them from receipt to decline, running two background loops:
//!
//! - **aging** — expires offers at their TTL, letting them linger for a
//!   grace window so in-flight scheduling decisions can distinguish
//!   "expired" from "never existed";
//! - **notification** — wakes pod-level listeners when an offer arrives
//!   that their filter accepts, exactly once per listener.
//!
//! Claiming an offer for a launch goes through [`Perishable::acquire`],
//! a single-shot compare-and-swap; at most one claimant holds an offer
//! at any moment.

mod perishable;
mod registry;

pub use perishable::Perishable;
pub use registry::{
    DeclineFn, OfferFilter, OfferRegistry, RegistryConfig, DEFERRED_DECLINE_TTL_FACTOR,
    LISTENER_MAX_AGE, OFFER_ID_CACHE_TTL,
};

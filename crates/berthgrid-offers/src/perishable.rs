//! Perishable offers: live with an expiration deadline, or lingering
//! after expiry so in-flight decisions can tell "expired" from "never
//! existed".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::Instant;

use berthgrid_core::OfferDetails;
use berthgrid_metrics::OfferMetrics;

/// A live offer: usable until `expiration`, claimable exactly once at a
/// time via [`Perishable::acquire`].
#[derive(Debug)]
pub struct LiveOffer {
    details: OfferDetails,
    expiration: Instant,
    acquired: AtomicBool,
    metrics: Arc<OfferMetrics>,
}

/// The record an expired offer leaves behind while lingering.
#[derive(Debug)]
pub struct LingeringOffer {
    offer_id: String,
    hostname: String,
    deadline: Instant,
}

/// An offer in either lifetime phase.
#[derive(Debug)]
pub enum Perishable {
    Live(LiveOffer),
    Lingering(LingeringOffer),
}

impl Perishable {
    pub(crate) fn live(
        details: OfferDetails,
        expiration: Instant,
        metrics: Arc<OfferMetrics>,
    ) -> Arc<Self> {
        Arc::new(Perishable::Live(LiveOffer {
            details,
            expiration,
            acquired: AtomicBool::new(false),
            metrics,
        }))
    }

    pub(crate) fn lingering(offer_id: &str, hostname: &str, deadline: Instant) -> Arc<Self> {
        Arc::new(Perishable::Lingering(LingeringOffer {
            offer_id: offer_id.to_string(),
            hostname: hostname.to_string(),
            deadline,
        }))
    }

    pub fn offer_id(&self) -> &str {
        match self {
            Perishable::Live(o) => &o.details.offer_id,
            Perishable::Lingering(o) => &o.offer_id,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            Perishable::Live(o) => &o.details.hostname,
            Perishable::Lingering(o) => &o.hostname,
        }
    }

    /// Whether the offer is past its usable lifetime. A live offer is
    /// logically expired the moment its deadline passes, even before
    /// the aging loop transitions it.
    pub fn has_expired(&self) -> bool {
        match self {
            Perishable::Live(o) => Instant::now() > o.expiration,
            Perishable::Lingering(_) => true,
        }
    }

    /// Offer payload, for live offers only. Lingering offers resolve by
    /// id but carry no usable details.
    pub fn details(&self) -> Option<&OfferDetails> {
        match self {
            Perishable::Live(o) => Some(&o.details),
            Perishable::Lingering(_) => None,
        }
    }

    /// Claim the offer. Returns true iff this caller made the 0→1
    /// transition; concurrent callers get exactly one winner.
    pub fn acquire(&self) -> bool {
        match self {
            Perishable::Live(o) => {
                let won = o
                    .acquired
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if won {
                    o.metrics.acquired.inc(&o.details.hostname);
                }
                won
            }
            Perishable::Lingering(_) => false,
        }
    }

    /// Release a claim. A release without a prior claim is a no-op.
    pub fn release(&self) {
        if let Perishable::Live(o) = self {
            let released = o
                .acquired
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if released {
                o.metrics.released.inc(&o.details.hostname);
            }
        }
    }

    /// When the aging loop should next look at this offer.
    pub(crate) fn age_deadline(&self) -> Instant {
        match self {
            Perishable::Live(o) => o.expiration,
            Perishable::Lingering(o) => o.deadline,
        }
    }
}

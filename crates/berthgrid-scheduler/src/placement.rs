//! Placement: choosing an offer for a task.
//!
//! This is the policy boundary. The default policy is first-fit over
//! the live offer set; anything smarter (spreading, scoring) plugs in
//! behind the same trait.

use std::sync::Arc;

use berthgrid_offers::{OfferRegistry, Perishable};
use berthgrid_task::Task;

use crate::error::{SchedulerError, SchedulerResult};

/// Select and claim an offer for a task.
///
/// A successful call has acquired the returned offer; on failure no
/// claims are left behind.
pub trait Placement: Send + Sync {
    fn place(&self, offers: &OfferRegistry, task: &Task) -> SchedulerResult<Arc<Perishable>>;
}

/// First acceptable live offer wins.
pub struct FirstFit;

impl Placement for FirstFit {
    fn place(&self, offers: &OfferRegistry, task: &Task) -> SchedulerResult<Arc<Perishable>> {
        let mut claimed = None;
        offers.walk(|offer| -> Result<bool, SchedulerError> {
            let Some(details) = offer.details() else {
                return Ok(false);
            };
            // Acquire after the predicate so unsuitable offers are
            // never claimed, even transiently.
            if task.accept_offer(details) && offer.acquire() {
                claimed = Some(offer.clone());
                return Ok(true);
            }
            Ok(false)
        })?;
        claimed.ok_or(SchedulerError::NoSuitableOffers)
    }
}

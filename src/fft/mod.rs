pub mod radix2;

pub use radix2::Radix2;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Transform invoked with an unsupported length. This is a programming
/// error in the integration, not a runtime condition to recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transform size {0} is not a power of two")]
pub struct InvalidSize(pub usize);

lazy_static! {
    //
    // Plans keyed by transform size, shared between sessions.
    //
    static ref PLAN_CACHE: Mutex<HashMap<usize, Arc<Radix2>>> = Mutex::new(HashMap::new());
}

/// Returns the transform plan for size `n`, building and caching it on
/// first use.
pub fn find_plan(n: usize) -> Result<Arc<Radix2>, InvalidSize> {
    //
    // Cached plan lookup.
    //
    {
        let cache = PLAN_CACHE.lock();
        if let Some(plan) = cache.get(&n) {
            return Ok(plan.clone());
        }
    }

    let plan = Arc::new(Radix2::new(n)?);

    let mut cache = PLAN_CACHE.lock();
    cache.insert(n, plan.clone());
    Ok(plan)
}

//! Bounded local retries for the synchronous fit path.

use crate::data::raster::Raster;
use crate::domain::{FittedModel, ModelKey, RetryPolicy};
use crate::error::ComputeError;
use crate::fit::fitter::{FitContext, Fitter};

/// Fit `key`, retrying numerical failures up to `policy.max_attempts` times.
///
/// Non-numerical failures return immediately without a retry.
pub fn fit_with_retry(
    fitter: &dyn Fitter,
    key: &ModelKey,
    raster: &Raster,
    policy: RetryPolicy,
    verbose: bool,
) -> Result<FittedModel, ComputeError> {
    let mut attempt = 1;
    loop {
        match fitter.fit(key, raster, FitContext { attempt, verbose }) {
            Ok(model) => return Ok(model),
            Err(e) if e.is_transient() => {
                if !policy.allows_retry(attempt) {
                    tracing::warn!(key = %key, attempt, error = %e, "optimization failed");
                    return Err(ComputeError::Exhausted {
                        key: key.clone(),
                        attempts: attempt,
                        last: e,
                    });
                }
                tracing::warn!(key = %key, attempt, error = %e, "optimization failed, retrying");
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(key = %key, attempt, error = %e, "fit failed with a non-retryable error");
                return Err(ComputeError::Fit {
                    key: key.clone(),
                    source: e,
                });
            }
        }
    }
}

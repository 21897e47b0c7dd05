//! Authority ranking across conflicting sources.
//!
//! Authority values are caller-supplied integers; the resolver treats them
//! as opaque ordering keys and never reinterprets them.

use crate::error::EngineError;
use crate::models::Observation;

pub struct AuthorityResolver;

impl AuthorityResolver {
    /// Pick the authoritative observation among candidates.
    ///
    /// With a `source_filter`, returns that vendor's candidate or fails with
    /// `AmbiguousSource` when other candidates exist but not that vendor.
    /// Without one, ranks by highest authority, then most recent `as_of`,
    /// then candidate order (stable, deterministic).
    ///
    /// Returns `Ok(None)` when there are no candidates at all: whether that
    /// is "no estimate" or "no actual" is the caller's call.
    pub fn select<'a>(
        candidates: &'a [Observation],
        source_filter: Option<&str>,
    ) -> Result<Option<&'a Observation>, EngineError> {
        if candidates.is_empty() {
            return Ok(None);
        }

        if let Some(requested) = source_filter {
            return match candidates.iter().find(|o| o.source.vendor == requested) {
                Some(obs) => Ok(Some(obs)),
                None => Err(EngineError::AmbiguousSource {
                    requested: requested.to_string(),
                    available: candidates
                        .iter()
                        .map(|o| o.source.vendor.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                }),
            };
        }

        let mut winner = &candidates[0];
        for obs in &candidates[1..] {
            let better = obs.source.authority > winner.source.authority
                || (obs.source.authority == winner.source.authority
                    && obs.as_of > winner.as_of);
            if better {
                winner = obs;
            }
            // full tie: earlier candidate order wins
        }
        Ok(Some(winner))
    }
}

//! Reuse/rotation decision shared by every backend's `create`.
//!
//! Backends look up the live record for the incoming fingerprint, call
//! [`plan_create`] and then carry out the returned [`CreatePlan`] with their
//! own primitives (conditional insert, in-place update, key writes).

use crate::model::{remaining, TokenRecord};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum CreatePlan {
    /// No grant exists for the fingerprint: insert the record as-is.
    Insert,
    /// The incoming record is the live grant: nothing is written.
    Reuse,
    /// The refresh token is kept and a new access token replaces the old one
    /// in place. `previous` is the record being updated.
    Rotate { previous: TokenRecord },
    /// The existing grant is dead or unrelated: its entries are deleted and
    /// the incoming record inserted as a new grant.
    Replace { stale: TokenRecord },
}

/// Decides how `incoming` is persisted given the `existing` record stored
/// under the same fingerprint. Carries the reused timestamps over onto
/// `incoming`, which becomes the outgoing record.
pub fn plan_create(
    existing: Option<&TokenRecord>,
    incoming: &mut TokenRecord,
    now: DateTime<Utc>,
) -> CreatePlan {
    let Some(existing) = existing else {
        return CreatePlan::Insert;
    };

    let refresh_reused = !incoming.refresh.is_empty()
        && existing.refresh == incoming.refresh
        && !existing.is_refresh_expired(now);

    if refresh_reused {
        incoming.refresh_created_at = existing.refresh_created_at;
        incoming.refresh_expires_in = existing.refresh_expires_in;

        if access_reused(existing, incoming, now) {
            carry_access(existing, incoming);
            return CreatePlan::Reuse;
        }

        clamp_access_to_refresh(incoming, now);
        return CreatePlan::Rotate {
            previous: existing.clone(),
        };
    }

    // Grants without a refresh token can only be reused whole.
    if incoming.refresh.is_empty()
        && existing.refresh.is_empty()
        && access_reused(existing, incoming, now)
    {
        carry_access(existing, incoming);
        return CreatePlan::Reuse;
    }

    CreatePlan::Replace {
        stale: existing.clone(),
    }
}

fn access_reused(existing: &TokenRecord, incoming: &TokenRecord, now: DateTime<Utc>) -> bool {
    !incoming.access.is_empty()
        && existing.access == incoming.access
        && !existing.is_access_expired(now)
}

fn carry_access(existing: &TokenRecord, incoming: &mut TokenRecord) {
    incoming.access_created_at = existing.access_created_at;
    incoming.access_expires_in = existing.access_expires_in;
}

/// A rotated access token must not outlive the refresh token it was minted
/// under.
fn clamp_access_to_refresh(incoming: &mut TokenRecord, now: DateTime<Utc>) {
    let Some(refresh_left) = remaining(incoming.refresh_expires_at(), incoming.access_created_at.max(now))
    else {
        return;
    };
    let access_unbounded = incoming.access_expires_in.is_zero();
    if access_unbounded || incoming.access_expires_in > refresh_left {
        incoming.access_expires_in = refresh_left;
    }
}

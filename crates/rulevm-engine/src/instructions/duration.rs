//! Shared measurement for the `*_FOR` operands.
//!
//! A sustained-state check first looks at the newest generated-data record;
//! only when that alone cannot satisfy the target does it dig back through
//! preceding records, extending the earliest-matching timestamp while the
//! run is unbroken. Fetch depth is bounded by `ceil(target / heartbeat) + 1`
//! records, so the walk never pages through unbounded history.

use chrono::Duration;
use rulevm_store::GeneratedData;

use crate::error::{Result, RuleError};
use crate::rule::Rule;
use crate::vm::EvalContext;

/// How the backward walk decides a preceding record still belongs to the
/// same sustained run.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Continuity {
    /// The record itself must match the target predicate (relay, door,
    /// temperature histories carry the state in every record).
    RecordMatches,
    /// Adjacent records must be no further apart than the heartbeat
    /// (occupancy is inferred from the record cadence, not a field).
    MaxGap,
}

pub(crate) struct Sustained {
    /// Whether the newest record matches the target at all.
    pub matches_now: bool,
    /// Minutes the target state has been held, measured from the earliest
    /// record of the unbroken run.
    pub measured_minutes: f64,
}

pub(crate) async fn measure(
    ctx: &EvalContext,
    device_id: &str,
    heartbeat_secs: i64,
    target_minutes: i64,
    continuity: Continuity,
    matches: &(dyn Fn(&GeneratedData) -> bool + Sync),
) -> Result<Sustained> {
    let latest = ctx.store.get_generated_data(device_id, 1).await?;
    let latest = latest.into_iter().next().ok_or_else(|| {
        RuleError::Evaluation(format!("no generated data for device {}", device_id))
    })?;

    if !matches(&latest) {
        return Ok(Sustained {
            matches_now: false,
            measured_minutes: 0.0,
        });
    }

    let now = chrono::Utc::now();
    let measured = (now - latest.creation_timestamp).num_seconds() as f64 / 60.0;
    if measured >= target_minutes as f64 {
        // The newest record alone is old enough; no need to dig further.
        return Ok(Sustained {
            matches_now: true,
            measured_minutes: measured,
        });
    }

    let heartbeat_minutes = heartbeat_secs as f64 / 60.0;
    let max_records = (target_minutes as f64 / heartbeat_minutes).ceil() as usize + 1;
    tracing::debug!(device_id, max_records, "Digging through generated data for sustained state");
    let records = ctx.store.get_generated_data(device_id, max_records).await?;

    let mut earliest = latest.creation_timestamp;
    let mut previous = latest.creation_timestamp;
    for record in records.iter().skip(1) {
        let continues = match continuity {
            Continuity::RecordMatches => matches(record),
            Continuity::MaxGap => {
                (previous - record.creation_timestamp) <= Duration::seconds(heartbeat_secs)
            }
        };
        if !continues {
            break;
        }
        earliest = record.creation_timestamp;
        previous = record.creation_timestamp;
        if (now - earliest).num_seconds() >= target_minutes * 60 {
            // Target already satisfiable; older records cannot change the outcome.
            break;
        }
    }

    Ok(Sustained {
        matches_now: true,
        measured_minutes: (now - earliest).num_seconds() as f64 / 60.0,
    })
}

/// Shared `*_FOR` evaluation: true when the sustained duration meets the
/// target. When the state matches but the duration is still short, a
/// periodic rule is parked for exactly the shortfall, so the condition is
/// retried at the first moment it could plausibly succeed.
pub(crate) async fn evaluate_sustained(
    rule: &Rule,
    ctx: &EvalContext,
    device_id: &str,
    heartbeat_secs: i64,
    target_minutes: i64,
    continuity: Continuity,
    matches: &(dyn Fn(&GeneratedData) -> bool + Sync),
) -> Result<bool> {
    let sustained = measure(ctx, device_id, heartbeat_secs, target_minutes, continuity, matches).await?;

    if sustained.matches_now {
        tracing::debug!(
            device_id,
            measured_minutes = sustained.measured_minutes,
            target_minutes,
            "Sustained state measured"
        );
        if sustained.measured_minutes >= target_minutes as f64 {
            return Ok(true);
        }
        if rule.periodic_execution {
            let delay = ((target_minutes as f64 - sustained.measured_minutes) * 60.0).ceil() as u64;
            ctx.scheduler.park_for_retry(rule, delay).await;
        }
    }
    Ok(false)
}

//! Wall-clock operands.
//!
//! A time operand carries a time of day with an explicit UTC offset
//! (`"06:30:00+05:30"`). Evaluation compares against today's target instant
//! in that offset; periodic rules re-park themselves at the next occurrence
//! so the condition re-fires without busy-waiting.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};
use serde_json::Value;

use crate::error::{Result, RuleError};
use crate::rule::Rule;
use crate::vm::EvalContext;

use super::require_str;

/// A time of day anchored to a fixed UTC offset.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeOfDay {
    pub time: NaiveTime,
    pub offset: FixedOffset,
}

impl TimeOfDay {
    /// Parse `"HH:MM:SS+HH:MM"` / `"HH:MM:SS-HH:MM"`.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let split_at = raw
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == '+' || *c == '-')
            .map(|(i, _)| i)
            .ok_or_else(|| format!("`{}` has no UTC offset", raw))?;
        let (time_part, offset_part) = raw.split_at(split_at);

        let time = NaiveTime::parse_from_str(time_part, "%H:%M:%S")
            .map_err(|e| format!("bad time `{}`: {}", time_part, e))?;

        let sign = if offset_part.starts_with('-') { -1 } else { 1 };
        let digits = &offset_part[1..];
        let (hours, minutes) = digits
            .split_once(':')
            .ok_or_else(|| format!("bad offset `{}`", offset_part))?;
        let hours: i32 = hours.parse().map_err(|_| format!("bad offset `{}`", offset_part))?;
        let minutes: i32 = minutes
            .parse()
            .map_err(|_| format!("bad offset `{}`", offset_part))?;
        if hours > 23 || minutes > 59 {
            return Err(format!("offset `{}` out of range", offset_part));
        }

        let offset = FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .ok_or_else(|| format!("offset `{}` out of range", offset_part))?;
        Ok(Self { time, offset })
    }

    /// Compare `now` against today's target instant in the operand's offset.
    ///
    /// Returns whether the target has passed and the number of seconds until
    /// the next occurrence: the upcoming target when it is still ahead
    /// today, or tomorrow's when it has already passed.
    pub fn check(&self, now: DateTime<Utc>) -> (bool, i64) {
        let local_now = now.with_timezone(&self.offset);
        let target_local = local_now.date_naive().and_time(self.time);
        let target_utc_naive =
            target_local - Duration::seconds(self.offset.local_minus_utc() as i64);
        let target: DateTime<Utc> = DateTime::from_naive_utc_and_offset(target_utc_naive, Utc);

        if now >= target {
            let next = target + Duration::days(1);
            (true, (next - now).num_seconds())
        } else {
            (false, (target - now).num_seconds())
        }
    }
}

/// `AT_TIME {time}`: true iff now is at or past today's target.
#[derive(Debug, Clone, PartialEq)]
pub struct AtTime {
    pub time: TimeOfDay,
}

impl AtTime {
    pub fn parse(entry: &Value) -> Result<Self> {
        let raw = require_str(entry, "at_time", "time")?;
        let time = TimeOfDay::parse(&raw).map_err(|e| RuleError::validation("at_time", e))?;
        Ok(Self { time })
    }

    pub async fn evaluate(&self, rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        let (passed, delay) = self.time.check(Utc::now());
        // A one-shot rule answers with the state of the clock right now;
        // only periodic rules get re-parked for the next occurrence.
        if rule.periodic_execution {
            ctx.scheduler.park_for_retry(rule, delay.max(0) as u64).await;
        }
        Ok(passed)
    }
}

/// `AT_TIME_WITH_OCCURRENCE {time, occurrence}`: like `AT_TIME` but only
/// fires while the persisted occurrence counter is positive, decrementing it
/// on every true evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct AtTimeWithOccurrence {
    pub time: TimeOfDay,
    /// The `time` string as written, used to locate the document entry.
    pub raw_time: String,
    /// Occurrence count at compile time; the stored document is
    /// authoritative at evaluation time.
    pub occurrence: i64,
}

impl AtTimeWithOccurrence {
    pub fn parse(entry: &Value) -> Result<Self> {
        const OP: &str = "at_time_with_occurrence";
        let raw_time = require_str(entry, OP, "time")?;
        let time = TimeOfDay::parse(&raw_time).map_err(|e| RuleError::validation(OP, e))?;
        let occurrence = super::require_i64(entry, OP, "occurrence")?;
        if occurrence < 0 {
            return Err(RuleError::validation(OP, "`occurrence` must not be negative"));
        }
        Ok(Self { time, raw_time, occurrence })
    }

    /// The live occurrence value in the stored rule document, if the
    /// matching condition entry still exists.
    fn find_occurrence(&self, doc: &rulevm_store::RuleDocument) -> Option<i64> {
        doc.conditions.iter().find_map(|entry| {
            let operation = entry.get("operation")?.as_str()?;
            if !operation.eq_ignore_ascii_case("at_time_with_occurrence") {
                return None;
            }
            if entry.get("time")?.as_str()? != self.raw_time {
                return None;
            }
            entry.get("occurrence")?.as_i64()
        })
    }

    /// Write `remaining` back into the matching condition entry.
    async fn persist_occurrence(&self, rule: &Rule, ctx: &EvalContext, remaining: i64) {
        let doc = match ctx.store.get_rule(&rule.rule_id).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(rule_id = %rule.rule_id, "Occurrence writeback read failed: {}", e);
                return;
            }
        };
        let conditions: Vec<Value> = doc
            .conditions
            .iter()
            .map(|entry| {
                let matches = entry
                    .get("operation")
                    .and_then(|v| v.as_str())
                    .map(|op| op.eq_ignore_ascii_case("at_time_with_occurrence"))
                    .unwrap_or(false)
                    && entry.get("time").and_then(|v| v.as_str()) == Some(self.raw_time.as_str());
                if matches {
                    let mut updated = entry.clone();
                    if let Some(obj) = updated.as_object_mut() {
                        obj.insert("occurrence".to_string(), Value::from(remaining));
                    }
                    updated
                } else {
                    entry.clone()
                }
            })
            .collect();

        if let Err(e) = ctx
            .store
            .update_rule(&rule.rule_id, serde_json::json!({ "conditions": conditions }))
            .await
        {
            tracing::error!(rule_id = %rule.rule_id, "Occurrence writeback failed: {}", e);
        }
    }

    pub async fn evaluate(&self, rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        let live = if rule.is_immediate() {
            self.occurrence
        } else {
            let doc = ctx.store.get_rule(&rule.rule_id).await?;
            self.find_occurrence(&doc).unwrap_or(self.occurrence)
        };

        if live <= 0 {
            return Ok(false);
        }

        let (passed, delay) = self.time.check(Utc::now());
        if passed {
            let remaining = live - 1;
            if !rule.is_immediate() {
                self.persist_occurrence(rule, ctx, remaining).await;
            }
            if rule.periodic_execution && remaining > 0 {
                ctx.scheduler.park_for_retry(rule, delay.max(0) as u64).await;
            }
            Ok(true)
        } else {
            if rule.periodic_execution {
                ctx.scheduler.park_for_retry(rule, delay.max(0) as u64).await;
            }
            Ok(false)
        }
    }
}

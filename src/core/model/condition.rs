// src/core/model/condition.rs

//! Policy conditions and their evaluation against a connecting subject.
//!
//! Open question (see DESIGN.md): time conditions are evaluated in UTC and
//! the boundary is inclusive at exact equality (`start <= now <= end`).

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Allowed only within one or more daily windows on the given weekdays.
    TimeWindow {
        weekdays: Vec<Weekday>,
        start: NaiveTime,
        end: NaiveTime,
    },
    /// Allowed only before/after an absolute instant.
    TimeBefore { at: DateTime<Utc> },
    TimeAfter { at: DateTime<Utc> },
    /// Remote IP must fall within one of the given CIDR blocks.
    IpAllowlist { cidrs: Vec<ipnet::IpNet> },
    /// Posture tag (e.g. a device-management attestation) must be present.
    PostureRequired { tag: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolatedProperty {
    Time,
    RemoteIp,
    Posture,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Posture {
    pub tags: Vec<String>,
}

/// Everything a condition needs to know about the connecting client, gathered
/// once per evaluation (either at cache-build time or at a periodic recompute
/// tick).
#[derive(Debug, Clone)]
pub struct Subject {
    pub remote_ip: Option<IpAddr>,
    pub geo: Option<(f64, f64)>,
    pub posture: Posture,
    pub now: DateTime<Utc>,
}

impl Condition {
    /// Evaluates this condition against `subject`. Returns `None` when the
    /// condition holds, or `Some(violated)` describing which property failed.
    pub fn evaluate(&self, subject: &Subject) -> Option<ViolatedProperty> {
        match self {
            Condition::TimeWindow {
                weekdays,
                start,
                end,
            } => {
                let now = subject.now;
                let weekday = now.weekday();
                let time = now.time();
                let in_window = if start <= end {
                    time >= *start && time <= *end
                } else {
                    // Window wraps past midnight.
                    time >= *start || time <= *end
                };
                if weekdays.contains(&weekday) && in_window {
                    None
                } else {
                    Some(ViolatedProperty::Time)
                }
            }
            Condition::TimeBefore { at } => {
                if subject.now <= *at {
                    None
                } else {
                    Some(ViolatedProperty::Time)
                }
            }
            Condition::TimeAfter { at } => {
                if subject.now >= *at {
                    None
                } else {
                    Some(ViolatedProperty::Time)
                }
            }
            Condition::IpAllowlist { cidrs } => match subject.remote_ip {
                Some(ip) => {
                    if cidrs.iter().any(|net| net.contains(&ip)) {
                        None
                    } else {
                        Some(ViolatedProperty::RemoteIp)
                    }
                }
                None => Some(ViolatedProperty::RemoteIp),
            },
            Condition::PostureRequired { tag } => {
                if subject.posture.tags.iter().any(|t| t == tag) {
                    None
                } else {
                    Some(ViolatedProperty::Posture)
                }
            }
        }
    }

    /// The instant at which this condition's truth value next flips, if any.
    /// Used to bound `expires_at` for a granted authorization so that a
    /// client is re-evaluated at (or before) the boundary.
    pub fn next_boundary(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Condition::TimeWindow { start, end, .. } => {
                let today = now.date_naive();
                let candidates = [today.and_time(*start), today.and_time(*end)]
                    .into_iter()
                    .filter_map(|naive| naive.and_local_timezone(Utc).single())
                    .filter(|t| *t > now);
                candidates.min()
            }
            Condition::TimeBefore { at } | Condition::TimeAfter { at } => Some(*at),
            Condition::IpAllowlist { .. } | Condition::PostureRequired { .. } => None,
        }
    }
}

/// Evaluates every condition, returning the first violation encountered (if
/// any). Order doesn't affect correctness, only which violated property is
/// reported when several fail simultaneously.
pub fn evaluate_all(conditions: &[Condition], subject: &Subject) -> Vec<ViolatedProperty> {
    conditions
        .iter()
        .filter_map(|c| c.evaluate(subject))
        .collect()
}

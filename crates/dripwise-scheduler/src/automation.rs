//! Automation definitions: the per-tenant trigger/action graph.
//!
//! Node configs arrive as loosely typed JSON (`kind`, `triggerKind`,
//! `scheduleMode`, ...). They are validated and normalized once, when a stored
//! record is turned into an [`Automation`], so the runners only ever see typed
//! [`TriggerSpec`]s.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dripwise_core::types::TriggerKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::occurrence::{self, EveryUnit, ScheduleConfig};

/// A graph node exactly as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: Value,
}

/// Stored automation document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub enabled: bool,
    pub nodes: Vec<RawNode>,
}

/// Normalized trigger condition.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSpec {
    pub kind: TriggerKind,
    /// Present only for `scheduled_time` triggers.
    pub schedule: Option<ScheduleConfig>,
}

#[derive(Debug, Clone)]
pub enum NodeRole {
    Trigger(TriggerSpec),
    Action,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub role: NodeRole,
}

/// A tenant-owned automation with normalized nodes.
#[derive(Debug, Clone)]
pub struct Automation {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub enabled: bool,
    pub nodes: Vec<Node>,
}

impl Automation {
    /// Normalize a stored record. Duplicate node ids keep the first occurrence.
    pub fn from_record(record: &AutomationRecord) -> Self {
        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(record.nodes.len());
        for raw in &record.nodes {
            if !seen.insert(raw.id.as_str()) {
                tracing::warn!(
                    "Automation {} has duplicate node id '{}', ignoring the copy",
                    record.id,
                    raw.id
                );
                continue;
            }
            let role = match parse_trigger(raw) {
                Some(spec) => NodeRole::Trigger(spec),
                None => NodeRole::Action,
            };
            nodes.push(Node {
                id: raw.id.clone(),
                role,
            });
        }
        Self {
            id: record.id.clone(),
            owner_id: record.owner_id.clone(),
            name: record.name.clone(),
            enabled: record.enabled,
            nodes,
        }
    }

    /// All trigger nodes with their specs.
    pub fn triggers(&self) -> impl Iterator<Item = (&str, &TriggerSpec)> {
        self.nodes.iter().filter_map(|n| match &n.role {
            NodeRole::Trigger(spec) => Some((n.id.as_str(), spec)),
            NodeRole::Action => None,
        })
    }

    /// Trigger nodes that fire on a time schedule.
    pub fn scheduled_triggers(&self) -> impl Iterator<Item = (&str, &ScheduleConfig)> {
        self.triggers().filter_map(|(id, spec)| match (&spec.kind, &spec.schedule) {
            (TriggerKind::ScheduledTime, Some(schedule)) => Some((id, schedule)),
            _ => None,
        })
    }

    /// Trigger nodes listening for a given event kind.
    pub fn triggers_of_kind<'a>(&'a self, kind: &'a TriggerKind) -> impl Iterator<Item = &'a str> {
        self.triggers()
            .filter(move |(_, spec)| &spec.kind == kind)
            .map(|(id, _)| id)
    }
}

/// Key of a trigger node in a tenant's schedule-state map.
pub fn schedule_key(automation_id: &str, node_id: &str) -> String {
    format!("{automation_id}:{node_id}")
}

/// A tenant's last-fired timestamps, keyed by [`schedule_key`].
///
/// Runners stamp a working copy during a pass and persist only the changed
/// entries, in one write, once the tenant is done.
#[derive(Debug, Clone, Default)]
pub struct ScheduleState {
    entries: HashMap<String, DateTime<Utc>>,
    changed: HashSet<String>,
}

impl ScheduleState {
    pub fn from_entries(entries: HashMap<String, DateTime<Utc>>) -> Self {
        Self {
            entries,
            changed: HashSet::new(),
        }
    }

    pub fn last_fired(&self, automation_id: &str, node_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(&schedule_key(automation_id, node_id)).copied()
    }

    pub fn stamp(&mut self, automation_id: &str, node_id: &str, at: DateTime<Utc>) {
        let key = schedule_key(automation_id, node_id);
        self.entries.insert(key.clone(), at);
        self.changed.insert(key);
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    /// Entries stamped since load, in key order.
    pub fn changes(&self) -> Vec<(&str, DateTime<Utc>)> {
        let mut out: Vec<_> = self
            .changed
            .iter()
            .filter_map(|k| self.entries.get(k).map(|at| (k.as_str(), *at)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn str_field<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str).map(str::trim)
}

/// Numbers sometimes arrive as strings from form inputs.
fn int_field(config: &Value, key: &str) -> Option<i64> {
    let v = config.get(key)?;
    v.as_i64()
        .or_else(|| v.as_f64().map(|f| f as i64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn parse_trigger(raw: &RawNode) -> Option<TriggerSpec> {
    if raw.node_type != "trigger" {
        return None;
    }
    let kind_field = str_field(&raw.config, "kind").unwrap_or("trigger");
    if kind_field != "trigger" {
        return None;
    }
    let kind = TriggerKind::parse(str_field(&raw.config, "triggerKind").unwrap_or(""));
    let schedule = match kind {
        TriggerKind::ScheduledTime => Some(parse_schedule(&raw.config)),
        _ => None,
    };
    Some(TriggerSpec { kind, schedule })
}

fn parse_unit(raw: &str) -> EveryUnit {
    match raw.to_ascii_lowercase().as_str() {
        "minute" | "minutes" => EveryUnit::Minutes,
        "day" | "days" => EveryUnit::Days,
        "week" | "weeks" => EveryUnit::Weeks,
        "month" | "months" => EveryUnit::Months,
        other => {
            tracing::warn!("Unknown everyUnit '{}', using days", other);
            EveryUnit::Days
        }
    }
}

/// Normalize a `scheduled_time` node config. Never fails: malformed values
/// fall back to defaults.
pub fn parse_schedule(config: &Value) -> ScheduleConfig {
    let mode = str_field(config, "scheduleMode").unwrap_or("");
    if mode == "specific" {
        let at = occurrence::parse_time_of_day(str_field(config, "specificTime").unwrap_or(""));
        return match str_field(config, "specificKind").unwrap_or("daily") {
            "weekly" => ScheduleConfig::weekly(int_field(config, "specificWeekday").unwrap_or(1), at),
            "monthly" => {
                ScheduleConfig::monthly(int_field(config, "specificDayOfMonth").unwrap_or(1), at)
            }
            _ => ScheduleConfig::daily(at),
        };
    }

    if let Some(value) = int_field(config, "everyValue") {
        let unit = parse_unit(str_field(config, "everyUnit").unwrap_or("days"));
        return ScheduleConfig::every(value, unit);
    }

    // Legacy: a bare interval in minutes, clamped like `everyValue`.
    if let Some(minutes) = int_field(config, "intervalMinutes") {
        return ScheduleConfig::every(minutes, EveryUnit::Minutes);
    }

    ScheduleConfig::every(1, EveryUnit::Days)
}

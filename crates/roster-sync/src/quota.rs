//! Weighted per-agent quotas and candidate selection for admission.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveDate};
use chrono_tz::Tz;
use roster_core::SourceRecord;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightPolicy {
    pub base: f64,
    pub effective: f64,
    pub settled: f64,
    pub effective_activity: String,
    pub settled_status: String,
}

impl Default for WeightPolicy {
    fn default() -> Self {
        Self {
            base: 1.0,
            effective: 2.0,
            settled: 3.0,
            effective_activity: "EFECTIVA".to_string(),
            settled_status: "LIQUIDADO".to_string(),
        }
    }
}

impl WeightPolicy {
    pub fn is_effective(&self, record: &SourceRecord) -> bool {
        record.activity_is(&self.effective_activity)
    }

    pub fn is_settled(&self, record: &SourceRecord) -> bool {
        self.is_effective(record) && record.status_is(&self.settled_status)
    }

    pub fn weight(&self, record: &SourceRecord) -> f64 {
        if self.is_settled(record) {
            self.settled
        } else if self.is_effective(record) {
            self.effective
        } else {
            self.base
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarryOverPredicate {
    /// Activity type matches the effective value.
    Effective,
    /// Effective activity whose status is also settled.
    Settled,
}

/// Extends the window backwards to rows that satisfy a high-value predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarryOverRule {
    pub lookback_days: u32,
    pub predicate: CarryOverPredicate,
}

#[derive(Debug, Clone)]
pub struct ProcessingWindow {
    today: NaiveDate,
    carry_over: Option<CarryOverRule>,
}

impl ProcessingWindow {
    pub fn new(now: DateTime<Tz>, carry_over: Option<CarryOverRule>) -> Self {
        Self {
            today: now.date_naive(),
            carry_over,
        }
    }

    pub fn contains(&self, record: &SourceRecord, weights: &WeightPolicy) -> bool {
        let Some(inserted_at) = &record.inserted_at else {
            return false;
        };
        let date = inserted_at.date_naive();
        if date == self.today {
            return true;
        }
        let Some(rule) = &self.carry_over else {
            return false;
        };
        let earliest = self.today - Duration::days(i64::from(rule.lookback_days));
        if date >= self.today || date < earliest {
            return false;
        }
        match rule.predicate {
            CarryOverPredicate::Effective => weights.is_effective(record),
            CarryOverPredicate::Settled => weights.is_settled(record),
        }
    }

    pub fn select<'a>(&self, records: &'a [SourceRecord], weights: &WeightPolicy) -> Vec<&'a SourceRecord> {
        records
            .iter()
            .filter(|record| self.contains(record, weights))
            .collect()
    }
}

/// Sum of weights per agent, truncated to an integer.
pub fn compute_quotas(window: &[&SourceRecord], weights: &WeightPolicy) -> BTreeMap<String, u64> {
    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    for record in window {
        *sums.entry(record.agent_id.clone()).or_default() += weights.weight(record);
    }
    sums.into_iter()
        .map(|(agent, sum)| (agent, if sum > 0.0 { sum.trunc() as u64 } else { 0 }))
        .collect()
}

/// Highest tier among window rows; `None` when the window is empty.
pub fn tier_ceiling(window: &[&SourceRecord]) -> Option<u32> {
    window.iter().map(|record| record.tier).max()
}

/// A not-yet-admitted key reduced over all of its source rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub key: String,
    pub tier: u32,
    pub earliest: Option<DateTime<Tz>>,
    pub agent: String,
    pub first_seen: usize,
}

impl Candidate {
    fn priority(&self, other: &Self) -> Ordering {
        self.tier
            .cmp(&other.tier)
            .then_with(|| match (&self.earliest, &other.earliest) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| self.first_seen.cmp(&other.first_seen))
    }
}

struct CandidateAccumulator {
    tier: u32,
    earliest: Option<DateTime<Tz>>,
    first_seen: usize,
    /// agent -> (rows, first position)
    agents: Vec<(String, usize, usize)>,
}

impl CandidateAccumulator {
    fn modal_agent(&self) -> String {
        self.agents
            .iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.2.cmp(&a.2)))
            .map(|(agent, _, _)| agent.clone())
            .unwrap_or_default()
    }
}

/// Groups every source row whose key is not excluded into one candidate per
/// key: minimum tier, earliest instant, modal agent (first seen on ties).
pub fn build_candidates(records: &[SourceRecord], excluded: &HashSet<String>) -> Vec<Candidate> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, CandidateAccumulator> = HashMap::new();

    for record in records {
        if excluded.contains(&record.key) {
            continue;
        }
        let acc = groups.entry(record.key.as_str()).or_insert_with(|| {
            order.push(record.key.as_str());
            CandidateAccumulator {
                tier: record.tier,
                earliest: None,
                first_seen: record.position,
                agents: Vec::new(),
            }
        });
        acc.tier = acc.tier.min(record.tier);
        acc.earliest = match (acc.earliest.take(), record.inserted_at.clone()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match acc.agents.iter_mut().find(|(agent, _, _)| *agent == record.agent_id) {
            Some(entry) => entry.1 += 1,
            None => acc.agents.push((record.agent_id.clone(), 1, record.position)),
        }
    }

    order
        .into_iter()
        .filter_map(|key| {
            groups.get(key).map(|acc| Candidate {
                key: key.to_string(),
                tier: acc.tier,
                earliest: acc.earliest.clone(),
                agent: acc.modal_agent(),
                first_seen: acc.first_seen,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    /// Admitted keys in selection order.
    pub selected: Vec<String>,
    pub per_agent: BTreeMap<String, usize>,
}

impl Allocation {
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.selected.iter().any(|k| k == key)
    }
}

/// Walks agents in ascending order and, per agent, tiers from lowest to
/// highest, taking the oldest candidates until the quota runs out.
pub fn allocate(
    quotas: &BTreeMap<String, u64>,
    candidates: &[Candidate],
    max_tier: Option<u32>,
) -> Allocation {
    let mut by_agent: BTreeMap<&str, Vec<&Candidate>> = BTreeMap::new();
    for candidate in candidates {
        if max_tier.is_some_and(|max| candidate.tier > max) {
            continue;
        }
        by_agent.entry(candidate.agent.as_str()).or_default().push(candidate);
    }
    for list in by_agent.values_mut() {
        list.sort_by(|a, b| a.priority(b));
    }

    let mut allocation = Allocation::default();
    let mut used: HashSet<&str> = HashSet::new();

    for (agent, quota) in quotas {
        let mut remaining = *quota as usize;
        if remaining == 0 {
            continue;
        }
        let Some(pool) = by_agent.get(agent.as_str()) else {
            continue;
        };
        let tiers: BTreeSet<u32> = pool.iter().map(|c| c.tier).collect();
        for tier in tiers {
            if remaining == 0 {
                break;
            }
            let taken: Vec<&Candidate> = pool
                .iter()
                .filter(|c| c.tier == tier && !used.contains(c.key.as_str()))
                .take(remaining)
                .copied()
                .collect();
            for candidate in taken {
                used.insert(candidate.key.as_str());
                allocation.selected.push(candidate.key.clone());
                *allocation.per_agent.entry(agent.clone()).or_default() += 1;
                remaining -= 1;
            }
        }
        debug!(agent = %agent, quota, admitted = allocation.per_agent.get(agent).copied().unwrap_or(0), "agent allocation");
    }

    allocation
}

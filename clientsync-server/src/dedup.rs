//! Display-level dedup ranking
//!
//! Buckets records by fuzzy key and picks one winner per bucket for a given
//! viewing scope. Suppressed members stay in the dataset; they are only left
//! out of this particular view. Must be re-run per scope: a record suppressed
//! in the owner-scoped view may win the unscoped one.
//!
//! # Winner precedence (descending)
//! 1. `is_mine`: owner matches the viewer (owner-scoped only)
//! 2. status rank: Claimed > Triaged > Unclaimed
//! 3. `is_newer_source`: record comes from the preferred source
//! 4. touchpoint timestamp
//!
//! Exact ties keep the earliest member in input order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use clientsync_common::config::DedupConfig;
use clientsync_common::time::day_key;
use serde::{Deserialize, Serialize};

use crate::identity::IdentityRules;
use crate::model::RawRecord;

/// Viewing scope a dedup pass runs under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "kebab-case")]
pub enum DedupScope {
    /// Buckets split per owner; `viewer` is the acting point-of-contact identity
    OwnerScoped { viewer: String },
    /// Buckets collapse across owners
    Unscoped,
}

/// Source preference used by the ranking
#[derive(Debug, Clone)]
pub struct DedupPolicy {
    preferred_source: String,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self::from(&DedupConfig::default())
    }
}

impl From<&DedupConfig> for DedupPolicy {
    fn from(config: &DedupConfig) -> Self {
        Self {
            preferred_source: config.preferred_source.trim().to_lowercase(),
        }
    }
}

impl DedupPolicy {
    pub fn is_newer_source(&self, source_tag: &str) -> bool {
        !self.preferred_source.is_empty()
            && source_tag.trim().to_lowercase() == self.preferred_source
    }
}

/// One bucket of fuzzy duplicates and its chosen winner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FuzzyBucket {
    pub key: String,
    /// Input order
    pub members: Vec<RawRecord>,
    pub winner: RawRecord,
    pub suppressed_count: usize,
}

/// Field order is precedence order; derived `Ord` compares lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RankKey {
    is_mine: bool,
    status_rank: u8,
    is_newer_source: bool,
    timestamp: Option<DateTime<Utc>>,
}

fn normalize_owner(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// `contact|owner|day` (owner segment omitted when unscoped)
pub fn fuzzy_key(rules: &IdentityRules, record: &RawRecord, scope: &DedupScope) -> String {
    let contact = rules.normalized_contact(record);
    let day = day_key(record.touchpoint_date.as_ref());
    match scope {
        DedupScope::OwnerScoped { .. } => {
            format!("{}|{}|{}", contact, normalize_owner(&record.point_of_contact), day)
        }
        DedupScope::Unscoped => format!("{}|{}", contact, day),
    }
}

fn rank(
    rules: &IdentityRules,
    policy: &DedupPolicy,
    record: &RawRecord,
    viewer: Option<&str>,
) -> RankKey {
    let is_mine = match viewer {
        Some(v) if !v.is_empty() => normalize_owner(&record.point_of_contact) == v,
        _ => false,
    };
    RankKey {
        is_mine,
        status_rank: rules.claim_state(&record.point_of_contact).rank(),
        is_newer_source: policy.is_newer_source(&record.source_tag),
        timestamp: record.touchpoint_date,
    }
}

/// Bucket `records` under `scope` and choose a winner per bucket
///
/// Buckets come back in order of first appearance. Records with no usable
/// contact are left out, as grouping drops them.
pub fn resolve_buckets(
    rules: &IdentityRules,
    policy: &DedupPolicy,
    records: &[RawRecord],
    scope: &DedupScope,
) -> Vec<FuzzyBucket> {
    let viewer = match scope {
        DedupScope::OwnerScoped { viewer } => Some(normalize_owner(viewer)),
        DedupScope::Unscoped => None,
    };

    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Vec<&RawRecord>> = HashMap::new();
    for record in records {
        if rules.normalized_contact(record).is_empty() {
            continue;
        }
        let key = fuzzy_key(rules, record, scope);
        buckets
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(record);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let members = buckets.remove(&key)?;
            let mut best = 0;
            let mut best_rank = rank(rules, policy, members[0], viewer.as_deref());
            for (i, member) in members.iter().enumerate().skip(1) {
                let r = rank(rules, policy, member, viewer.as_deref());
                if r > best_rank {
                    best = i;
                    best_rank = r;
                }
            }
            Some(FuzzyBucket {
                winner: members[best].clone(),
                suppressed_count: members.len() - 1,
                members: members.into_iter().cloned().collect(),
                key,
            })
        })
        .collect()
}

/// Ids of every non-winning member across `buckets`
pub fn suppressed_ids(buckets: &[FuzzyBucket]) -> Vec<String> {
    let mut ids = Vec::new();
    for bucket in buckets {
        let mut winner_seen = false;
        for member in &bucket.members {
            if !winner_seen && *member == bucket.winner {
                winner_seen = true;
                continue;
            }
            ids.push(member.id.clone());
        }
    }
    ids
}

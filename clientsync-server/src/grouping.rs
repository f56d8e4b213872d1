//! Grouping engine
//!
//! Folds a batch of raw records into client groups keyed by
//! [`IdentityRules::resolve`]. Pure and synchronous; running it twice on the
//! same batch yields identical keys, group order and record order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::identity::{IdentityKey, IdentityRules};
use crate::model::RawRecord;

/// Records believed to describe one prospect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientGroup {
    pub client_key: String,
    /// Display name of the most recent contributing record
    pub client_name: String,
    /// Display email of the most recent contributing record
    pub client_email: String,
    /// Newest first
    pub records: Vec<RawRecord>,
    pub latest_date: Option<DateTime<Utc>>,
    /// Distinct areas of work in first-seen order
    pub areas: Vec<String>,
    /// Built from shared-identifier override records
    pub shared: bool,
}

impl ClientGroup {
    fn seed(rules: &IdentityRules, key: IdentityKey, record: &RawRecord) -> Self {
        let mut group = Self {
            client_name: rules.display_name(record, &key),
            client_email: rules.display_email(record, &key),
            client_key: key.key,
            records: vec![record.clone()],
            latest_date: record.touchpoint_date,
            areas: Vec::new(),
            shared: key.shared,
        };
        group.add_area(&record.area_of_work);
        group
    }

    fn merge(&mut self, rules: &IdentityRules, key: &IdentityKey, record: &RawRecord) {
        // Display identity follows the most recent contact, not arrival order
        if record.touchpoint_date > self.latest_date {
            self.client_name = rules.display_name(record, key);
            self.client_email = rules.display_email(record, key);
            self.latest_date = record.touchpoint_date;
        }
        self.shared |= key.shared;
        self.add_area(&record.area_of_work);
        self.records.push(record.clone());
    }

    fn add_area(&mut self, area: &str) {
        let area = area.trim();
        if !area.is_empty() && !self.areas.iter().any(|a| a == area) {
            self.areas.push(area.to_string());
        }
    }

    /// Whether the view shows this as a group rather than a bare record
    ///
    /// Shared-identifier groups always render as groups, even with one member.
    pub fn renders_as_group(&self) -> bool {
        self.shared || self.records.len() > 1
    }
}

/// One rendered entry of a grouped view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ClientEntry {
    Group(ClientGroup),
    Single(RawRecord),
}

/// Output of [`group_records`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupingReport {
    /// Sorted by `latest_date` descending
    pub groups: Vec<ClientGroup>,
    /// Records with no usable identity key
    pub dropped: usize,
    pub dropped_ids: Vec<String>,
}

impl GroupingReport {
    /// Groups in display form, collapsing plain single-record groups
    pub fn render_entries(&self) -> Vec<ClientEntry> {
        self.groups
            .iter()
            .map(|group| {
                if group.renders_as_group() {
                    ClientEntry::Group(group.clone())
                } else {
                    ClientEntry::Single(group.records[0].clone())
                }
            })
            .collect()
    }
}

/// Group a batch of records by identity key
pub fn group_records(rules: &IdentityRules, records: &[RawRecord]) -> GroupingReport {
    let mut groups: Vec<ClientGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut dropped_ids = Vec::new();

    for record in records {
        let Some(key) = rules.resolve(record) else {
            dropped_ids.push(record.id.clone());
            continue;
        };

        match index.get(&key.key) {
            Some(&pos) => groups[pos].merge(rules, &key, record),
            None => {
                index.insert(key.key.clone(), groups.len());
                groups.push(ClientGroup::seed(rules, key, record));
            }
        }
    }

    for group in &mut groups {
        group
            .records
            .sort_by(|a, b| b.touchpoint_date.cmp(&a.touchpoint_date));
    }
    groups.sort_by(|a, b| {
        b.latest_date
            .cmp(&a.latest_date)
            .then_with(|| a.client_key.cmp(&b.client_key))
    });

    if !dropped_ids.is_empty() {
        debug!(
            dropped = dropped_ids.len(),
            total = records.len(),
            "Dropped records without a usable identity key"
        );
    }

    GroupingReport {
        groups,
        dropped: dropped_ids.len(),
        dropped_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn day(y: i32, m: u32, d: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap())
    }

    fn record(
        id: &str,
        email: &str,
        first: &str,
        last: &str,
        date: Option<DateTime<Utc>>,
    ) -> RawRecord {
        RawRecord {
            id: id.to_string(),
            email: email.to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            touchpoint_date: date,
            ..Default::default()
        }
    }

    fn grouped_records(report: &GroupingReport) -> usize {
        report.groups.iter().map(|g| g.records.len()).sum()
    }

    #[test]
    fn test_shared_prospect_scenario() {
        let rules = IdentityRules::default();
        let batch = vec![
            record("28609", "andy@x.com", "Andy", "Gelder", day(2024, 1, 1)),
            record("28609", "prospects@helix.example", "Matt", "Talaie", day(2024, 2, 1)),
        ];

        let report = group_records(&rules, &batch);
        assert_eq!(report.groups.len(), 1);
        let group = &report.groups[0];
        assert_eq!(group.client_key, "id:28609");
        assert_eq!(group.records.len(), 2);
        assert_eq!(group.latest_date, day(2024, 2, 1));
        assert_eq!(group.client_name, "Shared Prospect 28609");
        assert_eq!(group.client_email, "prospects@helix.example");
        assert_eq!(group.records[0].first_name, "Matt");
    }

    #[test]
    fn test_case_insensitive_email_merge() {
        let rules = IdentityRules::default();
        let batch = vec![
            record("1", "bob@x.com", "Bob", "Stone", day(2024, 1, 1)),
            record("2", "BOB@X.COM ", "Bob", "Stone", day(2024, 1, 2)),
        ];
        let report = group_records(&rules, &batch);
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].records.len(), 2);
    }

    #[test]
    fn test_display_identity_follows_newest_record() {
        let rules = IdentityRules::default();
        let batch = vec![
            record("2", "kim@x.com", "Kimberly", "Lee", day(2024, 3, 1)),
            record("1", "kim@x.com", "Kim", "Lee", day(2024, 1, 1)),
        ];
        let report = group_records(&rules, &batch);
        let group = &report.groups[0];
        assert_eq!(group.client_name, "Kimberly Lee");
        assert_eq!(group.latest_date, day(2024, 3, 1));
        assert_eq!(group.records[0].id, "2");
        assert_eq!(group.records[1].id, "1");
    }

    #[test]
    fn test_equal_date_does_not_replace_display() {
        let rules = IdentityRules::default();
        let batch = vec![
            record("1", "kim@x.com", "First", "Seen", day(2024, 1, 1)),
            record("2", "kim@x.com", "Second", "Seen", day(2024, 1, 1)),
        ];
        let report = group_records(&rules, &batch);
        assert_eq!(report.groups[0].client_name, "First Seen");
    }

    #[test]
    fn test_areas_are_distinct_in_first_seen_order() {
        let rules = IdentityRules::default();
        let mut a = record("1", "a@x.com", "A", "A", day(2024, 1, 1));
        a.area_of_work = "Tax".to_string();
        let mut b = record("2", "a@x.com", "A", "A", day(2024, 1, 2));
        b.area_of_work = "Audit".to_string();
        let mut c = record("3", "a@x.com", "A", "A", day(2024, 1, 3));
        c.area_of_work = "Tax".to_string();
        let d = record("4", "a@x.com", "A", "A", day(2024, 1, 4));

        let report = group_records(&rules, &[a, b, c, d]);
        assert_eq!(report.groups[0].areas, vec!["Tax", "Audit"]);
    }

    #[test]
    fn test_groups_sorted_newest_first() {
        let rules = IdentityRules::default();
        let batch = vec![
            record("1", "old@x.com", "O", "O", day(2023, 1, 1)),
            record("2", "new@x.com", "N", "N", day(2024, 6, 1)),
            record("3", "undated@x.com", "U", "U", None),
            record("4", "mid@x.com", "M", "M", day(2024, 1, 1)),
        ];
        let report = group_records(&rules, &batch);
        let keys: Vec<_> = report.groups.iter().map(|g| g.client_key.as_str()).collect();
        assert_eq!(keys, vec!["new@x.com", "mid@x.com", "old@x.com", "undated@x.com"]);
    }

    #[test]
    fn test_unidentifiable_records_are_counted() {
        let rules = IdentityRules::default();
        let batch = vec![
            record("", "", "", "", day(2024, 1, 1)),
            record("9", "z@x.com", "Z", "Z", day(2024, 1, 1)),
        ];
        let report = group_records(&rules, &batch);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.dropped_ids, vec![""]);
        assert_eq!(grouped_records(&report), 1);
    }

    #[test]
    fn test_coverage_each_record_in_exactly_one_group() {
        let rules = IdentityRules::default();
        let batch = vec![
            record("1", "a@x.com", "A", "A", day(2024, 1, 1)),
            record("2", "b@x.com", "B", "B", day(2024, 1, 2)),
            record("3", "A@x.com", "A", "A", day(2024, 1, 3)),
            record("28609", "c@x.com", "C", "C", day(2024, 1, 4)),
            record("5", "info@x.com", "Dee", "Dee", day(2024, 1, 5)),
            record("", "", "", "", None),
        ];
        let report = group_records(&rules, &batch);
        assert_eq!(grouped_records(&report) + report.dropped, batch.len());

        let mut seen = HashSet::new();
        for group in &report.groups {
            for r in &group.records {
                assert!(seen.insert(r.id.clone()), "record {} grouped twice", r.id);
                assert_eq!(rules.resolve(r).unwrap().key, group.client_key);
            }
        }
    }

    #[test]
    fn test_idempotent() {
        let rules = IdentityRules::default();
        let batch = vec![
            record("1", "a@x.com", "A", "A", day(2024, 1, 1)),
            record("2", "b@x.com", "B", "B", day(2024, 1, 1)),
            record("3", "a@x.com", "A", "A", day(2024, 1, 1)),
            record("4", "", "Solo", "Person", None),
        ];
        let first = group_records(&rules, &batch);
        let second = group_records(&rules, &batch);
        assert_eq!(first, second);
    }

    #[test]
    fn test_shared_single_record_renders_as_group() {
        let rules = IdentityRules::default();
        let batch = vec![
            record("28609", "andy@x.com", "Andy", "Gelder", day(2024, 1, 1)),
            record("7", "solo@x.com", "Solo", "S", day(2024, 1, 2)),
        ];
        let report = group_records(&rules, &batch);
        let entries = report.render_entries();
        assert!(matches!(&entries[0], ClientEntry::Single(r) if r.id == "7"));
        assert!(matches!(&entries[1], ClientEntry::Group(g) if g.client_key == "id:28609"));
    }
}

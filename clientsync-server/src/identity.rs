//! Identity key resolution
//!
//! Maps a [`RawRecord`] to the non-unique key records are grouped under.
//!
//! # Resolution order
//! 1. Shared-identifier override: `id:{id}`, displayed as a synthetic shared
//!    prospect. Wins even when emails differ, because shared-inbox noise is
//!    known to fragment these ids.
//! 2. Generic/team mailbox with a usable name: the normalized name, so distinct
//!    people funnelled through one shared inbox stay apart.
//! 3. Normalized email, then normalized name, then `id:{id}`.
//!
//! A record matching none of these has no key and is dropped by the caller.

use std::collections::HashSet;

use clientsync_common::config::IdentityConfig;

use crate::model::{ClaimState, RawRecord};

/// Resolved grouping key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub key: String,
    /// Produced by the shared-identifier override
    pub shared: bool,
}

/// Trim and lowercase an email address
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// `first last`, each part trimmed and lowercased, result trimmed
pub fn normalize_name(first: &str, last: &str) -> String {
    format!(
        "{} {}",
        first.to_lowercase().trim(),
        last.to_lowercase().trim()
    )
    .trim()
    .to_string()
}

/// Identity rules: override ids and shared-inbox detection
#[derive(Debug, Clone)]
pub struct IdentityRules {
    shared_ids: HashSet<String>,
    generic_local_parts: HashSet<String>,
    generic_addresses: HashSet<String>,
    shared_mailbox: String,
}

impl Default for IdentityRules {
    fn default() -> Self {
        Self::from(&IdentityConfig::default())
    }
}

impl From<&IdentityConfig> for IdentityRules {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            shared_ids: config
                .shared_ids
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            generic_local_parts: config
                .generic_local_parts
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            generic_addresses: config
                .generic_addresses
                .iter()
                .map(|a| normalize_email(a))
                .filter(|a| !a.is_empty())
                .collect(),
            shared_mailbox: config.shared_mailbox.clone(),
        }
    }
}

impl IdentityRules {
    /// Whether `id` is in the shared-identifier override set
    pub fn is_shared_id(&self, id: &str) -> bool {
        self.shared_ids.contains(id.trim())
    }

    /// Whether an already-normalized address is a shared/team inbox
    ///
    /// Plus-addressing is ignored: `sales+web@acme.test` counts as `sales`.
    pub fn is_generic_mailbox(&self, normalized_email: &str) -> bool {
        if normalized_email.is_empty() {
            return false;
        }
        if self.generic_addresses.contains(normalized_email) {
            return true;
        }
        let Some((local, _domain)) = normalized_email.split_once('@') else {
            return false;
        };
        let local = local.split('+').next().unwrap_or(local);
        self.generic_local_parts.contains(local)
    }

    /// Grouping key for `record`, or `None` when unidentifiable
    pub fn resolve(&self, record: &RawRecord) -> Option<IdentityKey> {
        let email = normalize_email(&record.email);
        let name = normalize_name(&record.first_name, &record.last_name);
        let id = record.id.trim();

        if !id.is_empty() && self.is_shared_id(id) {
            return Some(IdentityKey {
                key: format!("id:{}", id),
                shared: true,
            });
        }

        if !name.is_empty() && self.is_generic_mailbox(&email) {
            return Some(IdentityKey {
                key: name,
                shared: false,
            });
        }

        let key = if !email.is_empty() {
            email
        } else if !name.is_empty() {
            name
        } else if !id.is_empty() {
            format!("id:{}", id)
        } else {
            return None;
        };

        Some(IdentityKey { key, shared: false })
    }

    /// Normalized contact used for display-level bucketing: email, name, then id
    ///
    /// A shared team mailbox yields to the person's name, as in [`Self::resolve`].
    pub fn normalized_contact(&self, record: &RawRecord) -> String {
        let email = normalize_email(&record.email);
        let name = normalize_name(&record.first_name, &record.last_name);
        if !name.is_empty() && self.is_generic_mailbox(&email) {
            return name;
        }
        if !email.is_empty() {
            return email;
        }
        if !name.is_empty() {
            return name;
        }
        let id = record.id.trim();
        if id.is_empty() {
            String::new()
        } else {
            format!("id:{}", id)
        }
    }

    /// Display name for a record under its resolved key
    pub fn display_name(&self, record: &RawRecord, key: &IdentityKey) -> String {
        if key.shared {
            return format!("Shared Prospect {}", record.id.trim());
        }
        let name = format!("{} {}", record.first_name.trim(), record.last_name.trim())
            .trim()
            .to_string();
        if name.is_empty() {
            record.email.trim().to_string()
        } else {
            name
        }
    }

    /// Display email for a record under its resolved key
    pub fn display_email(&self, record: &RawRecord, key: &IdentityKey) -> String {
        if key.shared {
            self.shared_mailbox.clone()
        } else {
            record.email.trim().to_string()
        }
    }

    /// Claim state of a point-of-contact value
    pub fn claim_state(&self, point_of_contact: &str) -> ClaimState {
        let poc = point_of_contact.trim().to_lowercase();
        if poc.is_empty() || self.is_generic_mailbox(&poc) {
            ClaimState::Unclaimed
        } else if poc.contains("triage") {
            ClaimState::Triaged
        } else {
            ClaimState::Claimed
        }
    }
}

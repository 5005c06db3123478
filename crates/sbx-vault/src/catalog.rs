//! Catalog of secret records and the last-write-wins merge.
//!
//! The same [`Catalog::merge`] runs on the client (local vault vs downloaded
//! archive) and on the server (stored archive vs uploaded archive), so it has
//! to be deterministic: for every ID the record with the strictly later
//! `last_modified` wins, ties keep side `a`, and tombstoned winners are
//! dropped from the output.

use chrono::{DateTime, Utc};
use sbx_crypto::CipherMeta;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::kinds::SecretKind;

/// Metadata for one secret. The blob itself lives under `data/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: String,
    pub kind: SecretKind,
    #[serde(default)]
    pub description: String,
    /// SHA-256 (hex) of the encrypted blob
    pub digest: String,
    pub meta: CipherMeta,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub tombstoned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    records: Vec<SecretRecord>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<SecretRecord>) -> Self {
        Self { records }
    }

    pub fn get(&self, id: &str) -> Option<&SecretRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SecretRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    /// Replace the record with the same ID, or append a new one.
    pub fn upsert(&mut self, record: SecretRecord) {
        match self.get_mut(&record.id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SecretRecord> {
        self.records.iter()
    }

    /// Records that are not tombstoned.
    pub fn live(&self) -> impl Iterator<Item = &SecretRecord> {
        self.records.iter().filter(|r| !r.tombstoned)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Latest `last_modified` across all records, tombstones included.
    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.records.iter().map(|r| r.last_modified).max()
    }

    /// Merge two catalogs into a new one.
    ///
    /// The output holds one record per ID, none tombstoned, sorted by
    /// descending `last_modified` (ID ascending among equal timestamps).
    pub fn merge(a: &Catalog, b: &Catalog) -> Catalog {
        let mut winners: HashMap<&str, &SecretRecord> =
            HashMap::with_capacity(a.len() + b.len());

        for record in a.iter().chain(b.iter()) {
            match winners.entry(record.id.as_str()) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(mut slot) => {
                    if record.last_modified > slot.get().last_modified {
                        slot.insert(record);
                    }
                }
            }
        }

        let mut records: Vec<SecretRecord> = winners
            .into_values()
            .filter(|r| !r.tombstoned)
            .cloned()
            .collect();
        records.sort_by(|x, y| {
            y.last_modified
                .cmp(&x.last_modified)
                .then_with(|| x.id.cmp(&y.id))
        });
        records.shrink_to_fit();

        Catalog { records }
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a SecretRecord;
    type IntoIter = std::slice::Iter<'a, SecretRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(id: &str, secs: i64, tombstoned: bool) -> SecretRecord {
        SecretRecord {
            id: id.to_string(),
            kind: SecretKind::Binary,
            description: format!("{id}@{secs}"),
            digest: format!("{id:0>64}"),
            meta: CipherMeta::from_bytes(vec![0; 16]),
            last_modified: ts(secs),
            tombstoned,
        }
    }

    fn catalog(records: Vec<SecretRecord>) -> Catalog {
        Catalog::from_records(records)
    }

    #[test]
    fn upsert_replaces_by_id() {
        let mut c = catalog(vec![record("a", 1, false)]);
        c.upsert(record("a", 5, false));
        c.upsert(record("b", 2, false));
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("a").unwrap().last_modified, ts(5));
    }

    #[test]
    fn merge_one_sided_drops_tombstones() {
        let a = catalog(vec![record("a", 1, false), record("dead", 2, true)]);
        let merged = Catalog::merge(&a, &Catalog::new());
        assert_eq!(merged.len(), 1);
        assert!(merged.get("dead").is_none());
    }

    #[test]
    fn merge_later_write_wins() {
        let a = catalog(vec![record("x", 1, false)]);
        let b = catalog(vec![record("x", 2, false)]);
        assert_eq!(Catalog::merge(&a, &b).get("x").unwrap().last_modified, ts(2));
        assert_eq!(Catalog::merge(&b, &a).get("x").unwrap().last_modified, ts(2));
    }

    #[test]
    fn merge_tie_keeps_side_a() {
        let mut ra = record("x", 1, false);
        ra.description = "from a".into();
        let mut rb = record("x", 1, false);
        rb.description = "from b".into();
        let merged = Catalog::merge(&catalog(vec![ra]), &catalog(vec![rb]));
        assert_eq!(merged.get("x").unwrap().description, "from a");
    }

    #[test]
    fn merge_sorts_descending_and_trims_capacity() {
        let a = catalog(vec![record("old", 1, false), record("new", 9, false)]);
        let b = catalog(vec![record("mid", 5, false)]);
        let merged = Catalog::merge(&a, &b);
        let ids: Vec<_> = merged.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
        assert_eq!(merged.records.capacity(), merged.records.len());
    }

    /// Local vault has A and B at T1; the remote tombstoned A at T2 > T1.
    #[test]
    fn remote_deletion_propagates() {
        let local = catalog(vec![record("A", 1, false), record("B", 1, false)]);
        let remote = catalog(vec![record("A", 2, true), record("B", 1, false)]);

        let merged = Catalog::merge(&local, &remote);
        let ids: Vec<_> = merged.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["B"]);

        let merged = Catalog::merge(&remote, &local);
        let ids: Vec<_> = merged.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["B"]);
    }

    #[test]
    fn serializes_as_json_array() {
        let c = catalog(vec![record("a", 1, false)]);
        let json = serde_json::to_value(&c).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["id"], "a");
        assert_eq!(json[0]["kind"], "binary");
        assert_eq!(json[0]["meta"], "00000000000000000000000000000000");
    }

    // ── Property tests ────────────────────────────────────────────────────

    /// Catalog with unique IDs drawn from a small alphabet so sides overlap.
    fn arb_catalog() -> impl Strategy<Value = Catalog> {
        prop::collection::btree_map("[a-f]{1,2}", (0i64..50, any::<bool>()), 0..16).prop_map(
            |m: BTreeMap<String, (i64, bool)>| {
                catalog(
                    m.into_iter()
                        .map(|(id, (secs, dead))| record(&id, secs, dead))
                        .collect(),
                )
            },
        )
    }

    /// All-live catalog whose timestamps never collide with another side's.
    fn arb_live_catalog(side: i64) -> impl Strategy<Value = Catalog> {
        prop::collection::btree_map("[a-f]{1,2}", 0i64..50, 0..16).prop_map(
            move |m: BTreeMap<String, i64>| {
                catalog(
                    m.into_iter()
                        .map(|(id, secs)| record(&id, secs * 3 + side, false))
                        .collect(),
                )
            },
        )
    }

    fn canonical(c: &Catalog) -> Vec<SecretRecord> {
        let mut v: Vec<_> = c.live().cloned().collect();
        v.sort_by(|x, y| {
            y.last_modified
                .cmp(&x.last_modified)
                .then_with(|| x.id.cmp(&y.id))
        });
        v
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(x in arb_catalog()) {
            let merged = Catalog::merge(&x, &x);
            prop_assert_eq!(merged.records, canonical(&x));
        }

        #[test]
        fn merge_yields_one_live_record_per_id(x in arb_catalog(), y in arb_catalog()) {
            let merged = Catalog::merge(&x, &y);
            let mut seen = std::collections::HashSet::new();
            for r in merged.iter() {
                prop_assert!(!r.tombstoned);
                prop_assert!(seen.insert(r.id.clone()), "duplicate id {}", r.id);
                prop_assert!(x.get(&r.id).is_some() || y.get(&r.id).is_some());
            }
        }

        #[test]
        fn merge_commutes_without_ties(x in arb_live_catalog(0), y in arb_live_catalog(1)) {
            prop_assert_eq!(Catalog::merge(&x, &y), Catalog::merge(&y, &x));
        }

        #[test]
        fn chained_merges_converge_on_latest(
            x in arb_live_catalog(0),
            y in arb_live_catalog(1),
            z in arb_live_catalog(2),
        ) {
            let xy_z = Catalog::merge(&Catalog::merge(&x, &y), &z);
            let z_yx = Catalog::merge(&z, &Catalog::merge(&y, &x));
            let xz_y = Catalog::merge(&Catalog::merge(&x, &z), &y);
            prop_assert_eq!(&xy_z, &z_yx);
            prop_assert_eq!(&xy_z, &xz_y);

            for r in xy_z.iter() {
                let latest = [&x, &y, &z]
                    .iter()
                    .filter_map(|c| c.get(&r.id))
                    .max_by_key(|c| c.last_modified)
                    .unwrap();
                prop_assert_eq!(r, latest);
            }
        }

        #[test]
        fn merge_never_resurrects_observed_deletion(x in arb_catalog(), y in arb_catalog()) {
            // Once a later tombstone is on either side, the ID stays gone.
            let merged = Catalog::merge(&x, &y);
            for dead in x.iter().chain(y.iter()).filter(|r| r.tombstoned) {
                let mut rivals = x
                    .get(&dead.id)
                    .into_iter()
                    .chain(y.get(&dead.id))
                    .filter(|r| *r != dead);
                if rivals.all(|r| r.last_modified < dead.last_modified) {
                    prop_assert!(merged.get(&dead.id).is_none());
                    let again = Catalog::merge(&merged, &catalog(vec![dead.clone()]));
                    prop_assert!(again.get(&dead.id).is_none());
                }
            }
        }
    }
}

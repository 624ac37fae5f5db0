//! In-memory host index with prefix search
//!
//! Holds the latest announcement per host plus a sorted copy of the key set.
//! The relay guards a [`HostIndex`] with a single lock, so a reader never sees
//! the key list disagree with the host map.

use bytes::Bytes;
use std::collections::HashMap;
use tracing::error;

use crate::announcement::HostPublicKey;
use crate::chain::ChangeId;
use crate::persist::PersistData;

/// Result of resolving a key prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMatch {
    /// Exactly one host matches (or the prefix is a full key)
    Unique(HostPublicKey),
    /// Several hosts share the prefix; holds the first in key order
    Ambiguous(HostPublicKey),
    /// No host key starts with the prefix
    NotFound,
}

/// Older announcements kept per host so a revert can restore them
pub const MAX_SUPERSEDED: usize = 32;

#[derive(Debug, Default)]
pub struct HostIndex {
    height: u64,
    hosts: HashMap<HostPublicKey, Bytes>,
    /// Always `sorted(hosts.keys())`
    host_keys: Vec<HostPublicKey>,
    /// Announcements replaced by `hosts[k]`, oldest first
    superseded: HashMap<HostPublicKey, Vec<Bytes>>,
    last_change: ChangeId,
    queued_save: bool,
}

impl HostIndex {
    pub fn from_snapshot(data: PersistData) -> Self {
        let mut host_keys: Vec<_> = data.hosts.keys().cloned().collect();
        host_keys.sort();
        Self {
            height: data.height,
            hosts: data.hosts,
            host_keys,
            superseded: data.superseded,
            last_change: data.last_change,
            queued_save: false,
        }
    }

    /// Copy of the durable fields
    pub fn snapshot(&self) -> PersistData {
        PersistData {
            height: self.height,
            hosts: self.hosts.clone(),
            superseded: self.superseded.clone(),
            last_change: self.last_change,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn last_change(&self) -> ChangeId {
        self.last_change
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn announcement(&self, key: &str) -> Option<Bytes> {
        self.hosts.get(key).cloned()
    }

    /// Resolve `prefix` to a host key
    pub fn lookup(&self, prefix: &str) -> HostMatch {
        if let Some((key, _)) = self.hosts.get_key_value(prefix) {
            return HostMatch::Unique(key.clone());
        }

        let i = self.host_keys.partition_point(|key| key.as_str() < prefix);
        let matches = |i: usize| {
            self.host_keys
                .get(i)
                .filter(|key| key.as_str().starts_with(prefix))
        };
        match (matches(i), matches(i + 1)) {
            (None, _) => HostMatch::NotFound,
            (Some(key), None) => HostMatch::Unique(key.clone()),
            (Some(key), Some(_)) => HostMatch::Ambiguous(key.clone()),
        }
    }

    /// Move the height by one consensus change
    ///
    /// The first change after a genesis-anchored subscription counts the
    /// genesis block as applied, but genesis is height 0.
    pub(crate) fn advance_height(&mut self, applied: usize, reverted: usize) -> u64 {
        let genesis = u64::from(self.last_change.is_beginning());
        let raised = self.height + applied as u64;
        let lowered = reverted as u64 + genesis;
        self.height = raised.checked_sub(lowered).unwrap_or_else(|| {
            error!(
                height = self.height,
                applied, reverted, "Consensus change moves height below genesis"
            );
            0
        });
        self.height
    }

    /// Record announcements, overwriting older ones; returns how many hosts
    /// were new
    ///
    /// An overwritten announcement is kept as superseded so reverting the
    /// block that replaced it brings it back.
    pub(crate) fn apply_announcements(
        &mut self,
        announcements: HashMap<HostPublicKey, Bytes>,
    ) -> usize {
        let mut added = 0;
        for (key, announcement) in announcements {
            match self.hosts.insert(key.clone(), announcement) {
                Some(previous) => {
                    let history = self.superseded.entry(key).or_default();
                    history.push(previous);
                    if history.len() > MAX_SUPERSEDED {
                        history.remove(0);
                    }
                }
                None => {
                    self.host_keys.push(key);
                    added += 1;
                }
            }
        }
        if added > 0 {
            self.host_keys.sort();
        }
        added
    }

    /// Undo `announcement` for `key`; returns whether the index changed
    ///
    /// If it is the current record the previous announcement takes its place,
    /// or the host is dropped when there is none. A matching superseded
    /// announcement is forgotten.
    pub(crate) fn retract(&mut self, key: &HostPublicKey, announcement: &Bytes) -> bool {
        if self.hosts.get(key) != Some(announcement) {
            return self.forget_superseded(key, announcement);
        }

        match self.superseded.get_mut(key).and_then(Vec::pop) {
            Some(previous) => {
                self.hosts.insert(key.clone(), previous);
            }
            None => {
                self.hosts.remove(key);
                if let Ok(i) = self.host_keys.binary_search(key) {
                    self.host_keys.remove(i);
                }
            }
        }
        if self.superseded.get(key).is_some_and(Vec::is_empty) {
            self.superseded.remove(key);
        }
        true
    }

    fn forget_superseded(&mut self, key: &HostPublicKey, announcement: &Bytes) -> bool {
        let Some(history) = self.superseded.get_mut(key) else {
            return false;
        };
        let Some(i) = history.iter().rposition(|old| old == announcement) else {
            return false;
        };
        history.remove(i);
        if history.is_empty() {
            self.superseded.remove(key);
        }
        true
    }

    pub(crate) fn set_last_change(&mut self, id: ChangeId) {
        self.last_change = id;
    }

    pub fn queued_save(&self) -> bool {
        self.queued_save
    }

    /// Mark a save as pending; false if one already was
    pub(crate) fn queue_save(&mut self) -> bool {
        !std::mem::replace(&mut self.queued_save, true)
    }

    /// Put back the flag taken by a save that did not complete
    pub(crate) fn requeue_save(&mut self) {
        self.queued_save = true;
    }

    /// Snapshot for a pending save, clearing the flag
    pub(crate) fn take_queued_snapshot(&mut self) -> Option<PersistData> {
        if !std::mem::take(&mut self.queued_save) {
            return None;
        }
        Some(self.snapshot())
    }

    /// Forget everything and restart from genesis
    pub(crate) fn reset(&mut self) {
        self.height = 0;
        self.hosts.clear();
        self.host_keys.clear();
        self.superseded.clear();
        self.last_change = ChangeId::BEGINNING;
    }

    #[cfg(test)]
    pub(crate) fn keys(&self) -> &[HostPublicKey] {
        &self.host_keys
    }

    #[cfg(test)]
    pub(crate) fn superseded(&self, key: &str) -> usize {
        self.superseded.get(key).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn index_with<'a>(keys: impl IntoIterator<Item = &'a str>) -> HostIndex {
        let mut index = HostIndex::default();
        index.apply_announcements(
            keys.into_iter()
                .map(|k| (HostPublicKey::from(k), Bytes::from(k.as_bytes().to_vec())))
                .collect(),
        );
        index
    }

    fn key(text: &str) -> HostPublicKey {
        HostPublicKey::from(text)
    }

    #[test]
    fn test_lookup_exact_unique_ambiguous_missing() {
        let index = index_with(["ed25519:aa01", "ed25519:aa02", "ed25519:bb01"]);

        assert_eq!(index.lookup("ed25519:aa01"), HostMatch::Unique(key("ed25519:aa01")));
        assert_eq!(index.lookup("ed25519:b"), HostMatch::Unique(key("ed25519:bb01")));
        assert_eq!(index.lookup("ed25519:aa"), HostMatch::Ambiguous(key("ed25519:aa01")));
        assert_eq!(index.lookup("ed25519:cc"), HostMatch::NotFound);
        assert_eq!(index.lookup("ed25519:ab"), HostMatch::NotFound);
        assert_eq!(index.lookup("zzz"), HostMatch::NotFound);
        assert_eq!(HostIndex::default().lookup("ed25519:"), HostMatch::NotFound);
    }

    #[test]
    fn test_exact_key_wins_over_longer_keys() {
        let index = index_with(["abc", "abcd", "abce"]);

        assert_eq!(index.lookup("abc"), HostMatch::Unique(key("abc")));
        assert_eq!(index.lookup("abcd"), HostMatch::Unique(key("abcd")));
        assert_eq!(index.lookup("ab"), HostMatch::Ambiguous(key("abc")));
    }

    #[test]
    fn test_apply_overwrites_and_keeps_keys_sorted() {
        let mut index = index_with(["c", "a"]);
        assert_eq!(index.keys(), &[key("a"), key("c")]);

        let added = index.apply_announcements(HashMap::from([
            (key("b"), Bytes::from_static(b"b1")),
            (key("a"), Bytes::from_static(b"a2")),
        ]));

        assert_eq!(added, 1);
        assert_eq!(index.keys(), &[key("a"), key("b"), key("c")]);
        assert_eq!(index.announcement("a").unwrap(), Bytes::from_static(b"a2"));
        assert_eq!(index.superseded("a"), 1);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_retract_only_matching_announcement() {
        let mut index = index_with(["a", "b"]);

        assert!(!index.retract(&key("a"), &Bytes::from_static(b"stale")));
        assert!(index.retract(&key("a"), &Bytes::from_static(b"a")));
        assert!(!index.retract(&key("missing"), &Bytes::from_static(b"missing")));

        assert_eq!(index.keys(), &[key("b")]);
        assert_eq!(index.lookup("a"), HostMatch::NotFound);
        assert!(index.announcement("a").is_none());
    }

    #[test]
    fn test_retract_restores_superseded_announcement() {
        let mut index = HostIndex::default();
        let first = Bytes::from_static(b"a1");
        let second = Bytes::from_static(b"a2");
        index.apply_announcements(HashMap::from([(key("a"), first.clone())]));
        index.apply_announcements(HashMap::from([(key("a"), second.clone())]));
        assert_eq!(index.superseded("a"), 1);

        assert!(index.retract(&key("a"), &second));
        assert_eq!(index.announcement("a"), Some(first.clone()));
        assert_eq!(index.keys(), &[key("a")]);
        assert_eq!(index.superseded("a"), 0);

        assert!(index.retract(&key("a"), &first));
        assert!(index.is_empty());
        assert!(index.keys().is_empty());
    }

    #[test]
    fn test_identical_reannouncement_survives_one_revert() {
        let mut index = HostIndex::default();
        let payload = Bytes::from_static(b"same");
        index.apply_announcements(HashMap::from([(key("a"), payload.clone())]));
        index.apply_announcements(HashMap::from([(key("a"), payload.clone())]));

        assert!(index.retract(&key("a"), &payload));
        assert_eq!(index.announcement("a"), Some(payload.clone()));
        assert_eq!(index.lookup("a"), HostMatch::Unique(key("a")));

        assert!(index.retract(&key("a"), &payload));
        assert_eq!(index.lookup("a"), HostMatch::NotFound);
    }

    #[test]
    fn test_retract_older_announcement_keeps_current() {
        let mut index = HostIndex::default();
        let old = Bytes::from_static(b"old");
        let new = Bytes::from_static(b"new");
        index.apply_announcements(HashMap::from([(key("a"), old.clone())]));
        index.apply_announcements(HashMap::from([(key("a"), new.clone())]));

        assert!(index.retract(&key("a"), &old));
        assert!(!index.retract(&key("a"), &old));
        assert_eq!(index.announcement("a"), Some(new.clone()));

        // nothing left to fall back to
        assert!(index.retract(&key("a"), &new));
        assert!(index.is_empty());
    }

    #[test]
    fn test_superseded_history_is_bounded() {
        let mut index = HostIndex::default();
        for i in 0..MAX_SUPERSEDED + 5 {
            index.apply_announcements(HashMap::from([(
                key("a"),
                Bytes::from(i.to_string().into_bytes()),
            )]));
        }

        assert_eq!(index.superseded("a"), MAX_SUPERSEDED);
        let snapshot = index.snapshot();
        assert_eq!(snapshot.superseded[&key("a")].len(), MAX_SUPERSEDED);
        // the oldest entries were dropped first
        assert_eq!(snapshot.superseded[&key("a")][0], Bytes::from_static(b"4"));
    }

    #[test]
    fn test_advance_height_with_genesis_offset() {
        let mut index = HostIndex::default();

        // genesis plus two blocks
        assert_eq!(index.advance_height(3, 0), 2);
        index.set_last_change(ChangeId::new([1; 32]));

        assert_eq!(index.advance_height(2, 1), 3);
        assert_eq!(index.advance_height(0, 3), 0);
        assert_eq!(index.advance_height(0, 1), 0);
    }

    #[test]
    fn test_queued_save_flag() {
        let mut index = index_with(["a"]);

        assert!(index.take_queued_snapshot().is_none());
        assert!(index.queue_save());
        assert!(!index.queue_save());
        assert!(index.queued_save());

        let snapshot = index.take_queued_snapshot().unwrap();
        assert_eq!(snapshot.hosts.len(), 1);
        assert!(!index.queued_save());

        index.requeue_save();
        assert!(!index.queue_save());
        assert!(index.take_queued_snapshot().is_some());
    }

    #[test]
    fn test_snapshot_roundtrip_rebuilds_sorted_keys() {
        let mut index = index_with(["b", "a", "c"]);
        index.apply_announcements(HashMap::from([(key("a"), Bytes::from_static(b"a2"))]));
        index.advance_height(5, 0);
        index.set_last_change(ChangeId::new([3; 32]));

        let restored = HostIndex::from_snapshot(index.snapshot());
        assert_eq!(restored.height(), 4);
        assert_eq!(restored.superseded("a"), 1);
        assert_eq!(restored.last_change(), ChangeId::new([3; 32]));
        assert_eq!(restored.keys(), &[key("a"), key("b"), key("c")]);
        assert!(!restored.queued_save());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut index = index_with(["a", "b"]);
        index.apply_announcements(HashMap::from([(key("a"), Bytes::from_static(b"a2"))]));
        index.advance_height(10, 0);
        index.set_last_change(ChangeId::new([3; 32]));

        index.reset();
        assert_eq!(index.superseded("a"), 0);

        assert_eq!(index.height(), 0);
        assert!(index.is_empty());
        assert!(index.keys().is_empty());
        assert!(index.last_change().is_beginning());
    }

    proptest! {
        #[test]
        fn prop_lookup_matches_linear_scan(
            keys in prop::collection::btree_set("[ab]{1,5}", 0..24),
            prefix in "[ab]{0,4}",
        ) {
            let index = index_with(keys.iter().map(String::as_str));
            let matching: BTreeSet<&String> =
                keys.iter().filter(|k| k.starts_with(&prefix)).collect();

            match index.lookup(&prefix) {
                HostMatch::Unique(found) => {
                    prop_assert!(keys.contains(&prefix) || matching.len() == 1);
                    if keys.contains(&prefix) {
                        prop_assert_eq!(found.as_str(), prefix.as_str());
                    } else {
                        prop_assert_eq!(found.as_str(), matching.iter().next().unwrap().as_str());
                    }
                }
                HostMatch::Ambiguous(first) => {
                    prop_assert!(!keys.contains(&prefix));
                    prop_assert!(matching.len() > 1);
                    prop_assert_eq!(first.as_str(), matching.iter().next().unwrap().as_str());
                }
                HostMatch::NotFound => prop_assert!(matching.is_empty()),
            }
        }

        #[test]
        fn prop_sorted_keys_track_host_map(
            inserts in prop::collection::vec("[a-c]{1,3}", 0..30),
            removals in prop::collection::vec("[a-c]{1,3}", 0..10),
        ) {
            let mut index = index_with(inserts.iter().map(String::as_str));
            for removed in &removals {
                index.retract(&key(removed), &Bytes::from(removed.as_bytes().to_vec()));
            }

            let mut expected: Vec<_> = index.hosts.keys().cloned().collect();
            expected.sort();
            prop_assert_eq!(index.keys(), expected.as_slice());
        }
    }
}

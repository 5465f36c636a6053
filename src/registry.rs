//! The remote registry: an ordered map keyed by `(proto, address,
//! port)`, owning every `Remote`.

use linked_hash_map::LinkedHashMap;

use crate::remote::{Remote, RemoteKey};

/// Ordered map of remotes, plus the debounce list of remotes whose last
/// reconnect attempt failed.
///
/// `LinkedHashMap` gives deterministic iteration order for GC sweeps —
/// insertion order here carries no protocol meaning, it just makes
/// sweeps and tests reproducible.
pub struct Registry {
    remotes: LinkedHashMap<RemoteKey, Remote>,
    /// Debounced remotes, membership guarded by `RemoteFlags::CONN_BLOCKED`
    /// on the remote itself rather than by set semantics here — a key can
    /// appear more than once; re-processing it twice on debounce-expiry is
    /// a no-op.
    reconnect_remotes: Vec<RemoteKey>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { remotes: LinkedHashMap::new(), reconnect_remotes: Vec::new() }
    }

    pub fn get(&self, key: &RemoteKey) -> Option<&Remote> {
        self.remotes.get(key)
    }

    pub fn get_mut(&mut self, key: &RemoteKey) -> Option<&mut Remote> {
        self.remotes.get_mut(key)
    }

    /// Looks up `key`, inserting a freshly created `Remote` if absent.
    /// Created on first send to, or first accepted handshake from, that
    /// endpoint.
    pub fn get_or_insert(&mut self, key: RemoteKey) -> &mut Remote {
        self.remotes.entry(key).or_insert_with(|| Remote::new(key))
    }

    /// A pure lookup that never mutates the registry, for call sites
    /// that must not create a `Remote` as a side effect (e.g. deciding
    /// whether to even attempt a connection).
    pub fn contains(&self, key: &RemoteKey) -> bool {
        self.remotes.contains_key(key)
    }

    /// Removes and returns a remote. Only the GC loop or full teardown
    /// may do this.
    pub fn remove(&mut self, key: &RemoteKey) -> Option<Remote> {
        self.remotes.remove(key)
    }

    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RemoteKey, &Remote)> {
        self.remotes.iter()
    }

    pub fn keys(&self) -> Vec<RemoteKey> {
        self.remotes.keys().copied().collect()
    }

    /// Pushes `key` onto the reconnect-debounce list and marks the
    /// remote `CONN_BLOCKED`.
    pub fn block_for_reconnect(&mut self, key: RemoteKey) {
        if let Some(remote) = self.remotes.get_mut(&key) {
            remote.flags.insert(crate::remote::RemoteFlags::CONN_BLOCKED);
        }
        self.reconnect_remotes.push(key);
    }

    /// Drains the debounce list, unblocking every remote still present
    /// (a remote may have been GC'd in the meantime, in which case its
    /// entry here is simply dropped).
    pub fn drain_reconnect_remotes(&mut self) -> Vec<RemoteKey> {
        let keys = std::mem::take(&mut self.reconnect_remotes);
        let mut unblocked = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(remote) = self.remotes.get_mut(&key) {
                if remote.flags.contains(crate::remote::RemoteFlags::CONN_BLOCKED) {
                    remote.flags.remove(crate::remote::RemoteFlags::CONN_BLOCKED);
                    unblocked.push(key);
                }
            }
        }
        unblocked
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IpProtocol;

    fn key(port: u16) -> RemoteKey {
        RemoteKey::new(IpProtocol::V4, [127, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], port)
    }

    #[test]
    fn get_or_insert_creates_exactly_once() {
        let mut reg = Registry::new();
        assert!(!reg.contains(&key(1)));
        reg.get_or_insert(key(1));
        assert_eq!(reg.len(), 1);
        reg.get_or_insert(key(1));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn debounce_list_tolerates_duplicate_and_missing_keys() {
        let mut reg = Registry::new();
        reg.get_or_insert(key(1));
        reg.block_for_reconnect(key(1));
        reg.block_for_reconnect(key(1));
        // remote for key(2) never existed: pushing it is harmless
        reg.block_for_reconnect(key(2));

        let unblocked = reg.drain_reconnect_remotes();
        // only key(1) actually unblocks (key(2) never had a remote);
        // the duplicate push for key(1) is a no-op on its second visit
        assert_eq!(unblocked, vec![key(1)]);
        assert!(!reg.get(&key(1)).unwrap().flags.contains(crate::remote::RemoteFlags::CONN_BLOCKED));
    }

    #[test]
    fn remove_drops_the_remote() {
        let mut reg = Registry::new();
        reg.get_or_insert(key(1));
        assert!(reg.remove(&key(1)).is_some());
        assert!(!reg.contains(&key(1)));
    }
}

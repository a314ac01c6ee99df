// Session registry: ClientId → session, plus master election.
//
// The registry is plain data. `ServerHandle` wraps it in the session-wide
// mutex and layers the proxy notifications and connection shutdown on top
// (see `server.rs`), so the master rules can be tested without sockets.
// It is generic over the connection type; the server stores
// `Arc<ClientConnection>`.
//
// Rules:
// - Ids start at 1, grow monotonically, and are never reused.
// - First master wins: a master request is granted only while no master is
//   registered; later requests are silently downgraded to non-master.
// - At most one session is master, and `master_client_id` names it.
// - The master slot clears only when that session leaves (or on `drain`).

use std::collections::BTreeMap;

use drivelink_protocol::ClientId;

/// One registered client.
#[derive(Debug)]
pub struct ClientSession<C> {
    pub id: ClientId,
    pub connection: C,
    pub is_master: bool,
}

/// Outcome of `SessionRegistry::register`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    pub client_id: ClientId,
    pub granted_master: bool,
}

#[derive(Debug)]
pub struct SessionRegistry<C> {
    sessions: BTreeMap<ClientId, ClientSession<C>>,
    next_client_id: ClientId,
    master_client_id: Option<ClientId>,
}

impl<C> Default for SessionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> SessionRegistry<C> {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_client_id: ClientId::FIRST,
            master_client_id: None,
        }
    }

    /// Add a session and decide its master status.
    pub fn register(&mut self, connection: C, wants_master: bool) -> Registration {
        let client_id = self.next_client_id;
        self.next_client_id = client_id.next();

        let granted_master = wants_master && self.master_client_id.is_none();
        if granted_master {
            self.master_client_id = Some(client_id);
        }

        self.sessions.insert(
            client_id,
            ClientSession {
                id: client_id,
                connection,
                is_master: granted_master,
            },
        );

        Registration {
            client_id,
            granted_master,
        }
    }

    /// Remove a session. Clears the master slot if it held it.
    pub fn unregister(&mut self, client_id: ClientId) -> Option<ClientSession<C>> {
        let session = self.sessions.remove(&client_id)?;
        if self.master_client_id == Some(client_id) {
            self.master_client_id = None;
        }
        Some(session)
    }

    /// Remove every session and clear the master slot.
    pub fn drain(&mut self) -> Vec<ClientSession<C>> {
        self.master_client_id = None;
        std::mem::take(&mut self.sessions).into_values().collect()
    }

    pub fn get(&self, client_id: ClientId) -> Option<&ClientSession<C>> {
        self.sessions.get(&client_id)
    }

    pub fn master_client_id(&self) -> Option<ClientId> {
        self.master_client_id
    }

    pub fn is_master(&self, client_id: ClientId) -> bool {
        self.master_client_id == Some(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn client_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.sessions.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master_count<C>(registry: &SessionRegistry<C>) -> usize {
        registry
            .client_ids()
            .filter(|id| registry.get(*id).is_some_and(|s| s.is_master))
            .count()
    }

    #[test]
    fn first_master_wins() {
        let mut registry = SessionRegistry::new();

        let a = registry.register("a", true);
        assert_eq!(
            a,
            Registration {
                client_id: ClientId(1),
                granted_master: true
            }
        );
        assert_eq!(registry.master_client_id(), Some(ClientId(1)));

        let b = registry.register("b", true);
        assert_eq!(
            b,
            Registration {
                client_id: ClientId(2),
                granted_master: false
            }
        );
        assert_eq!(registry.master_client_id(), Some(ClientId(1)));
        assert!(registry.is_master(ClientId(1)));
        assert!(!registry.is_master(ClientId(2)));
        assert!(!registry.get(ClientId(2)).unwrap().is_master);
    }

    #[test]
    fn non_master_request_never_becomes_master() {
        let mut registry = SessionRegistry::new();
        let a = registry.register("a", false);
        assert!(!a.granted_master);
        assert_eq!(registry.master_client_id(), None);
    }

    #[test]
    fn unregistering_master_frees_the_slot() {
        let mut registry = SessionRegistry::new();
        registry.register("a", true);
        registry.register("b", false);

        let removed = registry.unregister(ClientId(1)).unwrap();
        assert!(removed.is_master);
        assert_eq!(registry.master_client_id(), None);

        let c = registry.register("c", true);
        assert!(c.granted_master);
        assert_eq!(c.client_id, ClientId(3));
    }

    #[test]
    fn unregistering_non_master_keeps_master() {
        let mut registry = SessionRegistry::new();
        registry.register("a", true);
        registry.register("b", false);
        registry.unregister(ClientId(2));
        assert_eq!(registry.master_client_id(), Some(ClientId(1)));
    }

    #[test]
    fn unknown_id_is_ignored() {
        let mut registry: SessionRegistry<&str> = SessionRegistry::new();
        assert!(registry.unregister(ClientId(9)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn ids_are_never_reused() {
        let mut registry = SessionRegistry::new();
        for _ in 0..3 {
            let reg = registry.register((), false);
            registry.unregister(reg.client_id);
        }
        assert_eq!(registry.register((), false).client_id, ClientId(4));
    }

    #[test]
    fn at_most_one_master_over_any_sequence() {
        // Interleave registrations and removals with a simple deterministic
        // pattern and check the invariant after every operation.
        let mut registry = SessionRegistry::new();
        let mut live = Vec::new();
        for step in 0u32..200 {
            if step % 3 == 2 && !live.is_empty() {
                let victim = live.remove((step as usize * 7) % live.len());
                registry.unregister(victim);
            } else {
                let reg = registry.register(step, step % 2 == 0);
                live.push(reg.client_id);
            }
            let masters = master_count(&registry);
            assert!(masters <= 1, "step {step}: {masters} masters");
            assert_eq!(masters == 1, registry.master_client_id().is_some());
        }
    }

    #[test]
    fn drain_clears_master() {
        let mut registry = SessionRegistry::new();
        registry.register("a", true);
        registry.register("b", false);
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.master_client_id(), None);
    }
}

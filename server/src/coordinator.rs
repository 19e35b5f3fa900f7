//! Session coordinator: the single owner of lobby state
//!
//! The [`Coordinator`] holds the persistence gateway (and through it the code
//! cache) together with the connection registry. It runs inside one task that
//! drains a request queue, so every command is applied to the store and the
//! in-memory registries as one uninterrupted step. Connection tasks talk to it
//! through a cloneable [`CoordinatorHandle`].
//!
//! Registry changes follow confirmed store writes. When the store reports a
//! bound participant or session as missing, the stale bindings are dropped
//! before the error is returned.
//!
//! Responses and notices reach a connection through its bounded outbox. A
//! connection that lets its outbox fill up is closed after the request
//! that overflowed it, exactly as if its transport had gone away.

use log::{debug, error, info, warn};
use shared::{GameView, Notice, Response};
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection_registry::{Binding, ConnectionId, ConnectionRegistry, Outbox};
use crate::error::{LobbyError, Result};
use crate::gateway::{Gateway, SessionUpdate};
use crate::router::Router;
use crate::store::{ParticipantRecord, SessionId, SessionRecord};

fn view(participant: &ParticipantRecord, code: &str, location: &str) -> GameView {
    GameView {
        code: code.to_string(),
        username: participant.username.clone(),
        spy: participant.is_spy,
        location: location.to_string(),
        role: participant.role.clone(),
    }
}

pub struct Coordinator {
    gateway: Gateway,
    connections: ConnectionRegistry,
}

impl Coordinator {
    pub fn new(gateway: Gateway, connections: ConnectionRegistry) -> Self {
        Self {
            gateway,
            connections,
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn open(&mut self, addr: SocketAddr, outbox: Outbox) -> Option<ConnectionId> {
        self.connections.open(addr, outbox)
    }

    /// Cleanup for a closed transport: leaves the game if the connection was
    /// in one, then forgets the connection.
    pub async fn close(&mut self, conn: ConnectionId) {
        if self.connections.binding(conn).is_some() {
            if let Err(e) = self.leave_game(conn).await {
                warn!("Connection {} could not leave its game cleanly: {}", conn, e);
            }
        }
        self.connections.disconnect(conn);
        self.connections.close(conn);
    }

    fn ensure_unbound(&self, conn: ConnectionId) -> Result<()> {
        match self.connections.binding(conn) {
            Some(binding) => {
                let code = self
                    .gateway
                    .codes()
                    .code_of(binding.session)
                    .unwrap_or_default();
                Err(LobbyError::AlreadyInSession(code.to_string()))
            }
            None => Ok(()),
        }
    }

    /// Loads the participant and session a connection is bound to,
    /// dropping bindings the store no longer backs.
    async fn member(&mut self, conn: ConnectionId) -> Result<(ParticipantRecord, SessionRecord)> {
        let Binding {
            participant,
            session,
        } = self
            .connections
            .binding(conn)
            .ok_or(LobbyError::NotInSession)?;

        let session = match self.gateway.get_session(session).await {
            Ok(record) => record,
            Err(e @ LobbyError::SessionNotFound(_)) => {
                let dropped = self.connections.unbind_session(session);
                warn!("Dropped {} bindings to vanished game {}", dropped.len(), session);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let participant = match self.gateway.get_participant(participant).await {
            Ok(record) => record,
            Err(e @ LobbyError::ParticipantNotFound(_)) => {
                self.connections.unbind(conn);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        Ok((participant, session))
    }

    fn notify(&mut self, session: SessionId, except: Option<ConnectionId>, notice: &Notice) {
        let text = match serde_json::to_string(notice) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode notice {:?}: {}", notice, e);
                return;
            }
        };

        for conn in self.connections.connections_in(session) {
            if Some(conn) == except {
                continue;
            }
            if !self.connections.send(conn, text.clone()) {
                debug!("Connection {} dropped a notice", conn);
            }
        }
    }

    /// Queues the response to a command on the connection that sent it.
    pub fn respond(&mut self, conn: ConnectionId, response: &Response) {
        match serde_json::to_string(response) {
            Ok(text) => {
                if !self.connections.send(conn, text) {
                    debug!("Connection {} dropped its {} response", conn, response.kind);
                }
            }
            Err(e) => error!("Failed to encode response for {}: {}", conn, e),
        }
    }

    /// Closes every connection that overflowed its outbox. Leaving a game
    /// notifies the rest of it, which can overflow further outboxes.
    pub async fn evict_lagging(&mut self) -> usize {
        let mut evicted = 0;
        loop {
            let lagging = self.connections.take_lagging();
            if lagging.is_empty() {
                return evicted;
            }
            for conn in lagging {
                warn!("Closing connection {}: it is not reading its messages", conn);
                self.close(conn).await;
                evicted += 1;
            }
        }
    }

    pub async fn create_game(&mut self, conn: ConnectionId, username: &str) -> Result<GameView> {
        self.ensure_unbound(conn)?;

        let session = self.gateway.create_session().await?;

        match self.join_game(conn, username, &session.code).await {
            Ok(view) => Ok(view),
            Err(e) => {
                if let Err(cleanup) = self.gateway.delete_session(session.id).await {
                    error!(
                        "Failed to remove unused game {} after a failed create: {}",
                        session.code, cleanup
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn join_game(
        &mut self,
        conn: ConnectionId,
        username: &str,
        code: &str,
    ) -> Result<GameView> {
        self.ensure_unbound(conn)?;

        let session_id = self.gateway.resolve(code)?;
        let session = self.gateway.get_session(session_id).await?;

        let participant = match self.gateway.add_participant(username, session_id).await {
            Ok(participant) => participant,
            Err(LobbyError::Orphaned {
                participant,
                source,
            }) => {
                error!(
                    "Rolling back participant {} in game {}: {}",
                    participant, code, source
                );
                if let Err(e) = self.gateway.discard_participant(participant).await {
                    error!("Rollback of participant {} failed: {}", participant, e);
                }
                return Err(*source);
            }
            Err(e) => return Err(e),
        };

        self.connections.bind(conn, participant.id, session_id);
        info!("{} joined game {} on connection {}", username, code, conn);

        self.notify(
            session_id,
            Some(conn),
            &Notice::PlayerJoined {
                code: code.to_string(),
                username: participant.username.clone(),
            },
        );

        Ok(view(&participant, code, &session.location))
    }

    pub async fn leave_game(&mut self, conn: ConnectionId) -> Result<GameView> {
        let binding = self.connections.binding(conn).ok_or(LobbyError::NotJoined)?;

        let departure = match self.gateway.delete_participant(binding.participant).await {
            Ok(departure) => departure,
            Err(e @ LobbyError::ParticipantNotFound(_)) => {
                self.connections.unbind(conn);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.connections.unbind(conn);
        info!(
            "{} left game {} on connection {}",
            departure.participant.username, departure.code, conn
        );

        if departure.session_closed {
            self.connections.unbind_session(binding.session);
            info!("Game {} closed after its last player left", departure.code);
        } else {
            self.notify(
                binding.session,
                None,
                &Notice::PlayerLeft {
                    code: departure.code.clone(),
                    username: departure.participant.username.clone(),
                },
            );
        }

        Ok(view(&departure.participant, &departure.code, ""))
    }

    pub async fn destroy_game(&mut self, conn: ConnectionId) -> Result<GameView> {
        let (participant, session) = self.member(conn).await?;

        let session = match self.gateway.delete_session(session.id).await {
            Ok(deleted) => deleted,
            Err(e @ LobbyError::SessionNotFound(_)) => {
                self.connections.unbind_session(session.id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let members = self.connections.unbind_session(session.id);
        let notice = Notice::GameDestroyed {
            code: session.code.clone(),
        };
        match serde_json::to_string(&notice) {
            Ok(text) => {
                for member in members.iter().filter(|m| **m != conn) {
                    self.connections.send(*member, text.clone());
                }
            }
            Err(e) => error!("Failed to encode notice {:?}: {}", notice, e),
        }

        info!(
            "Game {} destroyed by {}, {} connections released",
            session.code,
            participant.username,
            members.len()
        );
        Ok(view(&participant, &session.code, &session.location))
    }

    pub async fn start_game(&mut self, conn: ConnectionId) -> Result<GameView> {
        let (participant, session) = self.member(conn).await?;

        if session.active {
            return Err(LobbyError::SessionInProgress);
        }

        let mut update = SessionUpdate::for_session(session.id);
        update.active = Some(true);
        let session = self.gateway.update_session(update).await?;

        info!("Game {} started by {}", session.code, participant.username);
        self.notify(
            session.id,
            Some(conn),
            &Notice::GameStarted {
                code: session.code.clone(),
            },
        );
        Ok(view(&participant, &session.code, &session.location))
    }

    pub async fn stop_game(&mut self, conn: ConnectionId) -> Result<GameView> {
        let (participant, session) = self.member(conn).await?;

        if !session.active {
            return Err(LobbyError::SessionNotInProgress);
        }

        let mut update = SessionUpdate::for_session(session.id);
        update.active = Some(false);
        let session = self.gateway.update_session(update).await?;

        info!("Game {} stopped by {}", session.code, participant.username);
        self.notify(
            session.id,
            Some(conn),
            &Notice::GameStopped {
                code: session.code.clone(),
            },
        );
        Ok(view(&participant, &session.code, &session.location))
    }
}

/// Messages from connection tasks to the coordinator task
#[derive(Debug)]
pub enum Request {
    Open {
        addr: SocketAddr,
        outbox: Outbox,
        reply: oneshot::Sender<Option<ConnectionId>>,
    },
    Command {
        conn: ConnectionId,
        text: String,
        reply: oneshot::Sender<Response>,
    },
    Close {
        conn: ConnectionId,
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the coordinator task.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Request>,
}

impl CoordinatorHandle {
    pub async fn open(&self, addr: SocketAddr, outbox: Outbox) -> Option<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Open {
                addr,
                outbox,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Runs one inbound frame and waits for its response. The response is
    /// also queued on the connection's outbox.
    pub async fn submit(&self, conn: ConnectionId, text: String) -> Response {
        let kind = Router::tag_of(&text);
        let (reply, rx) = oneshot::channel();

        if self
            .tx
            .send(Request::Command { conn, text, reply })
            .await
            .is_err()
        {
            return Router::unavailable(kind);
        }

        match rx.await {
            Ok(response) => response,
            Err(_) => Router::unavailable(kind),
        }
    }

    /// Returns once the coordinator has released everything `conn` held.
    pub async fn close(&self, conn: ConnectionId) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Request::Close { conn, reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Moves the coordinator into its own task.
pub fn spawn(
    coordinator: Coordinator,
    router: Router,
    queue_capacity: usize,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));
    let task = tokio::spawn(run(coordinator, router, rx));
    (CoordinatorHandle { tx }, task)
}

async fn run(mut coordinator: Coordinator, router: Router, mut rx: mpsc::Receiver<Request>) {
    info!("Coordinator started");

    while let Some(request) = rx.recv().await {
        match request {
            Request::Open {
                addr,
                outbox,
                reply,
            } => {
                let conn = coordinator.open(addr, outbox);
                if conn.is_none() {
                    warn!("Refusing connection from {}: server full", addr);
                }
                let _ = reply.send(conn);
            }
            Request::Command { conn, text, reply } => {
                if coordinator.connections().connection(conn).is_none() {
                    debug!("Dropping a command from closed connection {}", conn);
                    continue;
                }
                let response = router.route(&mut coordinator, conn, &text).await;
                coordinator.respond(conn, &response);
                coordinator.evict_lagging().await;
                if reply.send(response).is_err() {
                    debug!("Connection {} went away before its response", conn);
                }
            }
            Request::Close { conn, reply } => {
                coordinator.close(conn).await;
                coordinator.evict_lagging().await;
                let _ = reply.send(());
            }
        }
    }

    info!("Coordinator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FlakyStore;
    use crate::store::{MemoryStore, Snapshot, Store};
    use shared::ErrorKind;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        coordinator: Coordinator,
        inboxes: Vec<mpsc::Receiver<String>>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let gateway = Gateway::new(store.clone(), Duration::from_millis(500));
            Self {
                store,
                coordinator: Coordinator::new(gateway, ConnectionRegistry::new(64)),
                inboxes: Vec::new(),
            }
        }

        fn connect(&mut self) -> ConnectionId {
            self.connect_with_capacity(64)
        }

        fn connect_with_capacity(&mut self, capacity: usize) -> ConnectionId {
            let (tx, rx) = mpsc::channel(capacity);
            self.inboxes.push(rx);
            self.coordinator
                .open("127.0.0.1:9000".parse().unwrap(), tx)
                .unwrap()
        }

        fn drain(&mut self, conn: ConnectionId) -> Vec<Notice> {
            let inbox = &mut self.inboxes[(conn.0 - 1) as usize];
            let mut notices = Vec::new();
            while let Ok(text) = inbox.try_recv() {
                notices.push(serde_json::from_str(&text).unwrap());
            }
            notices
        }

        fn resolve(&self, code: &str) -> Option<SessionId> {
            self.coordinator.gateway().codes().resolve(code)
        }

        async fn assert_integrity(&self) {
            let snapshot = self.store.snapshot().await;
            assert_records_consistent(&snapshot);

            for session in &snapshot.sessions {
                assert_eq!(self.resolve(&session.code), Some(session.id));
            }
            assert_eq!(
                self.coordinator.gateway().codes().len(),
                snapshot.sessions.len()
            );
        }
    }

    /// Every participant points at a live session whose list is exactly
    /// the participants pointing at it, and no two sessions share a code.
    fn assert_records_consistent(snapshot: &Snapshot) {
        let Snapshot {
            sessions,
            participants,
        } = snapshot;

        for participant in participants {
            assert!(
                sessions.iter().any(|s| s.id == participant.session),
                "participant {} points at a missing game",
                participant.id
            );
        }

        for session in sessions {
            let listed: BTreeSet<_> = session.participant_ids.iter().copied().collect();
            let referencing: BTreeSet<_> = participants
                .iter()
                .filter(|p| p.session == session.id)
                .map(|p| p.id)
                .collect();
            assert_eq!(listed, referencing, "game {} roster drifted", session.code);
            assert_eq!(listed.len(), session.participant_ids.len());
        }

        let codes: BTreeSet<_> = sessions.iter().map(|s| s.code.clone()).collect();
        assert_eq!(codes.len(), sessions.len());
    }

    #[tokio::test]
    async fn test_end_to_end_lobby() {
        let mut fx = Fixture::new();
        let alice = fx.connect();
        let bob = fx.connect();

        let created = fx.coordinator.create_game(alice, "alice").await.unwrap();
        assert!(shared::is_valid_code(&created.code));
        assert_eq!(created.username, "alice");
        assert!(!created.spy);
        assert_eq!(created.role, shared::DEFAULT_ROLE);
        fx.assert_integrity().await;

        let session = fx.resolve(&created.code).unwrap();
        assert_eq!(fx.coordinator.connections().connections_in(session), vec![alice]);

        let joined = fx
            .coordinator
            .join_game(bob, "bob", &created.code)
            .await
            .unwrap();
        assert_eq!(joined.code, created.code);
        let stored = fx.coordinator.gateway().get_session(session).await.unwrap();
        assert_eq!(stored.participant_ids.len(), 2);
        fx.assert_integrity().await;

        assert_eq!(
            fx.drain(alice),
            vec![Notice::PlayerJoined {
                code: created.code.clone(),
                username: "bob".into()
            }]
        );

        let destroyed = fx.coordinator.destroy_game(alice).await.unwrap();
        assert_eq!(destroyed.code, created.code);
        assert_eq!(fx.resolve(&created.code), None);
        assert_eq!(fx.coordinator.connections().bound_count(), 0);
        assert_eq!(
            fx.drain(bob),
            vec![Notice::GameDestroyed {
                code: created.code.clone()
            }]
        );
        fx.assert_integrity().await;

        let carol = fx.connect();
        let err = fx
            .coordinator
            .join_game(carol, "carol", &created.code)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let mut fx = Fixture::new();
        let first = fx.connect();
        let second = fx.connect();

        let created = fx.coordinator.create_game(first, "alice").await.unwrap();
        let err = fx
            .coordinator
            .join_game(second, "alice", &created.code)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UsernameTaken);
        assert_eq!(fx.coordinator.connections().binding(second), None);
        fx.assert_integrity().await;
    }

    #[tokio::test]
    async fn test_last_leave_deletes_session() {
        let mut fx = Fixture::new();
        let alice = fx.connect();

        let created = fx.coordinator.create_game(alice, "alice").await.unwrap();
        let left = fx.coordinator.leave_game(alice).await.unwrap();
        assert_eq!(left.username, "alice");

        assert_eq!(fx.resolve(&created.code), None);
        assert!(fx.store.snapshot().await.sessions.is_empty());
        assert_eq!(fx.coordinator.connections().binding(alice), None);
        fx.assert_integrity().await;
    }

    #[tokio::test]
    async fn test_leave_notifies_remaining_players() {
        let mut fx = Fixture::new();
        let alice = fx.connect();
        let bob = fx.connect();

        let created = fx.coordinator.create_game(alice, "alice").await.unwrap();
        fx.coordinator
            .join_game(bob, "bob", &created.code)
            .await
            .unwrap();
        fx.drain(alice);

        fx.coordinator.leave_game(bob).await.unwrap();
        assert_eq!(
            fx.drain(alice),
            vec![Notice::PlayerLeft {
                code: created.code.clone(),
                username: "bob".into()
            }]
        );
        assert!(fx.resolve(&created.code).is_some());
        fx.assert_integrity().await;
    }

    #[tokio::test]
    async fn test_leave_without_game() {
        let mut fx = Fixture::new();
        let conn = fx.connect();

        let err = fx.coordinator.leave_game(conn).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParticipantNotFound);

        let err = fx.coordinator.destroy_game(conn).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn test_start_and_stop_transitions() {
        let mut fx = Fixture::new();
        let alice = fx.connect();
        let bob = fx.connect();
        let late = fx.connect();

        let created = fx.coordinator.create_game(alice, "alice").await.unwrap();
        fx.coordinator
            .join_game(bob, "bob", &created.code)
            .await
            .unwrap();

        let err = fx.coordinator.stop_game(alice).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotInProgress);

        fx.coordinator.start_game(alice).await.unwrap();
        let session = fx.resolve(&created.code).unwrap();
        assert!(fx.coordinator.gateway().get_session(session).await.unwrap().active);

        let err = fx.coordinator.start_game(bob).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionInProgress);

        for username in ["carol", "alice"] {
            let err = fx
                .coordinator
                .join_game(late, username, &created.code)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SessionInProgress);
        }

        fx.coordinator.stop_game(bob).await.unwrap();
        assert!(!fx.coordinator.gateway().get_session(session).await.unwrap().active);
        fx.coordinator
            .join_game(late, "carol", &created.code)
            .await
            .unwrap();

        let code = created.code.clone();
        assert!(fx.drain(bob).contains(&Notice::GameStarted { code: code.clone() }));
        assert!(fx.drain(alice).contains(&Notice::GameStopped { code }));
        fx.assert_integrity().await;
    }

    #[tokio::test]
    async fn test_bound_connection_cannot_join_twice() {
        let mut fx = Fixture::new();
        let alice = fx.connect();

        let first = fx.coordinator.create_game(alice, "alice").await.unwrap();
        let err = fx.coordinator.create_game(alice, "alice").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionExists);
        let err = fx
            .coordinator
            .join_game(alice, "alias", &first.code)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionExists);

        assert_eq!(fx.store.snapshot().await.sessions.len(), 1);
        fx.assert_integrity().await;
    }

    #[tokio::test]
    async fn test_close_leaves_game_once() {
        let mut fx = Fixture::new();
        let alice = fx.connect();
        let bob = fx.connect();
        let idle = fx.connect();

        let created = fx.coordinator.create_game(alice, "alice").await.unwrap();
        fx.coordinator
            .join_game(bob, "bob", &created.code)
            .await
            .unwrap();

        fx.coordinator.close(idle).await;
        assert_eq!(fx.coordinator.connections().bound_count(), 2);

        fx.coordinator.close(bob).await;
        fx.coordinator.close(bob).await;
        assert_eq!(fx.coordinator.connections().len(), 1);
        let session = fx.resolve(&created.code).unwrap();
        let stored = fx.coordinator.gateway().get_session(session).await.unwrap();
        assert_eq!(stored.participant_ids.len(), 1);

        fx.coordinator.close(alice).await;
        assert_eq!(fx.resolve(&created.code), None);
        assert!(fx.coordinator.connections().is_empty());
        fx.assert_integrity().await;
    }

    #[tokio::test]
    async fn test_random_walk_keeps_integrity() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut fx = Fixture::new();
        let conns: Vec<ConnectionId> = (0..6).map(|_| fx.connect()).collect();
        let mut rng = StdRng::seed_from_u64(1234);
        let mut codes: Vec<String> = Vec::new();

        for step in 0..300 {
            let conn = conns[rng.gen_range(0..conns.len())];
            match rng.gen_range(0..4) {
                0 => {
                    if let Ok(v) = fx.coordinator.create_game(conn, &format!("p{}", step)).await {
                        codes.push(v.code);
                    }
                }
                1 if !codes.is_empty() => {
                    let code = codes[rng.gen_range(0..codes.len())].clone();
                    let name = format!("p{}", rng.gen_range(0..4));
                    let _ = fx.coordinator.join_game(conn, &name, &code).await;
                }
                2 => {
                    let _ = fx.coordinator.leave_game(conn).await;
                }
                _ => {
                    let _ = fx.coordinator.destroy_game(conn).await;
                }
            }
            fx.assert_integrity().await;
        }
    }

    fn flaky_coordinator(store: Arc<FlakyStore>) -> Coordinator {
        let gateway = Gateway::new(store, Duration::from_millis(100));
        Coordinator::new(gateway, ConnectionRegistry::new(8))
    }

    fn open(coordinator: &mut Coordinator) -> ConnectionId {
        coordinator
            .open("127.0.0.1:9000".parse().unwrap(), mpsc::channel(64).0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_failed_append_rolls_back_participant() {
        let store = Arc::new(FlakyStore::new());
        let mut coordinator = flaky_coordinator(store.clone());
        let alice = open(&mut coordinator);
        let bob = open(&mut coordinator);

        let created = coordinator.create_game(alice, "alice").await.unwrap();

        store.fail_session_updates(true);
        let err = coordinator
            .join_game(bob, "bob", &created.code)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        store.fail_session_updates(false);

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(snapshot.sessions[0].participant_ids.len(), 1);
        assert_eq!(coordinator.connections().binding(bob), None);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_empty_session() {
        let store = Arc::new(FlakyStore::new());
        let mut coordinator = flaky_coordinator(store.clone());
        let alice = open(&mut coordinator);

        store.fail_participant_inserts(true);
        let err = coordinator.create_game(alice, "alice").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);

        let snapshot = store.snapshot().await;
        assert!(snapshot.sessions.is_empty());
        assert!(snapshot.participants.is_empty());
        assert!(coordinator.gateway().codes().is_empty());
        assert_eq!(coordinator.connections().binding(alice), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_leaves_registries_untouched() {
        let store = Arc::new(FlakyStore::new());
        let mut coordinator = flaky_coordinator(store.clone());
        let alice = open(&mut coordinator);
        let bob = open(&mut coordinator);
        let created = coordinator.create_game(alice, "alice").await.unwrap();

        store.set_delay(Some(Duration::from_secs(1)));
        let err = coordinator.leave_game(alice).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(coordinator.connections().binding(alice).is_some());
        assert!(coordinator.gateway().codes().resolve(&created.code).is_some());

        let err = coordinator
            .join_game(bob, "bob", &created.code)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(coordinator.connections().binding(bob), None);
    }

    #[tokio::test]
    async fn test_vanished_session_drops_bindings() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Gateway::new(store.clone(), Duration::from_millis(500));
        let mut coordinator = Coordinator::new(gateway, ConnectionRegistry::new(8));
        let alice = open(&mut coordinator);

        let created = coordinator.create_game(alice, "alice").await.unwrap();
        let session = coordinator.gateway().codes().resolve(&created.code).unwrap();
        store.delete_session(session).await.unwrap();

        let err = coordinator.start_game(alice).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
        assert_eq!(coordinator.connections().binding(alice), None);
    }

    #[tokio::test]
    async fn test_actor_serializes_requests() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Gateway::new(store.clone(), Duration::from_millis(500));
        let coordinator = Coordinator::new(gateway, ConnectionRegistry::new(1));
        let (handle, _task) = spawn(coordinator, Router::with_default_handlers(), 8);

        let (tx, mut rx) = mpsc::channel(8);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let conn = handle.open(addr, tx).await.unwrap();
        assert!(handle.open(addr, mpsc::channel(8).0).await.is_none());

        let response = handle
            .submit(conn, r#"{"type":"createGame","data":{"username":"alice"}}"#.into())
            .await;
        assert!(response.is_success());
        assert_eq!(store.snapshot().await.participants.len(), 1);

        let queued: Response = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(queued, response);

        handle.close(conn).await;
        assert!(store.snapshot().await.sessions.is_empty());
        assert!(handle.open(addr, mpsc::channel(8).0).await.is_some());

        let late = handle.submit(conn, r#"{"type":"leaveGame"}"#.into()).await;
        assert_eq!(late.error_kind(), Some(ErrorKind::Other));
    }

    #[tokio::test]
    async fn test_lagging_connection_is_evicted() {
        let mut fx = Fixture::new();
        let alice = fx.connect();
        let bob = fx.connect_with_capacity(1);
        let carol = fx.connect();
        let dave = fx.connect();

        let created = fx.coordinator.create_game(alice, "alice").await.unwrap();
        for (conn, name) in [(bob, "bob"), (carol, "carol"), (dave, "dave")] {
            fx.coordinator
                .join_game(conn, name, &created.code)
                .await
                .unwrap();
        }
        assert_eq!(fx.coordinator.evict_lagging().await, 1);

        assert!(fx.coordinator.connections().connection(bob).is_none());
        assert_eq!(fx.coordinator.connections().len(), 3);
        let session = fx.resolve(&created.code).unwrap();
        let stored = fx.coordinator.gateway().get_session(session).await.unwrap();
        assert_eq!(stored.participant_ids.len(), 3);

        assert_eq!(
            fx.drain(bob),
            vec![Notice::PlayerJoined {
                code: created.code.clone(),
                username: "carol".into()
            }]
        );
        assert!(matches!(
            fx.inboxes[(bob.0 - 1) as usize].try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(
            fx.drain(alice).last(),
            Some(&Notice::PlayerLeft {
                code: created.code.clone(),
                username: "bob".into()
            })
        );
        assert_eq!(fx.coordinator.evict_lagging().await, 0);
        fx.assert_integrity().await;
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_keeps_rosters_intact() {
        use crate::store::FileStore;

        let dir = std::env::temp_dir().join(format!("lobby-coord-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = Arc::new(FileStore::open(dir.join("lobby.bin")).await.unwrap());
        let gateway = Gateway::new(store.clone(), Duration::from_millis(500));
        let mut coordinator = Coordinator::new(gateway, ConnectionRegistry::new(8));
        let alice = open(&mut coordinator);
        let bob = open(&mut coordinator);

        let created = coordinator.create_game(alice, "alice").await.unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
        let err = coordinator
            .join_game(bob, "bob", &created.code)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(coordinator.connections().binding(bob), None);

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(snapshot.sessions[0].participant_ids.len(), 1);
        assert_records_consistent(&snapshot);

        std::fs::create_dir_all(&dir).unwrap();
        let joined = coordinator.join_game(bob, "bob", &created.code).await.unwrap();
        assert_eq!(joined.code, created.code);
        assert_records_consistent(&store.snapshot().await);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_keep_integrity() {
        use futures_util::future::join_all;

        let store = Arc::new(MemoryStore::new());
        let gateway = Gateway::new(store.clone(), Duration::from_millis(500));
        let coordinator = Coordinator::new(gateway, ConnectionRegistry::new(64));
        let (handle, _task) = spawn(coordinator, Router::with_default_handlers(), 8);

        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut mailboxes = Vec::new();
        let mut conns = Vec::new();
        for _ in 0..17 {
            let (tx, rx) = mpsc::channel(256);
            mailboxes.push(rx);
            conns.push(handle.open(addr, tx).await.unwrap());
        }
        let (host, players) = (conns[0], &conns[1..]);

        let created = handle
            .submit(host, r#"{"type":"createGame","data":{"username":"host"}}"#.into())
            .await;
        let code = created.data.expect("Expected a game view").code;
        let join = |name: String| {
            format!(
                r#"{{"type":"joinGame","data":{{"username":"{}","code":"{}"}}}}"#,
                name, code
            )
        };

        // Two players race for every name.
        let responses = join_all(
            players
                .iter()
                .enumerate()
                .map(|(i, conn)| handle.submit(*conn, join(format!("p{}", i % 8)))),
        )
        .await;
        let (joined, refused): (Vec<_>, Vec<_>) = players
            .iter()
            .zip(&responses)
            .partition(|(_, response)| response.is_success());
        assert_eq!(joined.len(), 8);
        assert!(refused
            .iter()
            .all(|(_, r)| r.error_kind() == Some(ErrorKind::UsernameTaken)));

        let mut batch = Vec::new();
        for (conn, _) in &joined {
            batch.push(handle.submit(**conn, r#"{"type":"leaveGame"}"#.into()));
        }
        for (i, (conn, _)) in refused.iter().enumerate() {
            batch.push(handle.submit(**conn, join(format!("q{}", i))));
        }
        assert!(join_all(batch).await.iter().all(Response::is_success));

        let snapshot = store.snapshot().await;
        assert_records_consistent(&snapshot);
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].participant_ids.len(), 9);

        let creates = join_all(joined.iter().enumerate().map(|(i, (conn, _))| {
            handle.submit(
                **conn,
                format!(r#"{{"type":"createGame","data":{{"username":"r{}"}}}}"#, i),
            )
        }))
        .await;
        let mut codes: BTreeSet<String> = creates
            .into_iter()
            .map(|r| r.data.expect("Expected a game view").code)
            .collect();
        codes.insert(code.clone());
        assert_eq!(codes.len(), 9);

        let snapshot = store.snapshot().await;
        assert_records_consistent(&snapshot);
        assert_eq!(snapshot.sessions.len(), 9);

        join_all(conns.iter().map(|conn| handle.close(*conn))).await;
        let snapshot = store.snapshot().await;
        assert!(snapshot.sessions.is_empty());
        assert!(snapshot.participants.is_empty());
    }
}

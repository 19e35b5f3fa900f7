//! Live connection tracking and participant bindings
//!
//! This module keeps the server-side view of who is connected, including:
//! - Live connection lifecycle (open, close) and capacity limits
//! - The bounded outbound queue used to reach each connection, and the
//!   connections that let it fill up
//! - Bindings between a connection, the participant it plays as, and that
//!   participant's session
//!
//! A connection appears in a session's fan-out set if and only if it is bound
//! to a participant of that session. Only the session coordinator mutates
//! the registry.

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::store::{ParticipantId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outbound text frames for one connection. The queue is bounded; a
/// connection whose queue is full is reported as lagging.
pub type Outbox = mpsc::Sender<String>;

/// A live transport connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    outbox: Outbox,
}

impl Connection {
    pub fn new(id: ConnectionId, addr: SocketAddr, outbox: Outbox) -> Self {
        Self {
            id,
            addr,
            connected_at: Instant::now(),
            outbox,
        }
    }
}

/// The participant and session a connection plays as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub participant: ParticipantId,
    pub session: SessionId,
}

pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    next_connection_id: u64,
    max_connections: usize,

    connections_by_session: HashMap<SessionId, HashSet<ConnectionId>>,
    binding_by_connection: HashMap<ConnectionId, Binding>,
    connection_by_participant: HashMap<ParticipantId, ConnectionId>,

    lagging: Vec<ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            next_connection_id: 1,
            max_connections,
            connections_by_session: HashMap::new(),
            binding_by_connection: HashMap::new(),
            connection_by_participant: HashMap::new(),
            lagging: Vec::new(),
        }
    }

    /// Registers a live connection. Returns None when the server is full.
    pub fn open(&mut self, addr: SocketAddr, outbox: Outbox) -> Option<ConnectionId> {
        if self.connections.len() >= self.max_connections {
            return None;
        }

        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;

        info!("Connection {} opened from {}", id, addr);
        self.connections.insert(id, Connection::new(id, addr, outbox));
        Some(id)
    }

    /// Forgets a live connection along with any binding it still holds.
    pub fn close(&mut self, conn: ConnectionId) -> bool {
        self.disconnect(conn);
        self.lagging.retain(|c| *c != conn);
        match self.connections.remove(&conn) {
            Some(connection) => {
                info!(
                    "Connection {} from {} closed after {:?}",
                    conn,
                    connection.addr,
                    connection.connected_at.elapsed()
                );
                true
            }
            None => false,
        }
    }

    pub fn connection(&self, conn: ConnectionId) -> Option<&Connection> {
        self.connections.get(&conn)
    }

    pub fn outbox(&self, conn: ConnectionId) -> Option<&Outbox> {
        self.connections.get(&conn).map(|connection| &connection.outbox)
    }

    /// Queues a frame without waiting.
    ///
    /// Returns false for unknown connections, a finished writer, or a full
    /// queue. A full queue also marks the connection as lagging.
    pub fn send(&mut self, conn: ConnectionId, text: String) -> bool {
        let Some(outbox) = self.outbox(conn) else {
            return false;
        };

        match outbox.try_send(text) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.lagging.contains(&conn) {
                    warn!("Outbox of connection {} is full", conn);
                    self.lagging.push(conn);
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Connections that overflowed their outbox since the last call.
    pub fn take_lagging(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.lagging)
    }

    /// Binds `conn` to a participant, replacing earlier bindings of either.
    pub fn bind(&mut self, conn: ConnectionId, participant: ParticipantId, session: SessionId) {
        self.unbind(conn);
        if let Some(previous) = self.connection_by_participant.get(&participant).copied() {
            self.unbind(previous);
        }

        self.connections_by_session
            .entry(session)
            .or_default()
            .insert(conn);
        self.binding_by_connection
            .insert(conn, Binding { participant, session });
        self.connection_by_participant.insert(participant, conn);

        debug!(
            "Connection {} bound to participant {} in game {}",
            conn, participant, session
        );
    }

    pub fn unbind(&mut self, conn: ConnectionId) -> Option<Binding> {
        let binding = self.binding_by_connection.remove(&conn)?;

        if let Some(members) = self.connections_by_session.get_mut(&binding.session) {
            members.remove(&conn);
            if members.is_empty() {
                self.connections_by_session.remove(&binding.session);
            }
        }
        if self.connection_by_participant.get(&binding.participant) == Some(&conn) {
            self.connection_by_participant.remove(&binding.participant);
        }

        debug!("Connection {} unbound from game {}", conn, binding.session);
        Some(binding)
    }

    /// Transport-level closure; a no-op for unbound connections.
    pub fn disconnect(&mut self, conn: ConnectionId) -> Option<Binding> {
        self.unbind(conn)
    }

    /// Unbinds every connection of a session and returns them.
    pub fn unbind_session(&mut self, session: SessionId) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .connections_by_session
            .get(&session)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        members.sort();

        for conn in &members {
            self.unbind(*conn);
        }
        members
    }

    pub fn binding(&self, conn: ConnectionId) -> Option<Binding> {
        self.binding_by_connection.get(&conn).copied()
    }

    pub fn connection_of(&self, participant: ParticipantId) -> Option<ConnectionId> {
        self.connection_by_participant.get(&participant).copied()
    }

    pub fn connections_in(&self, session: SessionId) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .connections_by_session
            .get(&session)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn bound_count(&self) -> usize {
        self.binding_by_connection.len()
    }

    /// Returns the number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

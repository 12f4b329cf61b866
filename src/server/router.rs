//! Connection registry and role-based routing.

use crate::error::AppResult;
use crate::protocol::{ClientIdentity, ConnectionId, Event, Role};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

struct Connection {
    outbound: UnboundedSender<Event>,
    identity: Option<ClientIdentity>,
}

/// Maps connections to identities and roles.
///
/// Owned by the server actor; every method runs on the actor task.
#[derive(Default)]
pub struct EventRouter {
    connections: HashMap<ConnectionId, Connection>,
    roles: HashMap<Role, BTreeSet<ConnectionId>>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("connections", &self.connections.len())
            .field("roles", &self.roles)
            .finish()
    }
}

impl EventRouter {
    /// Empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an unidentified connection.
    pub fn register(&mut self, connection: ConnectionId, outbound: UnboundedSender<Event>) {
        self.connections.insert(
            connection,
            Connection {
                outbound,
                identity: None,
            },
        );
        debug!(%connection, "connection registered");
    }

    /// Binds `idn` to a connection and files it under the idn's role.
    pub fn identify(&mut self, connection: ConnectionId, idn: &str) -> AppResult<ClientIdentity> {
        let identity: ClientIdentity = idn.parse()?;
        let Some(entry) = self.connections.get_mut(&connection) else {
            warn!(%connection, idn, "identification from unknown connection");
            return Ok(identity);
        };
        if let Some(previous) = entry.identity.replace(identity.clone()) {
            if let Some(members) = self.roles.get_mut(&previous.role) {
                members.remove(&connection);
            }
        }
        self.roles.entry(identity.role).or_default().insert(connection);
        info!(%connection, %identity, "client identified");
        Ok(identity)
    }

    /// Identity of a connection, if it sent one.
    pub fn identity(&self, connection: ConnectionId) -> Option<&ClientIdentity> {
        self.connections
            .get(&connection)
            .and_then(|c| c.identity.as_ref())
    }

    /// Connections currently filed under `role`.
    pub fn connections_of(&self, role: Role) -> Vec<ConnectionId> {
        self.roles
            .get(&role)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether any connection has `role`.
    pub fn is_role_connected(&self, role: Role) -> bool {
        self.roles.get(&role).is_some_and(|m| !m.is_empty())
    }

    /// Sends to one connection. Returns false if it is gone.
    pub fn send_to(&self, connection: ConnectionId, event: Event) -> bool {
        let Some(entry) = self.connections.get(&connection) else {
            return false;
        };
        let name = event.name();
        let sent = entry.outbound.send(event).is_ok();
        if !sent {
            debug!(%connection, event = name, "connection closed before delivery");
        }
        sent
    }

    /// Sends to every connection of `role`. Returns how many received it.
    pub fn route_to_role(&self, role: Role, event: &Event) -> usize {
        let delivered = self
            .connections_of(role)
            .into_iter()
            .filter(|&connection| self.send_to(connection, event.clone()))
            .count();
        debug!(%role, event = event.name(), delivered, "routed");
        delivered
    }

    /// Forgets a connection. The identity it had is returned.
    pub fn disconnect(&mut self, connection: ConnectionId) -> Option<ClientIdentity> {
        let identity = self.connections.remove(&connection)?.identity;
        if let Some(identity) = &identity {
            if let Some(members) = self.roles.get_mut(&identity.role) {
                members.remove(&connection);
            }
            info!(%connection, %identity, "client disconnected");
        }
        identity
    }
}

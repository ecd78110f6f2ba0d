//! Connected-client roster for the world server
//!
//! This module tracks every open connection, independent of which map the
//! player is on:
//! - Connection lifecycle (connect, join, disconnect, idle timeout)
//! - Capacity management
//! - Player name uniqueness across the whole process
//!
//! A connection is counted against capacity from the moment it is accepted;
//! it gets a name once its handoff has been redeemed.

use crate::entity::EntityId;
use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("client {0} is not connected")]
    UnknownClient(u32),

    #[error("{0} is already logged in")]
    NameInUse(String),
}

/// One open connection
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: u32,
    /// Remote address of the socket
    pub addr: SocketAddr,
    /// Player name, once the client has joined
    pub name: Option<String>,
    /// The player entity this connection controls
    pub entity: Option<EntityId>,
    /// Last time we received any frame from this client
    pub last_seen: Instant,
    /// Tells the connection task to hang up, with a reason
    kick: Option<oneshot::Sender<String>>,
}

impl Client {
    /// Creates a new, not yet joined client marked as recently active
    pub fn new(id: u32, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            name: None,
            entity: None,
            last_seen: Instant::now(),
            kick: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Returns true if nothing has been received from this client within
    /// `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all connected clients
///
/// The ClientManager enforces the server capacity limit and guarantees that
/// at most one connection plays under any given name. The network layer
/// shares it between connection tasks behind a lock.
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<u32, Client>,
    /// Client ID owning each player name
    names: HashMap<String, u32>,
    /// Next available client ID for new connections
    next_client_id: u32,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity limit.
    /// Client IDs start from 1.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            names: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Attempts to add a new client connection
    ///
    /// Returns the client ID and the receiver its connection task watches
    /// for [`kick`](Self::kick), or None if the server is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<(u32, oneshot::Receiver<String>)> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let (kick, kicked) = oneshot::channel();
        let mut client = Client::new(client_id, addr);
        client.kick = Some(kick);

        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, client);

        Some((client_id, kicked))
    }

    /// Binds a player name and entity to a connection
    ///
    /// Fails if another connection already plays under that name. The
    /// earlier session keeps the name; the newcomer is turned away.
    pub fn join(&mut self, client_id: u32, name: &str, entity: EntityId) -> Result<(), ClientError> {
        if let Some(owner) = self.names.get(name) {
            if *owner != client_id {
                return Err(ClientError::NameInUse(name.to_string()));
            }
        }

        let client = self
            .clients
            .get_mut(&client_id)
            .ok_or(ClientError::UnknownClient(client_id))?;
        client.name = Some(name.to_string());
        client.entity = Some(entity);
        client.touch();
        self.names.insert(name.to_string(), client_id);

        info!("Client {} joined as {}", client_id, name);
        Ok(())
    }

    /// Removes a client from the server and releases its name
    ///
    /// Returns the client if it was still connected. Handles explicit
    /// disconnects, dropped sockets and timeouts alike.
    pub fn remove_client(&mut self, client_id: &u32) -> Option<Client> {
        let client = self.clients.remove(client_id)?;
        if let Some(name) = &client.name {
            if self.names.get(name) == Some(client_id) {
                self.names.remove(name);
            }
        }
        info!("Client {} disconnected", client.id);
        Some(client)
    }

    /// Records activity from a client. Returns false if the ID is unknown.
    pub fn touch(&mut self, client_id: u32) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    /// Asks a connection to hang up. Returns false if the client is unknown
    /// or has already been kicked.
    pub fn kick(&mut self, client_id: u32, reason: &str) -> bool {
        let Some(kick) = self.clients.get_mut(&client_id).and_then(|c| c.kick.take()) else {
            return false;
        };
        info!("Kicking client {}: {}", client_id, reason);
        kick.send(reason.to_string()).is_ok()
    }

    pub fn get(&self, client_id: u32) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    /// Finds the connection playing under `name`
    pub fn find_client_by_name(&self, name: &str) -> Option<u32> {
        self.names.get(name).copied()
    }

    /// Lists clients that have been silent for longer than `timeout`
    ///
    /// The clients stay registered; their connection tasks remove them
    /// while tearing down.
    pub fn check_timeouts(&self, timeout: Duration) -> Vec<u32> {
        self.clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Gets all client IDs and their network addresses
    pub fn get_client_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

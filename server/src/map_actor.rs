//! Per-map actor.
//!
//! Each map is owned by exactly one task that drains a bounded command
//! inbox in arrival order. Connection tasks only ever hold a [`MapHandle`]
//! and never touch the map directly. Notifications produced by a command are
//! handed to the players' outboxes once the command has finished mutating
//! the map; delayed departures run as timer tasks keyed by
//! (observer, subject) so they can be flushed or dropped later.

use crate::aoi::Notification;
use crate::entity::{Entity, EntityId, Outbox};
use crate::geometry::Point;
use crate::map::{Map, MapError, Rejected, Warp};
use log::{debug, info, warn};
use shared::{Direction, Packet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Rejected(#[from] Rejected),

    #[error("map {0} is not running")]
    Unavailable(u16),
}

/// What became of a walk request.
#[derive(Debug)]
pub enum WalkOutcome {
    Moved,
    /// The entity stepped onto a warp and has already been removed from this
    /// map; the caller owns it until it is inserted at the destination.
    Warped { entity: Box<Entity>, warp: Warp },
}

type Inspector = Box<dyn FnOnce(&Map) + Send>;

pub enum MapCommand {
    Insert {
        entity: Box<Entity>,
        at: Point,
        update_client: bool,
        reply: oneshot::Sender<Result<(), Rejected>>,
    },
    Remove {
        id: EntityId,
        reply: oneshot::Sender<Option<Entity>>,
    },
    Walk {
        id: EntityId,
        direction: Direction,
        reply: oneshot::Sender<Result<WalkOutcome, MapError>>,
    },
    Click {
        id: EntityId,
        at: Point,
    },
    Say {
        id: EntityId,
        text: String,
        shout: bool,
    },
    RequestExchange {
        id: EntityId,
        target: EntityId,
    },
    ToggleDoors {
        at: Point,
        reply: oneshot::Sender<Result<(), MapError>>,
    },
    Inspect(Inspector),
    Shutdown,
}

/// Cloneable sending side of a map's inbox.
#[derive(Debug, Clone)]
pub struct MapHandle {
    map_id: u16,
    sender: mpsc::Sender<MapCommand>,
}

impl MapHandle {
    pub fn channel(map_id: u16, capacity: usize) -> (Self, mpsc::Receiver<MapCommand>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (MapHandle { map_id, sender }, receiver)
    }

    pub fn map_id(&self) -> u16 {
        self.map_id
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn send(&self, command: MapCommand) -> Result<(), RequestError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| RequestError::Unavailable(self.map_id))
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> MapCommand,
    ) -> Result<T, RequestError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response
            .await
            .map_err(|_| RequestError::Unavailable(self.map_id))
    }

    pub async fn insert(
        &self,
        entity: Entity,
        at: Point,
        update_client: bool,
    ) -> Result<(), RequestError> {
        self.request(|reply| MapCommand::Insert {
            entity: Box::new(entity),
            at,
            update_client,
            reply,
        })
        .await??;
        Ok(())
    }

    pub async fn remove(&self, id: EntityId) -> Result<Option<Entity>, RequestError> {
        self.request(|reply| MapCommand::Remove { id, reply }).await
    }

    pub async fn walk(&self, id: EntityId, direction: Direction) -> Result<WalkOutcome, RequestError> {
        Ok(self
            .request(|reply| MapCommand::Walk {
                id,
                direction,
                reply,
            })
            .await??)
    }

    pub async fn click(&self, id: EntityId, at: Point) -> Result<(), RequestError> {
        self.send(MapCommand::Click { id, at }).await
    }

    pub async fn say(&self, id: EntityId, text: String, shout: bool) -> Result<(), RequestError> {
        self.send(MapCommand::Say { id, text, shout }).await
    }

    pub async fn request_exchange(&self, id: EntityId, target: EntityId) -> Result<(), RequestError> {
        self.send(MapCommand::RequestExchange { id, target }).await
    }

    pub async fn toggle_doors(&self, at: Point) -> Result<(), RequestError> {
        Ok(self
            .request(|reply| MapCommand::ToggleDoors { at, reply })
            .await??)
    }

    /// Runs `f` against the map inside the actor and returns its result.
    pub async fn inspect<R, F>(&self, f: F) -> Result<R, RequestError>
    where
        R: Send + 'static,
        F: FnOnce(&Map) -> R + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let inspector: Inspector = Box::new(move |map: &Map| {
            let _ = reply.send(f(map));
        });
        self.send(MapCommand::Inspect(inspector)).await?;
        response
            .await
            .map_err(|_| RequestError::Unavailable(self.map_id))
    }

    pub async fn shutdown(&self) -> Result<(), RequestError> {
        self.send(MapCommand::Shutdown).await
    }
}

struct PendingDeparture {
    handle: JoinHandle<()>,
    claimed: Arc<AtomicBool>,
    outbox: Outbox,
    packet: Packet,
}

impl PendingDeparture {
    /// Delivers now unless the timer already did. Either way the timer is
    /// stopped.
    fn flush(self) {
        if !self.claimed.swap(true, Ordering::AcqRel) {
            self.outbox.deliver(self.packet);
        }
        self.handle.abort();
    }

    fn cancel(self) {
        self.claimed.store(true, Ordering::Release);
        self.handle.abort();
    }
}

/// Hands notifications to outboxes and owns the delayed departure timers.
#[derive(Default)]
pub struct Dispatcher {
    pending: HashMap<(EntityId, EntityId), PendingDeparture>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&mut self, notifications: Vec<Notification>) {
        self.pending.retain(|_, p| !p.handle.is_finished());

        for notification in notifications {
            let key = notification.subject.map(|s| (notification.recipient, s));

            // Only departures are delayed, and they always name their subject
            if let (Some(delay), Some(key)) = (notification.delay, key) {
                if let Some(previous) = self.pending.remove(&key) {
                    previous.flush();
                }
                self.schedule(key, notification.outbox, notification.packet, delay);
                continue;
            }

            // A subject reappearing before its departure fired: the client
            // must see the departure first
            if let (Some(key), Packet::EntityAppeared { .. }) = (key, &notification.packet) {
                if let Some(previous) = self.pending.remove(&key) {
                    debug!("Flushing pending departure of {} for {}", key.1, key.0);
                    previous.flush();
                }
            }

            debug!(
                "Delivering {} to {}",
                notification.packet.kind(),
                notification.recipient
            );
            notification.outbox.deliver(notification.packet);
        }
    }

    fn schedule(
        &mut self,
        key: (EntityId, EntityId),
        outbox: Outbox,
        packet: Packet,
        delay: std::time::Duration,
    ) {
        let claimed = Arc::new(AtomicBool::new(false));
        let handle = {
            let claimed = Arc::clone(&claimed);
            let outbox = outbox.clone();
            let packet = packet.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if !claimed.swap(true, Ordering::AcqRel) {
                    outbox.deliver(packet);
                }
            })
        };
        self.pending.insert(
            key,
            PendingDeparture {
                handle,
                claimed,
                outbox,
                packet,
            },
        );
    }

    /// Drops every pending departure addressed to `observer`.
    pub fn cancel_observer(&mut self, observer: EntityId) {
        let keys: Vec<(EntityId, EntityId)> = self
            .pending
            .keys()
            .filter(|(recipient, _)| *recipient == observer)
            .copied()
            .collect();
        for key in keys {
            if let Some(pending) = self.pending.remove(&key) {
                pending.cancel();
            }
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.cancel();
        }
    }
}

pub struct MapActor {
    map: Map,
    inbox: mpsc::Receiver<MapCommand>,
    dispatcher: Dispatcher,
}

impl MapActor {
    pub fn new(map: Map, inbox: mpsc::Receiver<MapCommand>) -> Self {
        MapActor {
            map,
            inbox,
            dispatcher: Dispatcher::new(),
        }
    }

    /// Spawns an actor for `map` and returns the handle to its inbox.
    pub fn spawn(map: Map, capacity: usize) -> (MapHandle, JoinHandle<Map>) {
        let (handle, inbox) = MapHandle::channel(map.id, capacity);
        let task = tokio::spawn(MapActor::new(map, inbox).run());
        (handle, task)
    }

    /// Processes commands until the inbox closes or a shutdown arrives, then
    /// hands the map back.
    pub async fn run(mut self) -> Map {
        info!("Map {} ({}) is running", self.map.id, self.map.name);

        while let Some(command) = self.inbox.recv().await {
            if !self.handle(command) {
                break;
            }
            debug_assert!(self.map.is_consistent());
        }

        self.dispatcher.cancel_all();
        info!("Map {} ({}) stopped", self.map.id, self.map.name);
        self.map
    }

    fn handle(&mut self, command: MapCommand) -> bool {
        match command {
            MapCommand::Insert {
                entity,
                at,
                update_client,
                reply,
            } => {
                let result = self
                    .map
                    .insert(*entity, at, update_client)
                    .map(|notifications| self.dispatcher.dispatch(notifications));
                if let Err(rejected) = &result {
                    info!("Map {} refused {}: {}", self.map.id, rejected.entity.name, rejected);
                }
                let _ = reply.send(result);
            }

            MapCommand::Remove { id, reply } => {
                let _ = reply.send(self.remove(id));
            }

            MapCommand::Walk { id, direction, reply } => {
                let result = self.map.walk(id, direction).map(|moved| {
                    self.dispatcher.dispatch(moved.notifications);
                    match moved.warp {
                        Some(warp) => match self.remove(id) {
                            Some(entity) => {
                                debug!(
                                    "{} warps from map {} to map {}",
                                    entity.name, self.map.id, warp.target_map
                                );
                                WalkOutcome::Warped {
                                    entity: Box::new(entity),
                                    warp,
                                }
                            }
                            None => WalkOutcome::Moved,
                        },
                        None => WalkOutcome::Moved,
                    }
                });
                let _ = reply.send(result);
            }

            MapCommand::Click { id, at } => match self.map.click(id, at) {
                Ok(notifications) => self.dispatcher.dispatch(notifications),
                Err(e) => debug!("Click on map {} ignored: {}", self.map.id, e),
            },

            MapCommand::Say { id, text, shout } => match self.map.say(id, &text, shout) {
                Ok(notifications) => self.dispatcher.dispatch(notifications),
                Err(e) => debug!("Chat on map {} ignored: {}", self.map.id, e),
            },

            MapCommand::RequestExchange { id, target } => {
                match self.map.request_exchange(id, target) {
                    Ok(notifications) => self.dispatcher.dispatch(notifications),
                    Err(e) => debug!("Exchange request on map {} ignored: {}", self.map.id, e),
                }
            }

            MapCommand::ToggleDoors { at, reply } => {
                let result = self
                    .map
                    .toggle_doors(at)
                    .map(|notifications| self.dispatcher.dispatch(notifications));
                if let Err(e) = &result {
                    warn!("Map {}: {}", self.map.id, e);
                }
                let _ = reply.send(result);
            }

            MapCommand::Inspect(inspector) => inspector(&self.map),

            MapCommand::Shutdown => return false,
        }
        true
    }

    fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let (entity, notifications) = self.map.remove(id)?;
        if entity.receives_notifications() {
            self.dispatcher.cancel_observer(id);
        }
        self.dispatcher.dispatch(notifications);
        Some(entity)
    }
}

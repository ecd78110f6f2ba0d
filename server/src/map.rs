//! One map of the world: the entity registry, its spatial index, the
//! collision grid and the per-tile registries of doors, signposts, reactors
//! and warps.
//!
//! Every entity in `objects` is also in `index` and vice versa; `users` holds
//! exactly the players in `objects`, keyed by name. All mutation goes through
//! `&mut self`, so a map is only ever changed by the actor that owns it.
//! Mutating operations return the notifications they caused instead of
//! sending them, delivery is the actor's job.

use crate::aoi::{self, Notification, ViewChange};
use crate::entity::{DoorState, Entity, EntityId, EntityKind};
use crate::exchange::{ExchangeBook, ExchangeService};
use crate::geometry::{self, Point, Rect};
use crate::spatial::QuadTree;
use log::{debug, info};
use shared::{Direction, Packet};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("entity {0} is already on the map")]
    AlreadyPresent(EntityId),

    #[error("({x}, {y}) is outside the map")]
    OutOfBounds { x: u8, y: u8 },

    #[error("a player named {0} is already on the map")]
    NameTaken(String),

    #[error("entity {0} is not on the map")]
    NotPresent(EntityId),

    #[error("no door at ({x}, {y})")]
    NoDoor { x: u8, y: u8 },
}

/// An insert that was refused, handing the entity back to the caller.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct Rejected {
    pub reason: MapError,
    pub entity: Box<Entity>,
}

/// A tile that moves whoever steps on it to another map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Warp {
    pub source: Point,
    pub target_map: u16,
    pub target: Point,
    pub min_level: u8,
    pub max_level: u8,
    pub min_ability: u8,
    pub mobs_can_use: bool,
}

impl Warp {
    pub fn admits(&self, entity: &Entity) -> bool {
        match entity.session() {
            Some(session) => {
                (self.min_level..=self.max_level).contains(&session.level)
                    && session.ability >= self.min_ability
            }
            None => self.mobs_can_use,
        }
    }
}

/// A tile that opens the world map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldWarp {
    pub at: Point,
    pub world_map: u8,
    pub min_level: u8,
    pub max_level: u8,
    pub min_ability: u8,
}

/// Result of a walk request.
#[derive(Debug, Default)]
pub struct Moved {
    pub notifications: Vec<Notification>,
    /// Set when the entity stepped onto a warp it is allowed to use.
    pub warp: Option<Warp>,
}

pub struct Map {
    pub id: u16,
    pub name: String,
    pub size: String,
    pub music: u8,
    width: u8,
    height: u8,
    checksum: u16,
    walls: Vec<bool>,
    index: QuadTree<EntityId>,
    objects: HashMap<EntityId, Entity>,
    users: HashMap<String, EntityId>,
    doors: HashMap<Point, EntityId>,
    signposts: HashMap<Point, EntityId>,
    reactors: HashMap<Point, EntityId>,
    warps: HashMap<Point, Warp>,
    world_warps: HashMap<Point, WorldWarp>,
    exchanges: Box<dyn ExchangeService>,
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("objects", &self.objects.len())
            .field("users", &self.users.len())
            .finish()
    }
}

impl Map {
    pub fn new(id: u16, name: impl Into<String>, width: u8, height: u8) -> Self {
        Self {
            id,
            name: name.into(),
            size: String::new(),
            music: 0,
            width,
            height,
            checksum: 0,
            walls: vec![false; usize::from(width) * usize::from(height)],
            index: QuadTree::new(width, height),
            objects: HashMap::new(),
            users: HashMap::new(),
            doors: HashMap::new(),
            signposts: HashMap::new(),
            reactors: HashMap::new(),
            warps: HashMap::new(),
            world_warps: HashMap::new(),
            exchanges: Box::new(ExchangeBook::new()),
        }
    }

    pub fn with_exchanges(mut self, exchanges: Box<dyn ExchangeService>) -> Self {
        self.exchanges = exchanges;
        self
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        self.checksum = checksum;
    }

    pub fn is_valid_point(&self, x: i16, y: i16) -> bool {
        x >= 0 && x < i16::from(self.width) && y >= 0 && y < i16::from(self.height)
    }

    fn tile_index(&self, point: Point) -> Option<usize> {
        if !self.is_valid_point(i16::from(point.x), i16::from(point.y)) {
            return None;
        }
        Some(usize::from(point.y) * usize::from(self.width) + usize::from(point.x))
    }

    /// Tiles outside the map count as walls.
    pub fn is_wall(&self, point: Point) -> bool {
        self.tile_index(point).map_or(true, |i| self.walls[i])
    }

    pub fn set_wall(&mut self, point: Point, wall: bool) {
        if let Some(i) = self.tile_index(point) {
            self.walls[i] = wall;
        }
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.objects.get(&id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &Entity> {
        self.objects.values()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn user(&self, name: &str) -> Option<&Entity> {
        self.users.get(name).and_then(|id| self.objects.get(id))
    }

    pub fn user_names(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Everything currently indexed inside `rect`.
    pub fn neighbours(&self, rect: &Rect) -> Vec<&Entity> {
        self.index
            .query(rect)
            .into_iter()
            .filter_map(|id| self.objects.get(&id))
            .collect()
    }

    pub fn tile_contents(&self, point: Point) -> Vec<&Entity> {
        self.neighbours(&Rect::new(i32::from(point.x), i32::from(point.y), 1, 1))
    }

    pub fn door_at(&self, point: Point) -> Option<&DoorState> {
        self.doors
            .get(&point)
            .and_then(|id| self.objects.get(id))
            .and_then(Entity::door_state)
    }

    pub fn signpost_at(&self, point: Point) -> Option<&Entity> {
        self.signposts.get(&point).and_then(|id| self.objects.get(id))
    }

    pub fn reactor_at(&self, point: Point) -> Option<&Entity> {
        self.reactors.get(&point).and_then(|id| self.objects.get(id))
    }

    pub fn door_count(&self) -> usize {
        self.doors.len()
    }

    pub fn add_warp(&mut self, warp: Warp) {
        self.warps.insert(warp.source, warp);
    }

    pub fn warp_at(&self, point: Point) -> Option<&Warp> {
        self.warps.get(&point)
    }

    pub fn insert_signpost(
        &mut self,
        message: impl Into<String>,
        at: Point,
    ) -> Result<Vec<Notification>, Rejected> {
        self.insert(Entity::signpost(message), at, false)
    }

    pub fn insert_reactor(
        &mut self,
        name: impl Into<String>,
        script: impl Into<String>,
        at: Point,
    ) -> Result<Vec<Notification>, Rejected> {
        self.insert(Entity::reactor(name, script), at, false)
    }

    pub fn insert_world_warp(&mut self, warp: WorldWarp) {
        self.world_warps.insert(warp.at, warp);
    }

    pub fn world_warp_at(&self, point: Point) -> Option<&WorldWarp> {
        self.world_warps.get(&point)
    }

    /// Places `entity` on the map at `at` and runs the entry protocol.
    ///
    /// Players are registered by name and, when `update_client` is set, are
    /// sent the map header and their location before anything else.
    pub fn insert(
        &mut self,
        mut entity: Entity,
        at: Point,
        update_client: bool,
    ) -> Result<Vec<Notification>, Rejected> {
        let refusal = if self.objects.contains_key(&entity.id) {
            Some(MapError::AlreadyPresent(entity.id))
        } else if !self.is_valid_point(i16::from(at.x), i16::from(at.y)) {
            Some(MapError::OutOfBounds { x: at.x, y: at.y })
        } else if entity.is_player() && self.users.contains_key(&entity.name) {
            Some(MapError::NameTaken(entity.name.clone()))
        } else {
            None
        };
        if let Some(reason) = refusal {
            return Err(Rejected {
                reason,
                entity: Box::new(entity),
            });
        }

        let id = entity.id;
        entity.position = at;
        self.index.insert(id, at);

        let mut notifications = Vec::new();
        match &entity.kind {
            EntityKind::Player(session) => {
                self.users.insert(entity.name.clone(), id);
                session.set_location(Some(self.id));
                if update_client {
                    notifications.extend(aoi::to_self(&entity, self.map_info()));
                    notifications.extend(aoi::to_self(&entity, Packet::Location { x: at.x, y: at.y }));
                }
                info!("{} entered map {} at ({}, {})", entity.name, self.id, at.x, at.y);
            }
            EntityKind::Reactor { .. } => {
                self.reactors.insert(at, id);
            }
            EntityKind::Signpost { .. } => {
                self.signposts.insert(at, id);
            }
            EntityKind::Door(_) => {
                self.doors.insert(at, id);
            }
            _ => {}
        }
        self.objects.insert(id, entity);

        let subject = &self.objects[&id];
        let neighbours = self.neighbours(&geometry::viewport(at));
        notifications.extend(aoi::entry(subject, &neighbours));

        debug!(
            "Inserted {} {} on map {}, {} notifications",
            subject.name,
            id,
            self.id,
            notifications.len()
        );
        Ok(notifications)
    }

    /// Takes `id` off the map and runs the departure protocol. Removing a
    /// player also cancels any exchange it had open.
    pub fn remove(&mut self, id: EntityId) -> Option<(Entity, Vec<Notification>)> {
        let entity = self.objects.remove(&id)?;
        self.index.remove(&id);
        let at = entity.position;

        let mut notifications = Vec::new();
        if let EntityKind::Player(session) = &entity.kind {
            if self.users.get(&entity.name) == Some(&id) {
                self.users.remove(&entity.name);
            }
            session.set_location(None);

            if let Some(exchange) = self.exchanges.cancel_for(id) {
                notifications.extend(aoi::to_self(&entity, Packet::ExchangeCancelled));
                if let Some(partner) = self.objects.get(&exchange.other(id)) {
                    notifications.extend(aoi::to_self(partner, Packet::ExchangeCancelled));
                }
            }
            info!("{} left map {}", entity.name, self.id);
        }

        let mut vacated = false;
        for registry in [&mut self.doors, &mut self.signposts, &mut self.reactors] {
            if registry.get(&at) == Some(&id) {
                registry.remove(&at);
                vacated = true;
            }
        }
        if vacated {
            self.reregister(at);
        }

        let neighbours = self.neighbours(&geometry::viewport(at));
        notifications.extend(aoi::departure(&entity, &neighbours));

        debug!(
            "Removed {} {} from map {}, {} notifications",
            entity.name,
            id,
            self.id,
            notifications.len()
        );
        Some((entity, notifications))
    }

    /// Points any empty registry slot at `at` back at an entity of that kind
    /// still standing there, preferring the most recently created one.
    fn reregister(&mut self, at: Point) {
        let mut remaining: Vec<EntityId> = self.tile_contents(at).iter().map(|e| e.id).collect();
        remaining.sort_unstable_by(|a, b| b.cmp(a));

        for id in remaining {
            let Some(entity) = self.objects.get(&id) else {
                continue;
            };
            let registry = match &entity.kind {
                EntityKind::Reactor { .. } => &mut self.reactors,
                EntityKind::Signpost { .. } => &mut self.signposts,
                EntityKind::Door(_) => &mut self.doors,
                _ => continue,
            };
            registry.entry(at).or_insert(id);
        }
    }

    /// Moves `id` one tile in `direction`, updating the index in place.
    ///
    /// A blocked step turns the entity and resyncs its client. A successful
    /// step runs departure for neighbours that dropped out of view, entry for
    /// those that came into view, and a walk update for the rest.
    pub fn walk(&mut self, id: EntityId, direction: Direction) -> Result<Moved, MapError> {
        let (from, target) = {
            let entity = self.objects.get_mut(&id).ok_or(MapError::NotPresent(id))?;
            entity.direction = direction;
            (entity.position, entity.position.step(direction))
        };

        let target = match target {
            Some(target) if !self.is_wall(target) => target,
            _ => {
                let entity = &self.objects[&id];
                return Ok(Moved {
                    notifications: aoi::to_self(entity, Packet::Location { x: from.x, y: from.y })
                        .into_iter()
                        .collect(),
                    warp: None,
                });
            }
        };

        let before: Vec<EntityId> = self
            .index
            .query(&geometry::viewport(from))
            .into_iter()
            .filter(|other| *other != id)
            .collect();
        self.index.relocate(&id, target);
        if let Some(entity) = self.objects.get_mut(&id) {
            entity.position = target;
        }
        let after: Vec<EntityId> = self
            .index
            .query(&geometry::viewport(target))
            .into_iter()
            .filter(|other| *other != id)
            .collect();

        let change = ViewChange::between(&before, &after);
        let entity = &self.objects[&id];
        let lookup = |ids: &[EntityId]| -> Vec<&Entity> {
            ids.iter().filter_map(|i| self.objects.get(i)).collect()
        };

        let mut notifications = Vec::new();
        notifications.extend(aoi::departure(entity, &lookup(&change.left)));
        notifications.extend(aoi::entry(entity, &lookup(&change.entered)));
        notifications.extend(aoi::walked(entity, &lookup(&change.stayed)));
        notifications.extend(aoi::to_self(entity, Packet::Location { x: target.x, y: target.y }));

        let warp = self
            .warps
            .get(&target)
            .filter(|warp| warp.admits(entity))
            .copied();

        Ok(Moved {
            notifications,
            warp,
        })
    }

    /// Flips the door at `at` and tells every player in view.
    pub fn toggle_door(&mut self, at: Point) -> Result<Vec<Notification>, MapError> {
        let no_door = MapError::NoDoor { x: at.x, y: at.y };
        let id = *self.doors.get(&at).ok_or(no_door.clone())?;
        let state = {
            let door = self
                .objects
                .get_mut(&id)
                .and_then(Entity::door_state_mut)
                .ok_or(no_door)?;
            door.toggle();
            *door
        };

        if state.update_collision {
            let wall = self.is_wall(at);
            self.set_wall(at, !wall);
        }

        debug!(
            "Door {}@{},{} is now closed: {}, collision: {}",
            self.name,
            at.x,
            at.y,
            state.closed,
            self.is_wall(at)
        );

        let observers = self.neighbours(&geometry::viewport(at));
        Ok(aoi::door_changed(at, &state, &observers))
    }

    /// Toggles the door at `at` together with the panels beside it: left and
    /// right for a left-right door, above and below for an up-down door.
    pub fn toggle_doors(&mut self, at: Point) -> Result<Vec<Notification>, MapError> {
        let left_right = self
            .door_at(at)
            .map(|door| door.left_right)
            .ok_or(MapError::NoDoor { x: at.x, y: at.y })?;

        let mut notifications = self.toggle_door(at)?;

        let offsets: [(i16, i16); 2] = if left_right {
            [(-1, 0), (1, 0)]
        } else {
            [(0, -1), (0, 1)]
        };
        for (dx, dy) in offsets {
            if let Some(panel) = at.offset(dx, dy) {
                if self.doors.contains_key(&panel) {
                    notifications.extend(self.toggle_door(panel)?);
                }
            }
        }

        Ok(notifications)
    }

    /// A player clicked a tile: doors toggle, signposts show their message.
    pub fn click(&mut self, id: EntityId, at: Point) -> Result<Vec<Notification>, MapError> {
        let position = self.get(id).ok_or(MapError::NotPresent(id))?.position;
        if !geometry::viewport(position).contains(at) {
            return Ok(Vec::new());
        }

        if self.doors.contains_key(&at) {
            return self.toggle_doors(at);
        }

        if let Some(EntityKind::Signpost { message }) = self.signpost_at(at).map(|s| &s.kind) {
            let packet = Packet::SignpostMessage {
                text: message.clone(),
            };
            return Ok(aoi::to_self(&self.objects[&id], packet).into_iter().collect());
        }

        Ok(Vec::new())
    }

    /// Chat from `id` to every player within earshot.
    pub fn say(&self, id: EntityId, text: &str, shout: bool) -> Result<Vec<Notification>, MapError> {
        let speaker = self.get(id).ok_or(MapError::NotPresent(id))?;
        let rect = if shout {
            geometry::shout_viewport(speaker.position)
        } else {
            geometry::viewport(speaker.position)
        };

        let packet = Packet::Chat {
            from: speaker.name.clone(),
            text: text.to_string(),
            shout,
        };
        Ok(aoi::broadcast(&self.neighbours(&rect), packet))
    }

    /// Opens an exchange between two players in view of each other.
    pub fn request_exchange(
        &mut self,
        id: EntityId,
        target: EntityId,
    ) -> Result<Vec<Notification>, MapError> {
        let initiator = self.get(id).ok_or(MapError::NotPresent(id))?;
        let partner = self.get(target).ok_or(MapError::NotPresent(target))?;
        if !initiator.is_player()
            || !partner.is_player()
            || !geometry::viewport(initiator.position).contains(partner.position)
        {
            return Ok(Vec::new());
        }

        let Some(exchange) = self.exchanges.open(id, target) else {
            return Ok(Vec::new());
        };

        let mut notifications = Vec::new();
        for participant in [exchange.initiator, exchange.partner] {
            let entity = &self.objects[&participant];
            let packet = Packet::ExchangeStarted {
                partner: exchange.other(participant).0,
            };
            notifications.extend(aoi::to_self(entity, packet));
        }
        Ok(notifications)
    }

    pub fn map_info(&self) -> Packet {
        Packet::MapInfo {
            map_id: self.id,
            width: self.width,
            height: self.height,
            checksum: self.checksum,
            name: self.name.clone(),
            music: self.music,
        }
    }

    /// True when the registry, index and user table agree with each other.
    pub fn is_consistent(&self) -> bool {
        let indexed = self.index.len() == self.objects.len()
            && self
                .objects
                .iter()
                .all(|(id, e)| self.index.position(id) == Some(e.position));

        let players = self.objects.values().filter(|e| e.is_player()).count();
        let users = self.users.len() == players
            && self
                .users
                .iter()
                .all(|(name, id)| self.objects.get(id).is_some_and(|e| &e.name == name));

        let registered = [&self.doors, &self.signposts, &self.reactors]
            .iter()
            .all(|registry| {
                registry
                    .iter()
                    .all(|(at, id)| self.objects.get(id).is_some_and(|e| e.position == *at))
            });

        indexed && users && registered
    }
}

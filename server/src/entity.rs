use crate::geometry::Point;
use bitflags::bitflags;
use log::{debug, warn};
use shared::{Direction, EntityClass, EntityView, Packet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

const GOLD_SPRITE: u16 = 0x8000 + 140;

static NEXT_ENTITY_ID: AtomicU32 = AtomicU32::new(1);

// Process-wide entity identifier, stable across map changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

impl EntityId {
    pub fn next() -> Self {
        EntityId(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// What an entity can do on a map. Notification and registry behaviour
    /// dispatch on these flags rather than on the concrete kind.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        const POSITIONED             = 1 << 0;
        const NAMED                  = 1 << 1;
        const VISIBLE                = 1 << 2;
        const PLAYER_CONTROLLED      = 1 << 3;
        const TOGGLABLE              = 1 << 4;
        const RECEIVES_NOTIFICATIONS = 1 << 5;
    }
}

// Sending half of a client's outbound packet queue
#[derive(Debug, Clone)]
pub struct Outbox {
    client_id: u32,
    sender: mpsc::Sender<Packet>,
}

impl Outbox {
    pub fn new(client_id: u32, sender: mpsc::Sender<Packet>) -> Self {
        Outbox { client_id, sender }
    }

    pub fn channel(client_id: u32, capacity: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Outbox::new(client_id, sender), receiver)
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    /// Queues a packet without waiting. A full or closed queue drops the
    /// packet and returns false; the caller carries on with other recipients.
    pub fn deliver(&self, packet: Packet) -> bool {
        match self.sender.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(packet)) => {
                warn!(
                    "Outbound queue for client {} is full, dropping {} packet",
                    self.client_id,
                    packet.kind()
                );
                false
            }
            Err(TrySendError::Closed(packet)) => {
                debug!(
                    "Client {} is gone, dropping {} packet",
                    self.client_id,
                    packet.kind()
                );
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Connection state carried by a player entity.
#[derive(Debug)]
pub struct Session {
    pub client_id: u32,
    pub outbox: Outbox,
    pub level: u8,
    pub ability: u8,
    location: watch::Sender<Option<u16>>,
}

impl Session {
    /// Creates a session together with the receiver the connection task uses
    /// to follow which map the player is currently on.
    pub fn new(client_id: u32, outbox: Outbox) -> (Self, watch::Receiver<Option<u16>>) {
        let (location, receiver) = watch::channel(None);
        let session = Session {
            client_id,
            outbox,
            level: 1,
            ability: 0,
            location,
        };
        (session, receiver)
    }

    pub fn set_location(&self, map_id: Option<u16>) {
        self.location.send_replace(map_id);
    }

    pub fn location(&self) -> Option<u16> {
        *self.location.borrow()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorState {
    pub closed: bool,
    pub left_right: bool,
    /// Whether toggling the door also flips the wall flag of its tile.
    pub update_collision: bool,
}

impl DoorState {
    pub fn toggle(&mut self) {
        self.closed = !self.closed;
    }
}

#[derive(Debug)]
pub enum EntityKind {
    Player(Session),
    Merchant,
    Reactor { script: String },
    Signpost { message: String },
    Gold { amount: u32 },
    Item { count: u32 },
    Door(DoorState),
}

#[derive(Debug)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub sprite: u16,
    pub position: Point,
    pub direction: Direction,
    pub kind: EntityKind,
}

impl Entity {
    pub fn new(name: impl Into<String>, sprite: u16, kind: EntityKind) -> Self {
        Entity {
            id: EntityId::next(),
            name: name.into(),
            sprite,
            position: Point::default(),
            direction: Direction::default(),
            kind,
        }
    }

    pub fn player(name: impl Into<String>, session: Session) -> Self {
        Entity::new(name, 0, EntityKind::Player(session))
    }

    pub fn merchant(name: impl Into<String>, sprite: u16) -> Self {
        Entity::new(name, sprite, EntityKind::Merchant)
    }

    pub fn reactor(name: impl Into<String>, script: impl Into<String>) -> Self {
        Entity::new(
            name,
            0,
            EntityKind::Reactor {
                script: script.into(),
            },
        )
    }

    pub fn signpost(message: impl Into<String>) -> Self {
        Entity::new(
            "Signpost",
            0,
            EntityKind::Signpost {
                message: message.into(),
            },
        )
    }

    pub fn gold(amount: u32) -> Self {
        Entity::new("Gold", GOLD_SPRITE, EntityKind::Gold { amount })
    }

    pub fn item(name: impl Into<String>, sprite: u16, count: u32) -> Self {
        Entity::new(name, sprite, EntityKind::Item { count })
    }

    pub fn door(state: DoorState) -> Self {
        Entity::new("Door", 0, EntityKind::Door(state))
    }

    pub fn capabilities(&self) -> Capabilities {
        let base = Capabilities::POSITIONED | Capabilities::NAMED | Capabilities::VISIBLE;
        match self.kind {
            EntityKind::Player(_) => {
                base | Capabilities::PLAYER_CONTROLLED | Capabilities::RECEIVES_NOTIFICATIONS
            }
            EntityKind::Door(_) => base | Capabilities::TOGGLABLE,
            _ => base,
        }
    }

    pub fn is_player(&self) -> bool {
        self.capabilities().contains(Capabilities::PLAYER_CONTROLLED)
    }

    pub fn receives_notifications(&self) -> bool {
        self.capabilities()
            .contains(Capabilities::RECEIVES_NOTIFICATIONS)
    }

    pub fn session(&self) -> Option<&Session> {
        match &self.kind {
            EntityKind::Player(session) => Some(session),
            _ => None,
        }
    }

    /// Outbound queue of an entity that receives notifications.
    pub fn outbox(&self) -> Option<&Outbox> {
        if !self.receives_notifications() {
            return None;
        }
        self.session().map(|session| &session.outbox)
    }

    pub fn door_state(&self) -> Option<&DoorState> {
        match &self.kind {
            EntityKind::Door(state) => Some(state),
            _ => None,
        }
    }

    pub fn door_state_mut(&mut self) -> Option<&mut DoorState> {
        match &mut self.kind {
            EntityKind::Door(state) => Some(state),
            _ => None,
        }
    }

    pub fn class(&self) -> EntityClass {
        match self.kind {
            EntityKind::Player(_) => EntityClass::Player,
            EntityKind::Merchant => EntityClass::Merchant,
            EntityKind::Reactor { .. } => EntityClass::Reactor,
            EntityKind::Signpost { .. } => EntityClass::Signpost,
            EntityKind::Gold { .. } => EntityClass::Gold,
            EntityKind::Item { .. } => EntityClass::Item,
            EntityKind::Door(_) => EntityClass::Door,
        }
    }

    pub fn view(&self) -> EntityView {
        EntityView {
            id: self.id.0,
            name: self.name.clone(),
            class: self.class(),
            x: self.position.x,
            y: self.position.y,
            sprite: self.sprite,
            direction: self.direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ids_are_unique() {
        let a = Entity::merchant("Riona", 1);
        let b = Entity::merchant("Riona", 1);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_capabilities_by_kind() {
        let (outbox, _rx) = Outbox::channel(1, 4);
        let (session, _location) = Session::new(1, outbox);
        let player = Entity::player("Kedian", session);
        assert!(player.is_player());
        assert!(player.receives_notifications());
        assert!(player.outbox().is_some());

        let gold = Entity::gold(50);
        assert!(!gold.is_player());
        assert!(!gold.receives_notifications());
        assert!(gold.outbox().is_none());
        assert_eq!(gold.class(), EntityClass::Gold);

        let door = Entity::door(DoorState {
            closed: true,
            left_right: true,
            update_collision: true,
        });
        assert!(door.capabilities().contains(Capabilities::TOGGLABLE));
        assert!(!door.is_player());
    }

    #[test]
    fn test_door_toggle() {
        let mut door = Entity::door(DoorState {
            closed: false,
            left_right: false,
            update_collision: false,
        });
        door.door_state_mut().unwrap().toggle();
        assert!(door.door_state().unwrap().closed);
        door.door_state_mut().unwrap().toggle();
        assert!(!door.door_state().unwrap().closed);
    }

    #[test]
    fn test_outbox_drops_when_full_or_closed() {
        let (outbox, mut rx) = Outbox::channel(3, 1);
        assert!(outbox.deliver(Packet::ExchangeCancelled));
        assert!(!outbox.deliver(Packet::ExchangeCancelled));
        assert_eq!(rx.try_recv().unwrap(), Packet::ExchangeCancelled);

        drop(rx);
        assert!(outbox.is_closed());
        assert!(!outbox.deliver(Packet::ExchangeCancelled));
    }

    #[test]
    fn test_session_location_is_observable() {
        let (outbox, _rx) = Outbox::channel(1, 4);
        let (session, location) = Session::new(1, outbox);
        assert_eq!(*location.borrow(), None);

        session.set_location(Some(136));
        assert_eq!(*location.borrow(), Some(136));
        assert_eq!(session.location(), Some(136));
    }

    #[test]
    fn test_view_reflects_position() {
        let mut merchant = Entity::merchant("Riona", 0x4005);
        merchant.position = Point::new(3, 4);
        merchant.direction = Direction::Left;

        let view = merchant.view();
        assert_eq!(view.id, merchant.id.0);
        assert_eq!((view.x, view.y), (3, 4));
        assert_eq!(view.class, EntityClass::Merchant);
        assert_eq!(view.direction, Direction::Left);
    }
}

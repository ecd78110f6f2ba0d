//! Area-of-interest notifications.
//!
//! These functions decide who has to be told what when an entity enters,
//! leaves or moves within a viewport. They never touch the map; the caller
//! queries the spatial index and passes in the neighbours it found. Both
//! directions of visibility are derived from the subject's own viewport,
//! which is valid because every entity shares the same viewport size.
//!
//! The result is a list of [`Notification`]s that the map actor delivers
//! after the mutation has completed.

use crate::entity::{DoorState, Entity, EntityId, Outbox};
use crate::geometry::Point;
use shared::{Packet, DEPARTURE_DELAY_MS};
use std::collections::HashSet;
use std::time::Duration;

pub const DEPARTURE_DELAY: Duration = Duration::from_millis(DEPARTURE_DELAY_MS);

/// One packet addressed to one player.
#[derive(Debug, Clone)]
pub struct Notification {
    pub recipient: EntityId,
    /// The entity the packet is about, if any.
    pub subject: Option<EntityId>,
    pub outbox: Outbox,
    pub packet: Packet,
    /// Deliver after this long instead of immediately.
    pub delay: Option<Duration>,
}

impl Notification {
    pub fn immediate(recipient: &Entity, outbox: &Outbox, packet: Packet) -> Self {
        Notification {
            recipient: recipient.id,
            subject: None,
            outbox: outbox.clone(),
            packet,
            delay: None,
        }
    }

    fn about(mut self, subject: EntityId) -> Self {
        self.subject = Some(subject);
        self
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A packet for `entity` itself, if it has a client.
pub fn to_self(entity: &Entity, packet: Packet) -> Option<Notification> {
    entity
        .outbox()
        .map(|outbox| Notification::immediate(entity, outbox, packet))
}

/// Entry protocol: every player neighbour learns about `subject`, and if
/// `subject` is a player it learns about every neighbour.
pub fn entry(subject: &Entity, neighbours: &[&Entity]) -> Vec<Notification> {
    let mut notifications = Vec::new();

    for neighbour in neighbours.iter().filter(|n| n.id != subject.id) {
        if let Some(outbox) = neighbour.outbox() {
            notifications.push(
                Notification::immediate(
                    neighbour,
                    outbox,
                    Packet::EntityAppeared {
                        entity: subject.view(),
                    },
                )
                .about(subject.id),
            );
        }

        if let Some(outbox) = subject.outbox() {
            notifications.push(
                Notification::immediate(
                    subject,
                    outbox,
                    Packet::EntityAppeared {
                        entity: neighbour.view(),
                    },
                )
                .about(neighbour.id),
            );
        }
    }

    notifications
}

/// Departure protocol. Player neighbours are told after
/// [`DEPARTURE_DELAY`] so the leaving animation can finish; a departing
/// player is told about its neighbours straight away.
pub fn departure(subject: &Entity, neighbours: &[&Entity]) -> Vec<Notification> {
    let mut notifications = Vec::new();

    for neighbour in neighbours.iter().filter(|n| n.id != subject.id) {
        if let Some(outbox) = neighbour.outbox() {
            notifications.push(
                Notification::immediate(neighbour, outbox, Packet::EntityDeparted { id: subject.id.0 })
                    .about(subject.id)
                    .delayed(DEPARTURE_DELAY),
            );
        }

        if let Some(outbox) = subject.outbox() {
            notifications.push(
                Notification::immediate(subject, outbox, Packet::EntityDeparted { id: neighbour.id.0 })
                    .about(neighbour.id),
            );
        }
    }

    notifications
}

/// Tells players that kept `subject` in view that it took a step.
pub fn walked(subject: &Entity, observers: &[&Entity]) -> Vec<Notification> {
    observers
        .iter()
        .filter(|o| o.id != subject.id)
        .filter_map(|observer| {
            observer.outbox().map(|outbox| {
                Notification::immediate(
                    observer,
                    outbox,
                    Packet::EntityWalked {
                        id: subject.id.0,
                        x: subject.position.x,
                        y: subject.position.y,
                        direction: subject.direction,
                    },
                )
                .about(subject.id)
            })
        })
        .collect()
}

/// Door state broadcast to every player in view of the door.
pub fn door_changed(at: Point, state: &DoorState, observers: &[&Entity]) -> Vec<Notification> {
    broadcast(
        observers,
        Packet::DoorChanged {
            x: at.x,
            y: at.y,
            closed: state.closed,
            left_right: state.left_right,
        },
    )
}

/// The same packet to every player among `observers`.
pub fn broadcast(observers: &[&Entity], packet: Packet) -> Vec<Notification> {
    observers
        .iter()
        .filter_map(|observer| {
            observer
                .outbox()
                .map(|outbox| Notification::immediate(observer, outbox, packet.clone()))
        })
        .collect()
}

/// How the set of neighbours changed between two viewport queries.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ViewChange {
    pub left: Vec<EntityId>,
    pub entered: Vec<EntityId>,
    pub stayed: Vec<EntityId>,
}

impl ViewChange {
    pub fn between(before: &[EntityId], after: &[EntityId]) -> Self {
        let before_set: HashSet<EntityId> = before.iter().copied().collect();
        let after_set: HashSet<EntityId> = after.iter().copied().collect();

        ViewChange {
            left: before
                .iter()
                .copied()
                .filter(|id| !after_set.contains(id))
                .collect(),
            entered: after
                .iter()
                .copied()
                .filter(|id| !before_set.contains(id))
                .collect(),
            stayed: after
                .iter()
                .copied()
                .filter(|id| before_set.contains(id))
                .collect(),
        }
    }
}

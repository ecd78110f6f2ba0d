//! Bilateral trade sessions between two players.
//!
//! Trading itself lives outside the map; the map only needs to open an
//! exchange between two players who can see each other and to cancel it
//! when either of them is removed.

use crate::entity::EntityId;
use log::info;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    pub id: u32,
    pub initiator: EntityId,
    pub partner: EntityId,
}

impl Exchange {
    /// The participant that is not `id`.
    pub fn other(&self, id: EntityId) -> EntityId {
        if self.initiator == id {
            self.partner
        } else {
            self.initiator
        }
    }
}

pub trait ExchangeService: Send {
    /// Opens an exchange between two players. Returns `None` when either of
    /// them is already trading.
    fn open(&mut self, initiator: EntityId, partner: EntityId) -> Option<Exchange>;

    /// Cancels the exchange `participant` is part of, if any.
    fn cancel_for(&mut self, participant: EntityId) -> Option<Exchange>;

    fn exchange_of(&self, participant: EntityId) -> Option<Exchange>;
}

/// In-memory exchange tracking.
#[derive(Debug, Default)]
pub struct ExchangeBook {
    next_id: u32,
    exchanges: HashMap<u32, Exchange>,
    by_participant: HashMap<EntityId, u32>,
}

impl ExchangeBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

impl ExchangeService for ExchangeBook {
    fn open(&mut self, initiator: EntityId, partner: EntityId) -> Option<Exchange> {
        if initiator == partner
            || self.by_participant.contains_key(&initiator)
            || self.by_participant.contains_key(&partner)
        {
            return None;
        }

        self.next_id += 1;
        let exchange = Exchange {
            id: self.next_id,
            initiator,
            partner,
        };
        self.exchanges.insert(exchange.id, exchange);
        self.by_participant.insert(initiator, exchange.id);
        self.by_participant.insert(partner, exchange.id);

        info!(
            "Exchange {} opened between {} and {}",
            exchange.id, initiator, partner
        );
        Some(exchange)
    }

    fn cancel_for(&mut self, participant: EntityId) -> Option<Exchange> {
        let id = self.by_participant.get(&participant).copied()?;
        let exchange = self.exchanges.remove(&id)?;
        self.by_participant.remove(&exchange.initiator);
        self.by_participant.remove(&exchange.partner);

        info!("Exchange {} cancelled by {}", exchange.id, participant);
        Some(exchange)
    }

    fn exchange_of(&self, participant: EntityId) -> Option<Exchange> {
        self.by_participant
            .get(&participant)
            .and_then(|id| self.exchanges.get(id))
            .copied()
    }
}

//! # World Server Library
//!
//! This library implements the map side of an online world: it keeps track of
//! who is standing where on every map, decides who can see whom, and tells
//! each connected player about the entities that enter and leave their view.
//!
//! ## Core Responsibilities
//!
//! ### Spatial World State
//! Every map owns a quadtree of the entities on it, plus registries for the
//! tiles that carry behaviour (doors, signposts, reactors, warps). The
//! quadtree answers "what is inside this rectangle" for viewport queries.
//!
//! ### Area of Interest
//! Players only hear about entities inside their viewport. Insertion, removal
//! and every step produce appear/depart/walk notifications for exactly the
//! observers whose view changed. Departures seen by a player are delivered
//! after a short delay, and are folded away if the entity reappears first.
//!
//! ### Connection Management
//! Clients arrive already authenticated by a login service. They present the
//! handoff token it issued, are placed on the spawn map and then send walk,
//! click and chat requests over a length-prefixed TCP stream.
//!
//! ## Architecture Design
//!
//! ### One Task Per Map
//! Each map is owned by a single actor task and is only mutated from there.
//! Connection tasks send commands through a [`map_actor::MapHandle`] and
//! await the reply, so requests on one map are applied in arrival order and
//! maps never lock each other.
//!
//! ### Per-Client Outboxes
//! Notifications are queued on a bounded channel per client and written by
//! that client's own writer task. A stalled socket fills its own queue and
//! loses packets without holding up a map.
//!
//! ## Module Organization
//!
//! - `geometry`: tile points, rectangles and viewports
//! - `spatial`: the quadtree index
//! - `entity`: entities, capabilities, sessions and outboxes
//! - `aoi`: appear/depart notification rules
//! - `exchange`: the exchange-cancellation boundary
//! - `map`: a single map and its registries
//! - `loader`: YAML map definitions, tile grids and sprite tables
//! - `map_actor`: per-map actor, handles and delayed departures
//! - `world`: every running map and cross-map warps
//! - `handoff`: redirect tokens from the login service
//! - `client_manager`: connection roster and idle timeouts
//! - `config`: command line configuration
//! - `network`: TCP server and per-connection tasks
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::world::World;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let (world, _maps) = World::load(&config.data_dir, config.map_inbox)?;
//!
//!     let server = Server::new(config, world).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod aoi;
pub mod client_manager;
pub mod config;
pub mod entity;
pub mod exchange;
pub mod geometry;
pub mod handoff;
pub mod loader;
pub mod map;
pub mod map_actor;
pub mod network;
pub mod spatial;
pub mod world;

//! All maps served by this process.
//!
//! The directory of map handles is built before any actor starts and never
//! changes afterwards, so it is shared as a plain `Arc`.

use crate::entity::Entity;
use crate::loader::{self, LoadError};
use crate::map::{Map, Warp};
use crate::map_actor::{MapActor, MapHandle, RequestError};
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct World {
    maps: Arc<HashMap<u16, MapHandle>>,
}

impl World {
    /// Starts one actor per map.
    pub fn spawn(maps: Vec<Map>, inbox_capacity: usize) -> (Self, Vec<JoinHandle<Map>>) {
        let mut handles = HashMap::new();
        let mut tasks = Vec::with_capacity(maps.len());

        for map in maps {
            let (handle, task) = MapActor::spawn(map, inbox_capacity);
            handles.insert(handle.map_id(), handle);
            tasks.push(task);
        }

        info!("World started with {} maps", handles.len());
        (
            World {
                maps: Arc::new(handles),
            },
            tasks,
        )
    }

    /// Loads every map under `data_dir` and starts them. Maps with an
    /// unusable tile grid still start, with an open grid.
    pub fn load(
        data_dir: &Path,
        inbox_capacity: usize,
    ) -> Result<(Self, Vec<JoinHandle<Map>>), LoadError> {
        let loaded = loader::load_directory(data_dir)?;
        let mut maps = Vec::with_capacity(loaded.len());
        for entry in loaded {
            if let Some(e) = entry.tile_error {
                warn!("Map {} starts without collision data: {}", entry.map.id, e);
            }
            maps.push(entry.map);
        }
        Ok(World::spawn(maps, inbox_capacity))
    }

    pub fn map(&self, id: u16) -> Option<&MapHandle> {
        self.maps.get(&id)
    }

    pub fn map_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.maps.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Finishes a warp: `entity` has already left `origin` and is inserted
    /// at the warp's destination. If the destination refuses it, it goes
    /// back where it came from. Returns the id of the map it ended up on.
    pub async fn transfer(
        &self,
        entity: Entity,
        warp: Warp,
        origin: &MapHandle,
    ) -> Result<u16, RequestError> {
        let entity = match self.map(warp.target_map) {
            Some(destination) => {
                match destination.insert(entity, warp.target, true).await {
                    Ok(()) => return Ok(warp.target_map),
                    Err(RequestError::Rejected(rejected)) => {
                        warn!(
                            "Map {} refused {} from map {}: {}",
                            warp.target_map,
                            rejected.entity.name,
                            origin.map_id(),
                            rejected.reason
                        );
                        *rejected.entity
                    }
                    Err(e) => return Err(e),
                }
            }
            None => {
                warn!(
                    "Warp from map {} leads to unknown map {}",
                    origin.map_id(),
                    warp.target_map
                );
                entity
            }
        };

        let back = entity.position;
        origin.insert(entity, back, true).await?;
        Ok(origin.map_id())
    }

    pub async fn shutdown(&self) {
        for handle in self.maps.values() {
            // An actor that already stopped has nothing left to shut down
            let _ = handle.shutdown().await;
        }
    }
}

//! Map loading from a data directory.
//!
//! A world directory looks like this:
//!
//! ```text
//! data/
//!   collisions.dat      one collision byte per foreground sprite
//!   doors.yaml          door sprites: [{ sprite, collision }]
//!   maps/*.yaml         one definition per map
//!   mapfiles/lod{id}.map
//! ```
//!
//! A broken definition fails the load. A missing or truncated tile grid only
//! degrades the map to an all-open grid and is reported next to it.

use crate::entity::{DoorState, Entity};
use crate::geometry::Point;
use crate::map::{Map, Warp};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CELL_LEN: usize = 6;
const BLOCKING: u8 = 0x0F;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid map definition {path}: {source}")]
    Definition {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid door table {path}: {source}")]
    DoorTable {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("tile grid {path} is missing")]
    TileGridMissing { path: PathBuf },

    #[error("tile grid has {actual} bytes, expected {expected}")]
    TileGridSize { expected: usize, actual: usize },

    #[error("map {id} is defined twice")]
    DuplicateMap { id: u16 },
}

/// Collision and door lookups by foreground sprite id.
#[derive(Debug, Clone, Default)]
pub struct SpriteTables {
    /// Indexed by `sprite - 1`.
    pub collisions: Vec<u8>,
    pub doors: HashMap<u16, DoorSprite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorSprite {
    pub update_collision: bool,
}

#[derive(Debug, Deserialize)]
struct DoorSpriteEntry {
    sprite: u16,
    #[serde(default)]
    collision: bool,
}

impl SpriteTables {
    /// Reads `collisions.dat` and `doors.yaml` from `dir`. Either file may be
    /// absent, which leaves that table empty.
    pub fn load(dir: &Path) -> Result<Self, LoadError> {
        let collisions_path = dir.join("collisions.dat");
        let collisions = match fs::read(&collisions_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(LoadError::Io {
                    path: collisions_path,
                    source,
                })
            }
        };

        let doors_path = dir.join("doors.yaml");
        let doors = match fs::read_to_string(&doors_path) {
            Ok(text) => {
                let entries: Vec<DoorSpriteEntry> =
                    serde_yaml::from_str(&text).map_err(|source| LoadError::DoorTable {
                        path: doors_path.clone(),
                        source,
                    })?;
                entries
                    .into_iter()
                    .map(|e| {
                        (
                            e.sprite,
                            DoorSprite {
                                update_collision: e.collision,
                            },
                        )
                    })
                    .collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => {
                return Err(LoadError::Io {
                    path: doors_path,
                    source,
                })
            }
        };

        debug!(
            "Loaded {} collision entries and {} door sprites",
            collisions.len(),
            doors.len()
        );
        Ok(SpriteTables { collisions, doors })
    }

    /// Sprite 0 is "nothing" and never blocks; ids past the table are open.
    pub fn is_blocking(&self, sprite: u16) -> bool {
        if sprite == 0 {
            return false;
        }
        self.collisions
            .get(usize::from(sprite) - 1)
            .is_some_and(|c| c & BLOCKING == BLOCKING)
    }

    pub fn door(&self, sprite: u16) -> Option<&DoorSprite> {
        self.doors.get(&sprite)
    }
}

fn default_max_level() -> u8 {
    u8::MAX
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WarpDefinition {
    pub x: u8,
    pub y: u8,
    pub target_x: u8,
    pub target_y: u8,
    pub target_map: u16,
    #[serde(default)]
    pub min_ab: u8,
    #[serde(default)]
    pub min_lev: u8,
    #[serde(default = "default_max_level")]
    pub max_lev: u8,
    #[serde(default)]
    pub mob_use: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MapDefinition {
    pub id: u16,
    pub size: String,
    pub name: String,
    #[serde(default)]
    pub music: u8,
    pub width: u8,
    pub height: u8,
    #[serde(default)]
    pub warps: Vec<WarpDefinition>,
}

impl MapDefinition {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// An empty map with this definition's identity and warps.
    pub fn build(&self) -> Map {
        let mut map = Map::new(self.id, self.name.clone(), self.width, self.height);
        map.size = self.size.clone();
        map.music = self.music;

        for warp in &self.warps {
            map.add_warp(Warp {
                source: Point::new(warp.x, warp.y),
                target_map: warp.target_map,
                target: Point::new(warp.target_x, warp.target_y),
                min_level: warp.min_lev,
                max_level: warp.max_lev,
                min_ability: warp.min_ab,
                mobs_can_use: warp.mob_use,
            });
        }
        map
    }

    pub fn tile_file_name(&self) -> String {
        format!("lod{}.map", self.id)
    }
}

/// CRC-16/XMODEM of the raw tile bytes.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let mut crc = crc ^ (u16::from(byte) << 8);
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
        crc
    })
}

fn read_u16(cell: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([cell[offset], cell[offset + 1]])
}

/// Applies a row-major grid of (background, left, right) sprite triples to
/// `map`: sets wall flags and registers a door for every door sprite.
/// Returns the number of doors placed.
pub fn apply_tile_grid(map: &mut Map, data: &[u8], tables: &SpriteTables) -> Result<usize, LoadError> {
    let (width, height) = (map.width(), map.height());
    let expected = usize::from(width) * usize::from(height) * CELL_LEN;
    if data.len() < expected {
        return Err(LoadError::TileGridSize {
            expected,
            actual: data.len(),
        });
    }

    let mut cells = data.chunks_exact(CELL_LEN);
    let mut doors = 0;
    for y in 0..height {
        for x in 0..width {
            let Some(cell) = cells.next() else {
                return Ok(doors);
            };
            let point = Point::new(x, y);
            let left = read_u16(cell, 2);
            let right = read_u16(cell, 4);

            let wall = tables.is_blocking(left) || tables.is_blocking(right);
            map.set_wall(point, wall);

            let door = match (tables.door(left), tables.door(right)) {
                (Some(sprite), _) => Some((true, sprite)),
                (None, Some(sprite)) => Some((false, sprite)),
                (None, None) => None,
            };
            if let Some((left_right, sprite)) = door {
                let state = DoorState {
                    closed: wall,
                    left_right,
                    update_collision: sprite.update_collision,
                };
                match map.insert(Entity::door(state), point, false) {
                    Ok(_) => doors += 1,
                    Err(rejected) => warn!("Door at ({}, {}) not placed: {}", x, y, rejected),
                }
            }
        }
    }
    Ok(doors)
}

/// A loaded map, plus the tile grid problem it was degraded by, if any.
#[derive(Debug)]
pub struct LoadedMap {
    pub map: Map,
    pub tile_error: Option<LoadError>,
}

/// Loads one map from its definition file, reading the tile grid from
/// `mapfiles_dir`.
pub fn load_map(
    definition_path: &Path,
    mapfiles_dir: &Path,
    tables: &SpriteTables,
) -> Result<LoadedMap, LoadError> {
    let text = fs::read_to_string(definition_path).map_err(|source| LoadError::Io {
        path: definition_path.to_path_buf(),
        source,
    })?;
    let definition = MapDefinition::from_yaml(&text).map_err(|source| LoadError::Definition {
        path: definition_path.to_path_buf(),
        source,
    })?;

    let mut map = definition.build();
    let tile_path = mapfiles_dir.join(definition.tile_file_name());
    let tile_error = match fs::read(&tile_path) {
        Ok(data) => match apply_tile_grid(&mut map, &data, tables) {
            Ok(doors) => {
                map.set_checksum(crc16(&data));
                info!(
                    "Loaded map {} ({}) {}x{} with {} doors, {} warps",
                    map.id,
                    map.name,
                    map.width(),
                    map.height(),
                    doors,
                    definition.warps.len()
                );
                None
            }
            Err(e) => Some(e),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Some(LoadError::TileGridMissing { path: tile_path })
        }
        Err(source) => Some(LoadError::Io {
            path: tile_path,
            source,
        }),
    };

    if let Some(e) = &tile_error {
        warn!("Map {} ({}) has no usable tile grid: {}", map.id, map.name, e);
    }

    Ok(LoadedMap { map, tile_error })
}

/// Loads every `maps/*.yaml` definition under `data_dir`, in file name order.
pub fn load_directory(data_dir: &Path) -> Result<Vec<LoadedMap>, LoadError> {
    let tables = SpriteTables::load(data_dir)?;
    let maps_dir = data_dir.join("maps");
    let mapfiles_dir = data_dir.join("mapfiles");

    let entries = fs::read_dir(&maps_dir).map_err(|source| LoadError::Io {
        path: maps_dir.clone(),
        source,
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| LoadError::Io {
            path: maps_dir.clone(),
            source,
        })?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "yaml" || ext == "yml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut loaded: Vec<LoadedMap> = Vec::with_capacity(paths.len());
    for path in paths {
        let map = load_map(&path, &mapfiles_dir, &tables)?;
        if loaded.iter().any(|l| l.map.id == map.map.id) {
            return Err(LoadError::DuplicateMap { id: map.map.id });
        }
        loaded.push(map);
    }
    Ok(loaded)
}

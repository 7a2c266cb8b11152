//! Configuration for navigation meshes and queries

use crate::status::Status;

/// Largest bit width a single handle may occupy
pub const HANDLE_BITS_TOTAL: u32 = 64;

/// Errors raised while validating configuration values
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("origin must be finite, got {0:?}")]
    NonFiniteOrigin([f32; 3]),

    #[error("tile size must be positive and finite, got {width} x {height}")]
    InvalidTileSize { width: f32, height: f32 },

    #[error("max_tiles must be at least 1")]
    NoTiles,

    #[error("max_polys_per_tile must be at least 1")]
    NoPolys,

    #[error("handle bit widths {salt}/{tile}/{poly} exceed 64 bits")]
    HandleTooWide { salt: u32, tile: u32, poly: u32 },

    #[error("handle needs at least one bit for each of salt, tile and poly")]
    HandleFieldEmpty,

    #[error("{count} tiles do not fit in {bits} tile bits")]
    TooManyTiles { count: u32, bits: u32 },

    #[error("{count} polygons per tile do not fit in {bits} poly bits")]
    TooManyPolys { count: u32, bits: u32 },

    #[error("max_nodes must be between 1 and {max}, got {got}")]
    InvalidNodeCount { got: usize, max: usize },

    #[error("heuristic scale must be in (0, 1], got {0}")]
    InvalidHeuristicScale(f32),
}

impl From<ConfigError> for Status {
    fn from(err: ConfigError) -> Self {
        log::warn!("rejected configuration: {err}");
        Status::FAILURE | Status::INVALID_PARAM
    }
}

/// Bit widths of the packed polygon handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct HandleBits {
    /// Bits used for the generation salt
    pub salt: u32,
    /// Bits used for the tile index
    pub tile: u32,
    /// Bits used for the polygon index
    pub poly: u32,
}

impl Default for HandleBits {
    fn default() -> Self {
        Self {
            salt: 12,
            tile: 21,
            poly: 31,
        }
    }
}

impl HandleBits {
    /// Checks that the widths fit in one handle
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.salt == 0 || self.tile == 0 || self.poly == 0 {
            return Err(ConfigError::HandleFieldEmpty);
        }
        if self.salt + self.tile + self.poly > HANDLE_BITS_TOTAL {
            return Err(ConfigError::HandleTooWide {
                salt: self.salt,
                tile: self.tile,
                poly: self.poly,
            });
        }
        Ok(())
    }
}

/// Parameters used to initialize a navigation mesh
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct NavMeshParams {
    /// World-space origin of the tile grid
    pub origin: [f32; 3],
    /// Width of each tile along the x-axis
    pub tile_width: f32,
    /// Height of each tile along the z-axis
    pub tile_height: f32,
    /// Maximum number of tiles the mesh can hold
    pub max_tiles: u32,
    /// Maximum number of polygons per tile
    pub max_polys_per_tile: u32,
    /// Handle layout
    #[cfg_attr(feature = "serialization", serde(default))]
    pub handle_bits: HandleBits,
}

impl Default for NavMeshParams {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            tile_width: 32.0,
            tile_height: 32.0,
            max_tiles: 128,
            max_polys_per_tile: 1024,
            handle_bits: HandleBits::default(),
        }
    }
}

impl NavMeshParams {
    /// Validates the parameters against the handle layout
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.origin.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::NonFiniteOrigin(self.origin));
        }
        let size_ok = |v: f32| v.is_finite() && v > 0.0;
        if !size_ok(self.tile_width) || !size_ok(self.tile_height) {
            return Err(ConfigError::InvalidTileSize {
                width: self.tile_width,
                height: self.tile_height,
            });
        }
        if self.max_tiles == 0 {
            return Err(ConfigError::NoTiles);
        }
        if self.max_polys_per_tile == 0 {
            return Err(ConfigError::NoPolys);
        }

        self.handle_bits.validate()?;

        if u64::from(self.max_tiles) > (1u64 << self.handle_bits.tile) {
            return Err(ConfigError::TooManyTiles {
                count: self.max_tiles,
                bits: self.handle_bits.tile,
            });
        }
        if u64::from(self.max_polys_per_tile) > (1u64 << self.handle_bits.poly) {
            return Err(ConfigError::TooManyPolys {
                count: self.max_polys_per_tile,
                bits: self.handle_bits.poly,
            });
        }
        Ok(())
    }
}

/// Upper bound on the main node pool size
pub const MAX_QUERY_NODES: usize = 65535;

/// Tuning for a [`crate::NavMeshQuery`]
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct QueryConfig {
    /// Capacity of the main node pool used by A* and Dijkstra searches
    pub max_nodes: usize,
    /// Capacity of the small pool used by local searches
    pub tiny_nodes: usize,
    /// Scale applied to the straight-line heuristic
    pub heuristic_scale: f32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_nodes: 2048,
            tiny_nodes: 64,
            heuristic_scale: 0.999,
        }
    }
}

impl QueryConfig {
    /// Creates a config with the given node pool capacity
    pub fn with_max_nodes(max_nodes: usize) -> Self {
        Self {
            max_nodes,
            ..Self::default()
        }
    }

    /// Validates node counts and heuristic scale
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for count in [self.max_nodes, self.tiny_nodes] {
            if count == 0 || count > MAX_QUERY_NODES {
                return Err(ConfigError::InvalidNodeCount {
                    got: count,
                    max: MAX_QUERY_NODES,
                });
            }
        }
        if !(self.heuristic_scale > 0.0 && self.heuristic_scale <= 1.0) {
            return Err(ConfigError::InvalidHeuristicScale(self.heuristic_scale));
        }
        Ok(())
    }
}

//! Tiled navigation mesh storage and pathfinding queries
//!
//! A [`NavMesh`] owns a grid of tiles. Tiles can be added and removed at run
//! time; polygons are addressed with salted [`PolyRef`] handles that go stale
//! when their tile is removed. A [`NavMeshQuery`] borrows the mesh and runs
//! A*, Dijkstra flood fills, raycasts, funnel string pulling and local
//! surface walks over it.

use bitflags::bitflags;

mod bv_tree;
mod config;
mod geometry;
mod handle;
mod local_search;
mod nav_mesh;
mod nav_mesh_query;
mod node_pool;
mod poly_query;
mod query_filter;
mod raycast;
mod sliced_pathfinding;
mod status;
mod straight_path;
mod tile_data;

#[cfg(test)]
mod test_mesh_helpers;

#[cfg(test)]
mod multi_tile_tests;

pub use bv_tree::{build_bv_tree, query_bv_tree, quantize_query_box};
pub use config::{ConfigError, HandleBits, NavMeshParams, QueryConfig, MAX_QUERY_NODES};
pub use geometry::{
    closest_height_point_triangle, closest_pt_point_triangle, dist_pt_seg_sqr_2d, intersect_segment_poly_2d,
    point_in_polygon, random_point_in_convex_poly, SegmentPolyHit,
};
pub use handle::{HandleCodec, PolyRef};
pub use local_search::{LocalNeighbour, MoveAlongSurface, WallSegment};
pub use nav_mesh::{Link, LiveTile, MeshTile, NavMesh, PolyState, TileState};
pub use nav_mesh_query::{CircleSearch, NavMeshQuery, NearestPoly, WallHit};
pub use node_pool::{Node, NodeFlags, NodeIndex, NodePool, NodeQueue, NULL_NODE};
pub use poly_query::{CollectPolys, FindNearestPolyQuery, PolyQuery};
pub use query_filter::{DefaultQueryFilter, PolyInfo, QueryFilter};
pub use raycast::{RaycastHit, RaycastOptions};
pub use sliced_pathfinding::FindPathOptions;
pub use status::{Result, Status};
pub use straight_path::{StraightPathFlags, StraightPathOptions, StraightPathPoint};
pub use tile_data::{
    BvNode, OffMeshConnection, PayloadError, Poly, PolyDetail, TileData, TileHeader, OFFMESH_CON_BIDIR,
};

/// Maximum number of vertices per polygon
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Number of area ids a filter can price
pub const MAX_AREAS: usize = 64;

/// Neighbour flag marking a portal edge to another tile; the low bits hold the side
pub const EXT_LINK: u16 = 0x8000;

/// Terminator of link chains
pub const NULL_LINK: u32 = u32::MAX;

/// Side value of links that stay inside their tile
pub const LINK_SIDE_INTERNAL: u8 = 0xff;

/// Tile payload magic ('D' 'N' 'A' 'V')
pub const NAVMESH_MAGIC: u32 = (b'D' as u32) << 24 | (b'N' as u32) << 16 | (b'A' as u32) << 8 | b'V' as u32;

/// Tile payload version
pub const NAVMESH_VERSION: u32 = 7;

bitflags! {
    /// Polygon flags used by query filters
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct PolyFlags: u16 {
        /// Ability to walk (ground, grass, road)
        const WALK = 0x01;
        /// Ability to swim (water)
        const SWIM = 0x02;
        /// Ability to move through doors
        const DOOR = 0x04;
        /// Ability to jump
        const JUMP = 0x08;
        /// Disabled polygon
        const DISABLED = 0x10;
        /// All abilities
        const ALL = 0xffff;
    }
}

bitflags! {
    /// Ownership flags for tiles added to a mesh
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TileFlags: u8 {
        /// The mesh drops the payload on removal instead of returning it
        const FREE_DATA = 0x01;
    }
}

/// Polygon type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum PolyType {
    /// Regular ground polygon
    #[default]
    Ground,
    /// Two-vertex polygon standing for an off-mesh connection
    OffMeshConnection,
}

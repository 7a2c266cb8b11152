//! Tile payloads handed to [`crate::NavMesh::add_tile`]
//!
//! A payload is produced by an external builder. The mesh takes ownership of
//! it, builds the link graph on top, and hands it back on removal unless the
//! tile was added with [`crate::TileFlags::FREE_DATA`].

use crate::status::{Result, Status};
use crate::{
    PolyFlags, PolyType, EXT_LINK, LINK_SIDE_INTERNAL, MAX_AREAS, MAX_VERTS_PER_POLY, NAVMESH_MAGIC,
    NAVMESH_VERSION,
};

/// Off-mesh connection may be traversed in both directions
pub const OFFMESH_CON_BIDIR: u8 = 1;

/// Structural defects found in a tile payload
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("polygon {poly} has {count} vertices")]
    VertexCount { poly: usize, count: usize },

    #[error("polygon {poly} uses vertex {vert}, tile has {len}")]
    VertexIndex { poly: usize, vert: u16, len: usize },

    #[error("polygon {poly} has neighbour code {nei:#x} on edge {edge}")]
    Neighbour { poly: usize, edge: usize, nei: u16 },

    #[error("polygon {poly} has area {area}")]
    Area { poly: usize, area: u8 },

    #[error("{details} detail meshes for {polys} polygons")]
    DetailCount { details: usize, polys: usize },

    #[error("detail mesh of polygon {poly} is out of range")]
    DetailRange { poly: usize },

    #[error("detail triangle of polygon {poly} uses vertex {vert}")]
    DetailTriangle { poly: usize, vert: u8 },

    #[error("BV node {node} has index {index}")]
    BvNode { node: usize, index: i32 },

    #[error("off-mesh base {base} is past {polys} polygons")]
    OffMeshBase { base: usize, polys: usize },

    #[error("off-mesh connection {con} points at polygon {poly}")]
    OffMeshPoly { con: usize, poly: u16 },

    #[error("off-mesh connection {con} has side {side}")]
    OffMeshSide { con: usize, side: u8 },
}

impl From<PayloadError> for Status {
    fn from(err: PayloadError) -> Self {
        log::warn!("rejected tile payload: {err}");
        Status::FAILURE | Status::INVALID_PARAM
    }
}

/// Tile header
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileHeader {
    pub magic: u32,
    pub version: u32,
    /// Tile grid location
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    /// User defined id
    pub user_id: u32,
    /// Link capacity reserved for this tile
    pub max_link_count: usize,
    /// Index of the first off-mesh connection polygon
    pub off_mesh_base: usize,
    /// Agent height used when the tile was built
    pub walkable_height: f32,
    /// Agent radius used when the tile was built
    pub walkable_radius: f32,
    /// Agent climb used when the tile was built
    pub walkable_climb: f32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    /// Factor converting world units to BV tree coordinates
    pub bv_quant_factor: f32,
}

impl TileHeader {
    /// Header for the tile at (x, y, layer) with the current magic and version
    pub fn new(x: i32, y: i32, layer: i32) -> Self {
        Self {
            magic: NAVMESH_MAGIC,
            version: NAVMESH_VERSION,
            x,
            y,
            layer,
            user_id: 0,
            max_link_count: 0,
            off_mesh_base: 0,
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            bmin: [0.0; 3],
            bmax: [0.0; 3],
            bv_quant_factor: 1.0,
        }
    }
}

/// Polygon of a tile
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Poly {
    /// Head of this polygon's link chain, or [`crate::NULL_LINK`]
    pub first_link: u32,
    /// Indices into the tile vertex array
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Per-edge neighbour: 0 border, `idx + 1` internal, `EXT_LINK | side` portal
    pub neis: [u16; MAX_VERTS_PER_POLY],
    pub flags: PolyFlags,
    pub vert_count: u8,
    /// Area id, 0..64
    pub area: u8,
    pub poly_type: PolyType,
}

impl Poly {
    /// Creates a ground polygon from vertex indices
    pub fn new(verts: &[u16], flags: PolyFlags, area: u8) -> Self {
        debug_assert!(verts.len() <= MAX_VERTS_PER_POLY);
        let mut poly = Self {
            first_link: crate::NULL_LINK,
            verts: [0; MAX_VERTS_PER_POLY],
            neis: [0; MAX_VERTS_PER_POLY],
            flags,
            vert_count: verts.len() as u8,
            area,
            poly_type: PolyType::Ground,
        };
        poly.verts[..verts.len()].copy_from_slice(verts);
        poly
    }

    #[inline]
    pub fn is_off_mesh_connection(&self) -> bool {
        self.poly_type == PolyType::OffMeshConnection
    }

    #[inline]
    pub fn vert_count(&self) -> usize {
        self.vert_count as usize
    }
}

/// Detail sub-mesh of a polygon
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyDetail {
    /// First vertex in `detail_verts`
    pub vert_base: u32,
    /// First triangle in `detail_tris`
    pub tri_base: u32,
    pub vert_count: u8,
    pub tri_count: u8,
}

/// Node of the flattened bounding volume tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct BvNode {
    /// Quantized bounds
    pub bmin: [u16; 3],
    pub bmax: [u16; 3],
    /// Leaf: polygon index (`>= 0`). Internal: negated escape offset.
    pub i: i32,
}

/// Off-mesh connection between two points
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OffMeshConnection {
    /// Endpoints \[ax, ay, az, bx, by, bz\]
    pub pos: [f32; 6],
    /// Snap radius of the endpoints
    pub radius: f32,
    /// Polygon index within the tile
    pub poly: u16,
    /// [`OFFMESH_CON_BIDIR`] when traversable both ways
    pub flags: u8,
    /// Tile side the end point lies on, `0xff` when inside the tile
    pub side: u8,
    pub user_id: u32,
}

impl OffMeshConnection {
    pub fn start_pos(&self) -> [f32; 3] {
        [self.pos[0], self.pos[1], self.pos[2]]
    }

    pub fn end_pos(&self) -> [f32; 3] {
        [self.pos[3], self.pos[4], self.pos[5]]
    }

    pub fn is_bidirectional(&self) -> bool {
        self.flags & OFFMESH_CON_BIDIR != 0
    }
}

/// Immutable geometry of one tile
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileData {
    pub header: TileHeader,
    pub polys: Vec<Poly>,
    pub verts: Vec<[f32; 3]>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<[f32; 3]>,
    /// Detail triangles: three vertex indices plus edge flags
    pub detail_tris: Vec<[u8; 4]>,
    /// Empty when the tile has no BV tree
    pub bv_tree: Vec<BvNode>,
    pub off_mesh_cons: Vec<OffMeshConnection>,
}

impl TileData {
    /// Checks magic, version and that every index stays inside the payload
    pub fn validate(&self) -> Result<()> {
        if self.header.magic != NAVMESH_MAGIC {
            log::warn!("rejected tile payload with magic {:#x}", self.header.magic);
            return Err(Status::FAILURE | Status::WRONG_MAGIC);
        }
        if self.header.version != NAVMESH_VERSION {
            log::warn!(
                "rejected tile payload with version {}",
                self.header.version
            );
            return Err(Status::FAILURE | Status::WRONG_VERSION);
        }
        self.check_bounds()?;
        Ok(())
    }

    /// Checks every vertex, neighbour, detail, BV and off-mesh index of the payload
    pub fn check_bounds(&self) -> std::result::Result<(), PayloadError> {
        let npolys = self.polys.len();
        let nverts = self.verts.len();

        for (i, poly) in self.polys.iter().enumerate() {
            let nv = poly.vert_count();
            let counts = if poly.is_off_mesh_connection() {
                2..=2
            } else {
                3..=MAX_VERTS_PER_POLY
            };
            if !counts.contains(&nv) {
                return Err(PayloadError::VertexCount { poly: i, count: nv });
            }
            if let Some(&vert) = poly.verts[..nv].iter().find(|&&v| v as usize >= nverts) {
                return Err(PayloadError::VertexIndex { poly: i, vert, len: nverts });
            }
            for (edge, &nei) in poly.neis[..nv].iter().enumerate() {
                let ok = if nei & EXT_LINK != 0 {
                    nei & !EXT_LINK < 8
                } else {
                    nei as usize <= npolys
                };
                if !ok {
                    return Err(PayloadError::Neighbour { poly: i, edge, nei });
                }
            }
            if poly.area as usize >= MAX_AREAS {
                return Err(PayloadError::Area { poly: i, area: poly.area });
            }
        }

        if self.detail_meshes.len() > npolys {
            return Err(PayloadError::DetailCount {
                details: self.detail_meshes.len(),
                polys: npolys,
            });
        }
        for (i, (poly, detail)) in self.polys.iter().zip(&self.detail_meshes).enumerate() {
            let verts_end = detail.vert_base as usize + detail.vert_count as usize;
            let tris_start = detail.tri_base as usize;
            let tris_end = tris_start + detail.tri_count as usize;
            if verts_end > self.detail_verts.len() || tris_end > self.detail_tris.len() {
                return Err(PayloadError::DetailRange { poly: i });
            }
            let limit = poly.vert_count() + detail.vert_count as usize;
            for tri in &self.detail_tris[tris_start..tris_end] {
                if let Some(&vert) = tri[..3].iter().find(|&&k| k as usize >= limit) {
                    return Err(PayloadError::DetailTriangle { poly: i, vert });
                }
            }
        }

        let nodes = self.bv_tree.len();
        for (k, node) in self.bv_tree.iter().enumerate() {
            let ok = if node.i >= 0 {
                (node.i as usize) < npolys
            } else {
                (1..=nodes - k).contains(&(node.i.unsigned_abs() as usize))
            };
            if !ok {
                return Err(PayloadError::BvNode { node: k, index: node.i });
            }
        }

        let base = self.header.off_mesh_base;
        if base > npolys {
            return Err(PayloadError::OffMeshBase { base, polys: npolys });
        }
        for (k, con) in self.off_mesh_cons.iter().enumerate() {
            let index = con.poly as usize;
            let attached = index == base + k && self.polys.get(index).is_some_and(Poly::is_off_mesh_connection);
            if !attached {
                return Err(PayloadError::OffMeshPoly { con: k, poly: con.poly });
            }
            if con.side != LINK_SIDE_INTERNAL && con.side >= 8 {
                return Err(PayloadError::OffMeshSide { con: k, side: con.side });
            }
        }
        Ok(())
    }

    /// World positions of the polygon vertices. Only the first
    /// `poly.vert_count()` entries are meaningful.
    pub fn poly_verts(&self, poly: &Poly) -> [[f32; 3]; MAX_VERTS_PER_POLY] {
        let mut out = [[0.0; 3]; MAX_VERTS_PER_POLY];
        for (dst, &vi) in out.iter_mut().zip(&poly.verts[..poly.vert_count()]) {
            *dst = self.verts[vi as usize];
        }
        out
    }

    /// Vertex `index` of a detail triangle belonging to `poly`
    #[inline]
    pub fn detail_vert(&self, poly: &Poly, detail: &PolyDetail, index: u8) -> [f32; 3] {
        if index < poly.vert_count {
            self.verts[poly.verts[index as usize] as usize]
        } else {
            let k = detail.vert_base as usize + (index - poly.vert_count) as usize;
            self.detail_verts[k]
        }
    }

    /// Off-mesh connection attached to the polygon at `poly_index`
    pub fn off_mesh_con_for_poly(&self, poly_index: usize) -> Option<&OffMeshConnection> {
        let k = poly_index.checked_sub(self.header.off_mesh_base)?;
        self.off_mesh_cons.get(k)
    }

    /// Number of links this tile needs: explicit capacity or a bound from polygon edges
    pub(crate) fn link_capacity(&self) -> usize {
        let edges: usize = self.polys.iter().map(|p| p.vert_count()).sum();
        // Each edge can hold several portal links, off-mesh connections add up to four
        let bound = edges * 4 + self.off_mesh_cons.len() * 4;
        self.header.max_link_count.max(bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle_tile() -> TileData {
        TileData {
            header: TileHeader::new(0, 0, 0),
            polys: vec![Poly::new(&[0, 1, 2], PolyFlags::WALK, 0)],
            verts: vec![[0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]],
            detail_meshes: vec![PolyDetail {
                vert_base: 0,
                tri_base: 0,
                vert_count: 1,
                tri_count: 1,
            }],
            detail_verts: vec![[0.2, 0.5, 0.2]],
            detail_tris: vec![[0, 1, 3, 0]],
            bv_tree: Vec::new(),
            off_mesh_cons: Vec::new(),
        }
    }

    #[test]
    fn test_validate_magic_and_version() {
        let mut tile = triangle_tile();
        assert!(tile.validate().is_ok());

        tile.header.version += 1;
        let err = tile.validate().unwrap_err();
        assert!(err.is_failure() && err.has_detail(Status::WRONG_VERSION));

        tile.header.magic = 0;
        let err = tile.validate().unwrap_err();
        assert!(err.has_detail(Status::WRONG_MAGIC));
    }

    #[test]
    fn test_bounds_checked_before_use() {
        let mut tile = triangle_tile();
        tile.polys[0].verts[2] = 999;
        assert_eq!(
            tile.check_bounds(),
            Err(PayloadError::VertexIndex { poly: 0, vert: 999, len: 3 })
        );
        let err = tile.validate().unwrap_err();
        assert!(err.is_failure() && err.has_detail(Status::INVALID_PARAM));

        let mut tile = triangle_tile();
        tile.polys[0].neis[1] = 2;
        assert_eq!(
            tile.check_bounds(),
            Err(PayloadError::Neighbour { poly: 0, edge: 1, nei: 2 })
        );
        tile.polys[0].neis[1] = crate::EXT_LINK | 8;
        assert!(tile.check_bounds().is_err());
        tile.polys[0].neis[1] = crate::EXT_LINK | 6;
        assert!(tile.check_bounds().is_ok());

        let mut tile = triangle_tile();
        tile.detail_tris[0][2] = 4;
        assert_eq!(
            tile.check_bounds(),
            Err(PayloadError::DetailTriangle { poly: 0, vert: 4 })
        );

        let mut tile = triangle_tile();
        tile.bv_tree.push(BvNode {
            bmin: [0; 3],
            bmax: [1; 3],
            i: 1,
        });
        assert_eq!(tile.check_bounds(), Err(PayloadError::BvNode { node: 0, index: 1 }));
        tile.bv_tree[0].i = 0;
        assert!(tile.check_bounds().is_ok());
        tile.bv_tree[0].i = -2;
        assert!(tile.check_bounds().is_err());

        let mut tile = triangle_tile();
        tile.header.off_mesh_base = 1;
        tile.off_mesh_cons.push(OffMeshConnection {
            pos: [0.0; 6],
            radius: 0.5,
            poly: 0,
            flags: 0,
            side: 0xff,
            user_id: 0,
        });
        assert_eq!(
            tile.check_bounds(),
            Err(PayloadError::OffMeshPoly { con: 0, poly: 0 })
        );
    }

    #[test]
    fn test_poly_and_detail_verts() {
        let tile = triangle_tile();
        let poly = &tile.polys[0];
        let verts = tile.poly_verts(poly);
        assert_eq!(verts[1], [0.0, 0.0, 1.0]);

        let detail = &tile.detail_meshes[0];
        assert_eq!(tile.detail_vert(poly, detail, 2), [1.0, 0.0, 0.0]);
        assert_eq!(tile.detail_vert(poly, detail, 3), [0.2, 0.5, 0.2]);
    }

    #[test]
    fn test_off_mesh_con_lookup() {
        let mut tile = triangle_tile();
        tile.header.off_mesh_base = 1;
        tile.off_mesh_cons.push(OffMeshConnection {
            pos: [0.0, 0.0, 0.0, 1.0, 0.0, 1.0],
            radius: 0.5,
            poly: 1,
            flags: OFFMESH_CON_BIDIR,
            side: 0xff,
            user_id: 7,
        });
        assert!(tile.off_mesh_con_for_poly(0).is_none());
        let con = tile.off_mesh_con_for_poly(1).unwrap();
        assert!(con.is_bidirectional());
        assert_eq!(con.end_pos(), [1.0, 0.0, 1.0]);
    }
}

//! Tile registry and polygon link graph
//!
//! The mesh owns a fixed array of tile slots. Free slots are threaded on a
//! free list, occupied slots are chained in a spatial hash keyed on the tile
//! grid cell. Every tile carries its own link arena; links are stitched when a
//! tile is added and unstitched from its neighbours when it is removed.

use std::ops::Deref;

use crate::bv_tree::{quantize_query_box, query_bv_tree};
use crate::config::NavMeshParams;
use crate::geometry::{
    closest_height_point_triangle, dist_pt_seg_sqr_2d, next_pow2, opposite_tile, overlap_bounds,
    point_in_polygon, sqr, vadd, vlen_sqr, vlerp, vsub,
};
use crate::handle::{HandleCodec, PolyRef};
use crate::status::{ensure_param, Result, Status};
use crate::tile_data::{OffMeshConnection, Poly, TileData, TileHeader};
use crate::{PolyFlags, TileFlags, EXT_LINK, LINK_SIDE_INTERNAL, MAX_AREAS, NULL_LINK};

/// Magic of stored tile state ('D' 'N' 'M' 'S')
const TILE_STATE_MAGIC: u32 = (b'D' as u32) << 24 | (b'N' as u32) << 16 | (b'M' as u32) << 8 | b'S' as u32;
const TILE_STATE_VERSION: u32 = 1;

/// Polygons examined when snapping off-mesh endpoints
const MAX_SNAP_CANDIDATES: usize = 128;

/// Connection from one polygon edge to another polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    /// Neighbour polygon
    pub reference: PolyRef,
    /// Next link of the same polygon, or [`NULL_LINK`]
    pub next: u32,
    /// Edge of the owning polygon the link crosses
    pub edge: u8,
    /// Tile side for portal links, [`LINK_SIDE_INTERNAL`] otherwise
    pub side: u8,
    /// Portal sub-range along the edge, 0..=255
    pub bmin: u8,
    pub bmax: u8,
}

impl Link {
    fn new(reference: PolyRef, edge: u8, side: u8) -> Self {
        Self {
            reference,
            next: NULL_LINK,
            edge,
            side,
            bmin: 0,
            bmax: 0,
        }
    }
}

/// Link storage of one tile with an index free list
#[derive(Debug, Clone)]
struct LinkArena {
    links: Vec<Link>,
    free: u32,
}

impl Default for LinkArena {
    fn default() -> Self {
        Self {
            links: Vec::new(),
            free: NULL_LINK,
        }
    }
}

impl LinkArena {
    fn with_capacity(capacity: usize) -> Self {
        let links = (0..capacity)
            .map(|i| Link {
                next: if i + 1 < capacity { (i + 1) as u32 } else { NULL_LINK },
                ..Link::new(PolyRef::NULL, 0, 0)
            })
            .collect();
        Self {
            links,
            free: if capacity > 0 { 0 } else { NULL_LINK },
        }
    }

    fn alloc(&mut self) -> Option<u32> {
        if self.free == NULL_LINK {
            return None;
        }
        let idx = self.free;
        self.free = self.links[idx as usize].next;
        Some(idx)
    }

    fn release(&mut self, idx: u32) {
        self.links[idx as usize].next = self.free;
        self.free = idx;
    }

    /// Pushes `link` at the head of the polygon's chain. A full arena drops
    /// the link.
    fn prepend(&mut self, poly: &mut Poly, link: Link) {
        match self.alloc() {
            Some(idx) => {
                self.links[idx as usize] = Link {
                    next: poly.first_link,
                    ..link
                };
                poly.first_link = idx;
            }
            None => log::debug!("link arena full, dropping link to {}", link.reference),
        }
    }
}

/// Iterator over the link chain of one polygon
#[derive(Debug, Clone)]
pub struct LinkIter<'a> {
    links: &'a [Link],
    cur: u32,
}

impl<'a> Iterator for LinkIter<'a> {
    type Item = &'a Link;

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.links.get(self.cur as usize)?;
        self.cur = link.next;
        Some(link)
    }
}

/// One tile slot of the mesh
#[derive(Debug, Clone)]
pub struct MeshTile {
    salt: u32,
    data: Option<TileData>,
    links: LinkArena,
    flags: TileFlags,
    /// Free list or hash chain, depending on whether the slot is occupied
    next: Option<usize>,
}

impl MeshTile {
    fn empty(next: Option<usize>) -> Self {
        Self {
            salt: 1,
            data: None,
            links: LinkArena::default(),
            flags: TileFlags::empty(),
            next,
        }
    }

    /// Current generation of the slot
    pub fn salt(&self) -> u32 {
        self.salt
    }

    /// Payload of an occupied slot
    pub fn data(&self) -> Option<&TileData> {
        self.data.as_ref()
    }

    pub fn header(&self) -> Option<&TileHeader> {
        self.data.as_ref().map(|d| &d.header)
    }

    pub fn flags(&self) -> TileFlags {
        self.flags
    }

    /// Raw link storage, including unused entries
    pub fn links(&self) -> &[Link] {
        &self.links.links
    }

    /// Link chain of the polygon
    pub fn poly_links(&self, poly: &Poly) -> LinkIter<'_> {
        LinkIter {
            links: &self.links.links,
            cur: poly.first_link,
        }
    }
}

/// An occupied tile slot together with its payload
#[derive(Debug, Clone, Copy)]
pub struct LiveTile<'a> {
    /// Slot index
    pub index: usize,
    pub tile: &'a MeshTile,
    pub data: &'a TileData,
}

impl<'a> LiveTile<'a> {
    pub fn salt(&self) -> u32 {
        self.tile.salt
    }

    pub fn poly_links(&self, poly: &Poly) -> LinkIter<'a> {
        self.tile.poly_links(poly)
    }
}

impl Deref for LiveTile<'_> {
    type Target = TileData;

    fn deref(&self) -> &TileData {
        self.data
    }
}

/// Flags and area of one polygon, as stored by [`NavMesh::store_tile_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyState {
    pub flags: PolyFlags,
    pub area: u8,
}

/// Snapshot of the mutable polygon attributes of a tile
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileState {
    pub magic: u32,
    pub version: u32,
    /// Tile the state was taken from
    pub tile_ref: PolyRef,
    pub polys: Vec<PolyState>,
}

#[inline]
fn compute_tile_hash(x: i32, y: i32, mask: usize) -> usize {
    const H1: u32 = 0x8da6_b343;
    const H2: u32 = 0xd816_3841;
    let n = H1.wrapping_mul(x as u32).wrapping_add(H2.wrapping_mul(y as u32));
    n as usize & mask
}

/// Grid cell adjacent to (x, y) on `side`, `None` past the edge of the grid
fn neighbour_cell(x: i32, y: i32, side: u8) -> Option<(i32, i32)> {
    let (dx, dy) = match side {
        0 => (1, 0),
        1 => (1, 1),
        2 => (0, 1),
        3 => (-1, 1),
        4 => (-1, 0),
        5 => (-1, -1),
        6 => (0, -1),
        7 => (1, -1),
        _ => (0, 0),
    };
    Some((x.checked_add(dx)?, y.checked_add(dy)?))
}

#[inline]
fn slab_coord(v: &[f32; 3], side: u8) -> f32 {
    if side == 0 || side == 4 {
        v[0]
    } else if side == 2 || side == 6 {
        v[2]
    } else {
        0.0
    }
}

fn slab_end_points(va: &[f32; 3], vb: &[f32; 3], side: u8) -> ([f32; 2], [f32; 2]) {
    if side == 0 || side == 4 {
        if va[2] < vb[2] {
            ([va[2], va[1]], [vb[2], vb[1]])
        } else {
            ([vb[2], vb[1]], [va[2], va[1]])
        }
    } else if side == 2 || side == 6 {
        if va[0] < vb[0] {
            ([va[0], va[1]], [vb[0], vb[1]])
        } else {
            ([vb[0], vb[1]], [va[0], va[1]])
        }
    } else {
        ([0.0; 2], [0.0; 2])
    }
}

fn overlap_slabs(amin: &[f32; 2], amax: &[f32; 2], bmin: &[f32; 2], bmax: &[f32; 2], px: f32, py: f32) -> bool {
    // Shrink a little so slabs touching only at their end points do not connect
    let minx = (amin[0] + px).max(bmin[0] + px);
    let maxx = (amax[0] - px).min(bmax[0] - px);
    if minx > maxx {
        return false;
    }

    let ad = (amax[1] - amin[1]) / (amax[0] - amin[0]);
    let ak = amin[1] - ad * amin[0];
    let bd = (bmax[1] - bmin[1]) / (bmax[0] - bmin[0]);
    let bk = bmin[1] - bd * bmin[0];
    let aminy = ad * minx + ak;
    let amaxy = ad * maxx + ak;
    let bminy = bd * minx + bk;
    let bmaxy = bd * maxx + bk;
    let dmin = bminy - aminy;
    let dmax = bmaxy - amaxy;

    // Crossing segments always overlap
    if dmin * dmax < 0.0 {
        return true;
    }

    let thr = sqr(py * 2.0);
    dmin * dmin <= thr || dmax * dmax <= thr
}

impl TileData {
    /// Indices of the polygons whose bounds overlap the box, up to `max`
    pub(crate) fn polys_in_bounds(&self, qmin: &[f32; 3], qmax: &[f32; 3], max: usize) -> Vec<usize> {
        let mut found = Vec::new();
        if !self.bv_tree.is_empty() {
            let (bmin, bmax) = quantize_query_box(self, qmin, qmax);
            query_bv_tree(&self.bv_tree, &bmin, &bmax, |i| {
                if found.len() < max {
                    found.push(i);
                }
            });
            return found;
        }

        for (i, poly) in self.polys.iter().enumerate() {
            if poly.is_off_mesh_connection() {
                continue;
            }
            let verts = self.poly_verts(poly);
            let mut bmin = verts[0];
            let mut bmax = verts[0];
            for v in &verts[1..poly.vert_count()] {
                for k in 0..3 {
                    bmin[k] = bmin[k].min(v[k]);
                    bmax[k] = bmax[k].max(v[k]);
                }
            }
            if overlap_bounds(qmin, qmax, &bmin, &bmax) && found.len() < max {
                found.push(i);
            }
        }
        found
    }

    /// Nearest polygon to `center` within the box, favouring polygons
    /// directly below or above within climb height
    pub(crate) fn nearest_poly(&self, center: &[f32; 3], half_extents: &[f32; 3]) -> Option<(usize, [f32; 3])> {
        let qmin = vsub(center, half_extents);
        let qmax = vadd(center, half_extents);

        let mut nearest = None;
        let mut nearest_dist = f32::MAX;
        for i in self.polys_in_bounds(&qmin, &qmax, MAX_SNAP_CANDIDATES) {
            let (closest, over_poly) = self.closest_point_on_poly(i, center);
            let diff = vsub(center, &closest);
            let d = if over_poly {
                let d = diff[1].abs() - self.header.walkable_climb;
                if d > 0.0 {
                    d * d
                } else {
                    0.0
                }
            } else {
                vlen_sqr(&diff)
            };
            if d < nearest_dist {
                nearest_dist = d;
                nearest = Some((i, closest));
            }
        }
        nearest
    }

    /// Closest point on the polygon and whether `pos` lies over it
    pub(crate) fn closest_point_on_poly(&self, poly_index: usize, pos: &[f32; 3]) -> ([f32; 3], bool) {
        if let Some(h) = self.poly_height(poly_index, pos) {
            return ([pos[0], h, pos[2]], true);
        }

        let poly = &self.polys[poly_index];
        if poly.is_off_mesh_connection() {
            let v0 = &self.verts[poly.verts[0] as usize];
            let v1 = &self.verts[poly.verts[1] as usize];
            let (_, t) = dist_pt_seg_sqr_2d(pos, v0, v1);
            return (vlerp(v0, v1, t), false);
        }

        (self.closest_point_on_poly_edges(poly, pos), false)
    }

    /// Closest point to `pos` on the polygon outline
    pub(crate) fn closest_point_on_poly_edges(&self, poly: &Poly, pos: &[f32; 3]) -> [f32; 3] {
        let verts = self.poly_verts(poly);
        let nv = poly.vert_count();
        let mut dmin = f32::MAX;
        let mut best = (0, 0.0);
        for j in 0..nv {
            let (d, t) = dist_pt_seg_sqr_2d(pos, &verts[j], &verts[(j + 1) % nv]);
            if d < dmin {
                dmin = d;
                best = (j, t);
            }
        }
        let (j, t) = best;
        vlerp(&verts[j], &verts[(j + 1) % nv], t)
    }

    /// Height of the polygon surface at the xz location of `pos`
    pub(crate) fn poly_height(&self, poly_index: usize, pos: &[f32; 3]) -> Option<f32> {
        let poly = &self.polys[poly_index];
        if poly.is_off_mesh_connection() {
            return None;
        }

        let nv = poly.vert_count();
        let verts = self.poly_verts(poly);
        if !point_in_polygon(pos, &verts[..nv]) {
            return None;
        }

        let detail = self.detail_meshes.get(poly_index).filter(|d| d.tri_count > 0);
        if let Some(pd) = detail {
            let base = pd.tri_base as usize;
            let tris = self.detail_tris.get(base..base + pd.tri_count as usize).unwrap_or(&[]);
            for t in tris {
                let a = self.detail_vert(poly, pd, t[0]);
                let b = self.detail_vert(poly, pd, t[1]);
                let c = self.detail_vert(poly, pd, t[2]);
                if let Some(h) = closest_height_point_triangle(pos, &a, &b, &c) {
                    return Some(h);
                }
            }
        } else {
            for k in 2..nv {
                if let Some(h) = closest_height_point_triangle(pos, &verts[0], &verts[k - 1], &verts[k]) {
                    return Some(h);
                }
            }
        }

        // On an edge: triangle tests can all miss, take the nearest outline point
        Some(self.closest_point_on_poly_edges(poly, pos)[1])
    }

    /// Polygons with a portal edge on `side` that line up with segment va-vb.
    /// Returns poly indices and the overlap interval along the slab.
    pub(crate) fn connecting_polys(&self, va: &[f32; 3], vb: &[f32; 3], side: u8, max: usize) -> Vec<(usize, [f32; 2])> {
        let (amin, amax) = slab_end_points(va, vb, side);
        let apos = slab_coord(va, side);
        let m = EXT_LINK | u16::from(side);

        let mut found = Vec::new();
        for (i, poly) in self.polys.iter().enumerate() {
            let nv = poly.vert_count();
            for j in 0..nv {
                if poly.neis[j] != m {
                    continue;
                }
                let vc = &self.verts[poly.verts[j] as usize];
                let vd = &self.verts[poly.verts[(j + 1) % nv] as usize];
                let bpos = slab_coord(vc, side);
                if (apos - bpos).abs() > 0.01 {
                    continue;
                }
                let (bmin, bmax) = slab_end_points(vc, vd, side);
                if !overlap_slabs(&amin, &amax, &bmin, &bmax, 0.01, self.header.walkable_climb) {
                    continue;
                }
                if found.len() < max {
                    found.push((i, [amin[0].max(bmin[0]), amax[0].min(bmax[0])]));
                }
                break;
            }
        }
        found
    }
}

/// A tiled navigation mesh
#[derive(Debug)]
pub struct NavMesh {
    params: NavMeshParams,
    codec: HandleCodec,
    tiles: Vec<MeshTile>,
    pos_lookup: Vec<Option<usize>>,
    lut_mask: usize,
    next_free: Option<usize>,
}

impl NavMesh {
    /// Creates an empty mesh with every tile slot on the free list
    pub fn new(params: NavMeshParams) -> Result<Self> {
        params.validate()?;

        let max_tiles = params.max_tiles as usize;
        let lut_size = next_pow2(params.max_tiles / 4).max(1) as usize;

        let oom = |_| Status::FAILURE | Status::OUT_OF_MEMORY;
        let mut tiles = Vec::new();
        tiles.try_reserve_exact(max_tiles).map_err(oom)?;
        let mut pos_lookup = Vec::new();
        pos_lookup.try_reserve_exact(lut_size).map_err(oom)?;

        // Free list in ascending slot order
        tiles.extend((0..max_tiles).map(|i| MeshTile::empty((i + 1 < max_tiles).then_some(i + 1))));
        pos_lookup.resize(lut_size, None);

        log::debug!(
            "created nav mesh with {} tile slots, {} hash buckets",
            max_tiles,
            lut_size
        );

        Ok(Self {
            codec: HandleCodec::new(params.handle_bits),
            params,
            tiles,
            pos_lookup,
            lut_mask: lut_size - 1,
            next_free: (max_tiles > 0).then_some(0),
        })
    }

    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    pub fn codec(&self) -> HandleCodec {
        self.codec
    }

    pub fn max_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Occupied slot by index
    pub fn tile(&self, index: usize) -> Option<LiveTile<'_>> {
        let tile = self.tiles.get(index)?;
        let data = tile.data.as_ref()?;
        Some(LiveTile { index, tile, data })
    }

    /// All occupied slots
    pub fn tiles(&self) -> impl Iterator<Item = LiveTile<'_>> {
        (0..self.tiles.len()).filter_map(|i| self.tile(i))
    }

    /// Grid cell containing the position
    pub fn calc_tile_loc(&self, pos: &[f32; 3]) -> (i32, i32) {
        let tx = ((pos[0] - self.params.origin[0]) / self.params.tile_width).floor() as i32;
        let ty = ((pos[2] - self.params.origin[2]) / self.params.tile_height).floor() as i32;
        (tx, ty)
    }

    fn tile_index_at(&self, x: i32, y: i32, layer: i32) -> Option<usize> {
        let mut cur = self.pos_lookup[compute_tile_hash(x, y, self.lut_mask)];
        while let Some(i) = cur {
            let tile = &self.tiles[i];
            if let Some(h) = tile.header() {
                if h.x == x && h.y == y && h.layer == layer {
                    return Some(i);
                }
            }
            cur = tile.next;
        }
        None
    }

    fn tile_indices_at(&self, x: i32, y: i32) -> Vec<usize> {
        let mut found = Vec::new();
        let mut cur = self.pos_lookup[compute_tile_hash(x, y, self.lut_mask)];
        while let Some(i) = cur {
            let tile = &self.tiles[i];
            if tile.header().is_some_and(|h| h.x == x && h.y == y) {
                found.push(i);
            }
            cur = tile.next;
        }
        found
    }

    fn neighbour_tile_indices(&self, x: i32, y: i32, side: u8) -> Vec<usize> {
        match neighbour_cell(x, y, side) {
            Some((nx, ny)) => self.tile_indices_at(nx, ny),
            None => Vec::new(),
        }
    }

    /// Tile at the grid cell and layer
    pub fn get_tile_at(&self, x: i32, y: i32, layer: i32) -> Option<LiveTile<'_>> {
        self.tile_index_at(x, y, layer).and_then(|i| self.tile(i))
    }

    /// Every layer at the grid cell
    pub fn get_tiles_at(&self, x: i32, y: i32) -> Vec<LiveTile<'_>> {
        self.tile_indices_at(x, y)
            .into_iter()
            .filter_map(|i| self.tile(i))
            .collect()
    }

    pub fn get_tile_ref_at(&self, x: i32, y: i32, layer: i32) -> Option<PolyRef> {
        self.tile_index_at(x, y, layer).map(|i| self.poly_ref(i, 0))
    }

    /// Reference of the tile (poly index 0)
    pub fn get_tile_ref(&self, tile: LiveTile<'_>) -> PolyRef {
        self.poly_ref(tile.index, 0)
    }

    /// Base reference polygon refs of the tile are built from
    pub fn get_poly_ref_base(&self, tile: LiveTile<'_>) -> PolyRef {
        self.poly_ref(tile.index, 0)
    }

    #[inline]
    pub(crate) fn poly_ref(&self, tile_index: usize, poly_index: usize) -> PolyRef {
        self.codec
            .encode(self.tiles[tile_index].salt, tile_index as u32, poly_index as u32)
    }

    /// Tile addressed by a tile or polygon reference, if its salt still matches
    pub fn get_tile_by_ref(&self, tile_ref: PolyRef) -> Option<LiveTile<'_>> {
        if tile_ref.is_null() {
            return None;
        }
        let (salt, it, _) = self.codec.decode(tile_ref);
        let tile = self.tile(it as usize)?;
        (tile.salt() == salt).then_some(tile)
    }

    /// Validated lookup of a polygon
    pub fn get_tile_and_poly_by_ref(&self, poly_ref: PolyRef) -> Result<(LiveTile<'_>, &Poly)> {
        if poly_ref.is_null() {
            return Err(Status::FAILURE);
        }
        let (salt, it, ip) = self.codec.decode(poly_ref);
        let Some(tile) = self.tile(it as usize) else {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        };
        ensure_param!(tile.salt() == salt);
        let Some(poly) = tile.data.polys.get(ip as usize) else {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        };
        Ok((tile, poly))
    }

    /// Lookup without the salt check, for references taken from live links
    pub fn get_tile_and_poly_by_ref_unchecked(&self, poly_ref: PolyRef) -> Option<(LiveTile<'_>, &Poly)> {
        let (_, it, ip) = self.codec.decode(poly_ref);
        let tile = self.tile(it as usize)?;
        let poly = tile.data.polys.get(ip as usize)?;
        Some((tile, poly))
    }

    /// True if the reference addresses a live polygon
    pub fn is_valid_poly_ref(&self, poly_ref: PolyRef) -> bool {
        self.get_tile_and_poly_by_ref(poly_ref).is_ok()
    }

    /// Adds a tile and stitches it to its neighbours.
    ///
    /// With a non-null `last_ref` the tile is placed back into the slot and
    /// generation that reference names, so handles issued before a matching
    /// [`NavMesh::remove_tile`] become valid again.
    pub fn add_tile(&mut self, data: TileData, flags: TileFlags, last_ref: PolyRef) -> Result<PolyRef> {
        data.validate()?;

        let (x, y, layer) = (data.header.x, data.header.y, data.header.layer);
        if self.tile_index_at(x, y, layer).is_some() {
            log::warn!("tile ({x}, {y}, {layer}) is already occupied");
            return Err(Status::FAILURE | Status::ALREADY_OCCUPIED);
        }
        ensure_param!(data.polys.len() <= self.params.max_polys_per_tile as usize);

        let index = if last_ref.is_valid() {
            let target = self.codec.decode_tile(last_ref) as usize;
            if target >= self.tiles.len() {
                return Err(Status::FAILURE | Status::OUT_OF_MEMORY);
            }
            let salt = self.codec.decode_salt(last_ref);
            if salt == 0 {
                log::warn!("cannot restore tile slot {target} with salt 0");
                return Err(Status::FAILURE | Status::INVALID_PARAM);
            }

            let mut prev = None;
            let mut cur = self.next_free;
            while let Some(i) = cur {
                if i == target {
                    break;
                }
                prev = Some(i);
                cur = self.tiles[i].next;
            }
            if cur != Some(target) {
                log::warn!("tile slot {target} requested by {last_ref} is not free");
                return Err(Status::FAILURE | Status::OUT_OF_MEMORY);
            }

            let next = self.tiles[target].next;
            match prev {
                None => self.next_free = next,
                Some(p) => self.tiles[p].next = next,
            }
            self.tiles[target].salt = salt;
            target
        } else {
            let Some(i) = self.next_free else {
                log::warn!("no free tile slot for ({x}, {y}, {layer})");
                return Err(Status::FAILURE | Status::OUT_OF_MEMORY);
            };
            self.next_free = self.tiles[i].next;
            i
        };

        let h = compute_tile_hash(x, y, self.lut_mask);
        let tile = &mut self.tiles[index];
        tile.next = self.pos_lookup[h];
        self.pos_lookup[h] = Some(index);

        tile.links = LinkArena::with_capacity(data.link_capacity());
        tile.flags = flags;
        tile.data = Some(data);

        self.connect_int_links(index);
        self.base_off_mesh_links(index);
        self.connect_ext_off_mesh_links(index, index, None);

        for j in self.tile_indices_at(x, y) {
            if j == index {
                continue;
            }
            self.connect_ext_links(index, j, None);
            self.connect_ext_links(j, index, None);
            self.connect_ext_off_mesh_links(index, j, None);
            self.connect_ext_off_mesh_links(j, index, None);
        }

        for side in 0..8u8 {
            for j in self.neighbour_tile_indices(x, y, side) {
                self.connect_ext_links(index, j, Some(side));
                self.connect_ext_links(j, index, Some(opposite_tile(side)));
                self.connect_ext_off_mesh_links(index, j, Some(side));
                self.connect_ext_off_mesh_links(j, index, Some(opposite_tile(side)));
            }
        }

        let tile_ref = self.poly_ref(index, 0);
        log::debug!("added tile ({x}, {y}, {layer}) as {tile_ref}");
        Ok(tile_ref)
    }

    /// Removes a tile and unstitches its neighbours.
    ///
    /// Returns the payload unless the tile was added with
    /// [`TileFlags::FREE_DATA`].
    pub fn remove_tile(&mut self, tile_ref: PolyRef) -> Result<Option<TileData>> {
        ensure_param!(tile_ref.is_valid());
        let (salt, it, _) = self.codec.decode(tile_ref);
        let index = it as usize;
        ensure_param!(index < self.tiles.len());
        ensure_param!(self.tiles[index].salt == salt);
        let Some((x, y, layer)) = self.tiles[index].header().map(|h| (h.x, h.y, h.layer)) else {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        };

        // Unhook from the position hash
        let h = compute_tile_hash(x, y, self.lut_mask);
        let mut prev: Option<usize> = None;
        let mut cur = self.pos_lookup[h];
        while let Some(i) = cur {
            if i == index {
                let next = self.tiles[i].next;
                match prev {
                    None => self.pos_lookup[h] = next,
                    Some(p) => self.tiles[p].next = next,
                }
                break;
            }
            prev = Some(i);
            cur = self.tiles[i].next;
        }

        for j in self.tile_indices_at(x, y) {
            if j != index {
                self.unconnect_links(j, index);
            }
        }
        for side in 0..8u8 {
            for j in self.neighbour_tile_indices(x, y, side) {
                self.unconnect_links(j, index);
            }
        }

        let salt_mask = self.codec.salt_mask();
        let tile = &mut self.tiles[index];
        let mut data = tile.data.take();
        let flags = std::mem::take(&mut tile.flags);
        tile.links = LinkArena::default();

        tile.salt = tile.salt.wrapping_add(1) & salt_mask;
        if tile.salt == 0 {
            tile.salt = 1;
        }
        tile.next = self.next_free;
        self.next_free = Some(index);

        log::debug!("removed tile ({x}, {y}, {layer}) {tile_ref}");

        if flags.contains(TileFlags::FREE_DATA) {
            return Ok(None);
        }
        if let Some(data) = data.as_mut() {
            for poly in &mut data.polys {
                poly.first_link = NULL_LINK;
            }
        }
        Ok(data)
    }

    fn connect_int_links(&mut self, index: usize) {
        let base = self.poly_ref(index, 0);
        let codec = self.codec;
        let tile = &mut self.tiles[index];
        let Some(data) = tile.data.as_mut() else {
            return;
        };

        let salt = codec.decode_salt(base);
        for poly in &mut data.polys {
            poly.first_link = NULL_LINK;
            if poly.is_off_mesh_connection() {
                continue;
            }
            // Build backwards so the chain lists edges in ascending order
            for j in (0..poly.vert_count()).rev() {
                let nei = poly.neis[j];
                if nei == 0 || nei & EXT_LINK != 0 {
                    continue;
                }
                let reference = codec.encode(salt, index as u32, u32::from(nei - 1));
                tile.links
                    .prepend(poly, Link::new(reference, j as u8, LINK_SIDE_INTERNAL));
            }
        }
    }

    fn base_off_mesh_links(&mut self, index: usize) {
        let count = self.tiles[index].data.as_ref().map_or(0, |d| d.off_mesh_cons.len());
        for k in 0..count {
            let landing = {
                let Some(data) = self.tiles[index].data.as_ref() else {
                    return;
                };
                let con = &data.off_mesh_cons[k];
                let ext = [con.radius, data.header.walkable_climb, con.radius];
                let p = con.start_pos();
                match data.nearest_poly(&p, &ext) {
                    Some((land, nearest))
                        if sqr(nearest[0] - p[0]) + sqr(nearest[2] - p[2]) <= sqr(con.radius) =>
                    {
                        Some((con.poly as usize, land, nearest))
                    }
                    _ => None,
                }
            };
            let Some((con_poly, land, nearest)) = landing else {
                continue;
            };

            let con_ref = self.poly_ref(index, con_poly);
            let land_ref = self.poly_ref(index, land);
            let tile = &mut self.tiles[index];
            let Some(data) = tile.data.as_mut() else {
                return;
            };

            // Snap the start vertex onto the mesh
            let v = data.polys[con_poly].verts[0] as usize;
            data.verts[v] = nearest;

            tile.links.prepend(
                &mut data.polys[con_poly],
                Link::new(land_ref, 0, LINK_SIDE_INTERNAL),
            );
            tile.links.prepend(
                &mut data.polys[land],
                Link::new(con_ref, 0xff, LINK_SIDE_INTERNAL),
            );
        }
    }

    /// Links off-mesh connections of `target` that land in `tile`
    fn connect_ext_off_mesh_links(&mut self, tile_index: usize, target_index: usize, side: Option<u8>) {
        let opposite = side.map_or(LINK_SIDE_INTERNAL, opposite_tile);
        let count = self.tiles[target_index]
            .data
            .as_ref()
            .map_or(0, |d| d.off_mesh_cons.len());

        for k in 0..count {
            let landing = {
                let (Some(target), Some(tile)) = (
                    self.tiles[target_index].data.as_ref(),
                    self.tiles[tile_index].data.as_ref(),
                ) else {
                    return;
                };
                let con: &OffMeshConnection = &target.off_mesh_cons[k];
                if con.side != opposite {
                    continue;
                }
                // Start could not be connected at all
                if target.polys[con.poly as usize].first_link == NULL_LINK {
                    continue;
                }
                let ext = [con.radius, target.header.walkable_climb, con.radius];
                let p = con.end_pos();
                match tile.nearest_poly(&p, &ext) {
                    Some((land, nearest))
                        if sqr(nearest[0] - p[0]) + sqr(nearest[2] - p[2]) <= sqr(con.radius) =>
                    {
                        Some((con.poly as usize, con.is_bidirectional(), land, nearest))
                    }
                    _ => None,
                }
            };
            let Some((con_poly, bidir, land, nearest)) = landing else {
                continue;
            };

            let land_ref = self.poly_ref(tile_index, land);
            let con_ref = self.poly_ref(target_index, con_poly);

            {
                let target = &mut self.tiles[target_index];
                let Some(data) = target.data.as_mut() else {
                    return;
                };
                let v = data.polys[con_poly].verts[1] as usize;
                data.verts[v] = nearest;
                target
                    .links
                    .prepend(&mut data.polys[con_poly], Link::new(land_ref, 1, opposite));
            }

            if bidir {
                let tile = &mut self.tiles[tile_index];
                let Some(data) = tile.data.as_mut() else {
                    return;
                };
                tile.links.prepend(
                    &mut data.polys[land],
                    Link::new(con_ref, 0xff, side.unwrap_or(LINK_SIDE_INTERNAL)),
                );
            }
        }
    }

    /// Links portal edges of `tile` to matching polygons of `target`
    fn connect_ext_links(&mut self, tile_index: usize, target_index: usize, side: Option<u8>) {
        let pending: Vec<(usize, Link)> = {
            let (Some(tile), Some(target)) = (
                self.tiles[tile_index].data.as_ref(),
                self.tiles[target_index].data.as_ref(),
            ) else {
                return;
            };

            let mut pending = Vec::new();
            for (i, poly) in tile.polys.iter().enumerate() {
                let nv = poly.vert_count();
                for j in 0..nv {
                    if poly.neis[j] & EXT_LINK == 0 {
                        continue;
                    }
                    let dir = (poly.neis[j] & 0xff) as u8;
                    if side.is_some_and(|s| s != dir) {
                        continue;
                    }

                    let va = tile.verts[poly.verts[j] as usize];
                    let vb = tile.verts[poly.verts[(j + 1) % nv] as usize];
                    for (nei, area) in target.connecting_polys(&va, &vb, opposite_tile(dir), 4) {
                        let axis = match dir {
                            0 | 4 => Some(2),
                            2 | 6 => Some(0),
                            _ => None,
                        };
                        let (bmin, bmax) = match axis {
                            Some(a) => {
                                let tmin = (area[0] - va[a]) / (vb[a] - va[a]);
                                let tmax = (area[1] - va[a]) / (vb[a] - va[a]);
                                let (tmin, tmax) = if tmin > tmax { (tmax, tmin) } else { (tmin, tmax) };
                                (
                                    (tmin.clamp(0.0, 1.0) * 255.0).round() as u8,
                                    (tmax.clamp(0.0, 1.0) * 255.0).round() as u8,
                                )
                            }
                            None => (0, 255),
                        };
                        let reference = self.poly_ref(target_index, nei);
                        pending.push((
                            i,
                            Link {
                                bmin,
                                bmax,
                                ..Link::new(reference, j as u8, dir)
                            },
                        ));
                    }
                }
            }
            pending
        };

        let tile = &mut self.tiles[tile_index];
        let Some(data) = tile.data.as_mut() else {
            return;
        };
        for (poly, link) in pending {
            tile.links.prepend(&mut data.polys[poly], link);
        }
    }

    /// Drops every link of `tile` that points into `target`
    fn unconnect_links(&mut self, tile_index: usize, target_index: usize) {
        let codec = self.codec;
        let tile = &mut self.tiles[tile_index];
        let Some(data) = tile.data.as_mut() else {
            return;
        };

        for poly in &mut data.polys {
            let mut j = poly.first_link;
            let mut prev = NULL_LINK;
            while j != NULL_LINK {
                let link = tile.links.links[j as usize];
                if codec.decode_tile(link.reference) as usize == target_index {
                    if prev == NULL_LINK {
                        poly.first_link = link.next;
                    } else {
                        tile.links.links[prev as usize].next = link.next;
                    }
                    tile.links.release(j);
                } else {
                    prev = j;
                }
                j = link.next;
            }
        }
    }

    /// Polygons of `tile` whose portal edge on `side` lines up with va-vb
    pub fn find_connecting_polys(
        &self,
        va: &[f32; 3],
        vb: &[f32; 3],
        tile: LiveTile<'_>,
        side: u8,
        max: usize,
    ) -> Vec<(PolyRef, [f32; 2])> {
        tile.connecting_polys(va, vb, side, max)
            .into_iter()
            .map(|(i, area)| (self.poly_ref(tile.index, i), area))
            .collect()
    }

    /// Ground polygons of the tile overlapping the box
    pub fn query_polygons_in_tile(
        &self,
        tile: LiveTile<'_>,
        qmin: &[f32; 3],
        qmax: &[f32; 3],
        max: usize,
    ) -> Vec<PolyRef> {
        tile.polys_in_bounds(qmin, qmax, max)
            .into_iter()
            .map(|i| self.poly_ref(tile.index, i))
            .collect()
    }

    /// Nearest polygon of one tile and the closest point on it
    pub fn find_nearest_poly_in_tile(
        &self,
        tile: LiveTile<'_>,
        center: &[f32; 3],
        half_extents: &[f32; 3],
    ) -> Option<(PolyRef, [f32; 3])> {
        tile.nearest_poly(center, half_extents)
            .map(|(i, pt)| (self.poly_ref(tile.index, i), pt))
    }

    /// Closest point on the polygon and whether `pos` lies over it
    pub fn closest_point_on_poly(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<([f32; 3], bool)> {
        let (tile, _) = self.get_tile_and_poly_by_ref(poly_ref)?;
        let ip = self.codec.decode_poly(poly_ref) as usize;
        Ok(tile.closest_point_on_poly(ip, pos))
    }

    /// Surface height of the polygon at `pos`, `None` when `pos` is outside it
    pub fn get_poly_height(&self, tile: LiveTile<'_>, poly_index: usize, pos: &[f32; 3]) -> Option<f32> {
        if poly_index >= tile.polys.len() {
            return None;
        }
        tile.poly_height(poly_index, pos)
    }

    fn poly_mut(&mut self, poly_ref: PolyRef) -> Result<&mut Poly> {
        self.get_tile_and_poly_by_ref(poly_ref)?;
        let (_, it, ip) = self.codec.decode(poly_ref);
        self.tiles[it as usize]
            .data
            .as_mut()
            .and_then(|d| d.polys.get_mut(ip as usize))
            .ok_or(Status::FAILURE | Status::INVALID_PARAM)
    }

    pub fn set_poly_flags(&mut self, poly_ref: PolyRef, flags: PolyFlags) -> Result<()> {
        self.poly_mut(poly_ref)?.flags = flags;
        Ok(())
    }

    pub fn get_poly_flags(&self, poly_ref: PolyRef) -> Result<PolyFlags> {
        Ok(self.get_tile_and_poly_by_ref(poly_ref)?.1.flags)
    }

    pub fn set_poly_area(&mut self, poly_ref: PolyRef, area: u8) -> Result<()> {
        ensure_param!((area as usize) < MAX_AREAS);
        self.poly_mut(poly_ref)?.area = area;
        Ok(())
    }

    pub fn get_poly_area(&self, poly_ref: PolyRef) -> Result<u8> {
        Ok(self.get_tile_and_poly_by_ref(poly_ref)?.1.area)
    }

    /// Endpoints of an off-mesh connection, ordered so the first one is
    /// where the path arrives from `prev_ref`
    pub fn get_off_mesh_connection_poly_end_points(
        &self,
        prev_ref: PolyRef,
        poly_ref: PolyRef,
    ) -> Result<([f32; 3], [f32; 3])> {
        ensure_param!(poly_ref.is_valid());
        let (tile, poly) = self.get_tile_and_poly_by_ref(poly_ref)?;
        if !poly.is_off_mesh_connection() {
            return Err(Status::FAILURE);
        }

        let (mut idx0, mut idx1) = (0, 1);
        if let Some(link) = tile.poly_links(poly).find(|l| l.edge == 0) {
            if link.reference != prev_ref {
                (idx0, idx1) = (1, 0);
            }
        }

        Ok((
            tile.verts[poly.verts[idx0] as usize],
            tile.verts[poly.verts[idx1] as usize],
        ))
    }

    /// Off-mesh connection record behind a connection polygon
    pub fn get_off_mesh_connection_by_ref(&self, poly_ref: PolyRef) -> Result<&OffMeshConnection> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(poly_ref)?;
        if !poly.is_off_mesh_connection() {
            return Err(Status::FAILURE);
        }
        let ip = self.codec.decode_poly(poly_ref) as usize;
        tile.data
            .off_mesh_con_for_poly(ip)
            .ok_or(Status::FAILURE | Status::INVALID_PARAM)
    }

    /// Snapshot of per-polygon flags and areas
    pub fn store_tile_state(&self, tile_ref: PolyRef) -> Result<TileState> {
        let Some(tile) = self.get_tile_by_ref(tile_ref) else {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        };
        Ok(TileState {
            magic: TILE_STATE_MAGIC,
            version: TILE_STATE_VERSION,
            tile_ref: self.get_tile_ref(tile),
            polys: tile
                .polys
                .iter()
                .map(|p| PolyState {
                    flags: p.flags,
                    area: p.area,
                })
                .collect(),
        })
    }

    /// Applies a snapshot taken with [`NavMesh::store_tile_state`]
    pub fn restore_tile_state(&mut self, tile_ref: PolyRef, state: &TileState) -> Result<()> {
        if state.magic != TILE_STATE_MAGIC {
            return Err(Status::FAILURE | Status::WRONG_MAGIC);
        }
        if state.version != TILE_STATE_VERSION {
            return Err(Status::FAILURE | Status::WRONG_VERSION);
        }
        let Some(tile) = self.get_tile_by_ref(tile_ref) else {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        };
        ensure_param!(state.tile_ref == self.get_tile_ref(tile));
        ensure_param!(state.polys.len() == tile.polys.len());

        let index = tile.index;
        if let Some(data) = self.tiles[index].data.as_mut() {
            for (poly, saved) in data.polys.iter_mut().zip(&state.polys) {
                poly.flags = saved.flags;
                poly.area = saved.area;
            }
        }
        Ok(())
    }
}

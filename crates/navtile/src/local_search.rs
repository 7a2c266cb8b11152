//! Local searches on the tiny node pool
//!
//! These walks only look at a handful of polygons around a point, so they
//! use the small pool and a bounded breadth-first stack instead of the main
//! open list. A [`NavMeshQuery::find_path`] result stays intact across them.

use std::collections::VecDeque;

use crate::geometry::{
    dist_pt_seg_sqr_2d, overlap_poly_poly_2d, point_in_polygon, random_point_in_convex_poly, sqr, tri_area_2d,
    vdist, visfinite, vlerp,
};
use crate::handle::PolyRef;
use crate::nav_mesh_query::{neighbours, portal_points, NavMeshQuery};
use crate::node_pool::{NodeFlags, NodeIndex, NULL_NODE};
use crate::query_filter::{PolyInfo, QueryFilter};
use crate::status::{ensure_param, Result, Status};
use crate::EXT_LINK;

/// Capacity of the breadth-first stack
const MAX_LOCAL_STACK: usize = 48;

/// Neighbours collected per edge during a surface walk
const MAX_EDGE_NEIGHBOURS: usize = 8;

/// Portal intervals tracked per edge when splitting walls
const MAX_EDGE_INTERVALS: usize = 16;

/// Result of [`NavMeshQuery::move_along_surface`]
#[derive(Debug, Clone, PartialEq)]
pub struct MoveAlongSurface {
    /// Where the move ended
    pub result_pos: [f32; 3],
    /// Polygons crossed, from the start polygon to the one holding `result_pos`
    pub visited: Vec<PolyRef>,
}

/// A polygon of [`NavMeshQuery::find_local_neighbourhood`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNeighbour {
    pub poly_ref: PolyRef,
    /// Polygon it was reached from, null for the start polygon
    pub parent: PolyRef,
}

/// An edge piece of a polygon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallSegment {
    pub start: [f32; 3],
    pub end: [f32; 3],
    /// Polygon across the segment, null for walls
    pub neighbour: PolyRef,
}

impl WallSegment {
    pub fn is_wall(&self) -> bool {
        self.neighbour.is_null()
    }
}

/// A stretch of an edge covered by a portal, in 0..=255 edge units
#[derive(Debug, Clone, Copy)]
struct EdgeInterval {
    neighbour: PolyRef,
    tmin: i16,
    tmax: i16,
}

/// Inserts keeping `ints` sorted, drops the interval when full
fn insert_interval(ints: &mut Vec<EdgeInterval>, tmin: i16, tmax: i16, neighbour: PolyRef) {
    if ints.len() + 1 > MAX_EDGE_INTERVALS {
        return;
    }
    let idx = ints.iter().position(|i| tmax <= i.tmin).unwrap_or(ints.len());
    ints.insert(idx, EdgeInterval { neighbour, tmin, tmax });
}

impl<'a> NavMeshQuery<'a> {
    /// Passable polygons across edge `edge` of `cur`
    fn edge_neighbours(&self, cur: PolyInfo<'a>, edge: usize, filter: &dyn QueryFilter) -> Vec<PolyRef> {
        let nei = cur.poly.neis[edge];
        if nei & EXT_LINK != 0 {
            cur.tile
                .poly_links(cur.poly)
                .filter(|l| l.edge as usize == edge && l.reference.is_valid())
                .filter(|l| {
                    self.nav
                        .get_tile_and_poly_by_ref_unchecked(l.reference)
                        .is_some_and(|(tile, poly)| filter.pass_filter(l.reference, tile, poly))
                })
                .map(|l| l.reference)
                .take(MAX_EDGE_NEIGHBOURS)
                .collect()
        } else if nei != 0 {
            let idx = (nei - 1) as usize;
            let r = self.nav.poly_ref(cur.tile.index, idx);
            match cur.tile.polys.get(idx) {
                Some(poly) if filter.pass_filter(r, cur.tile, poly) => vec![r],
                _ => Vec::new(),
            }
        } else {
            Vec::new()
        }
    }

    /// Slides from `start_pos` towards `end_pos` along the surface, stopping
    /// at the nearest reachable point when a wall is in the way.
    ///
    /// The search stays within a circle spanning the two points. At most
    /// `max_visited` polygons are reported; a longer trail is cut with
    /// `BUFFER_TOO_SMALL`.
    pub fn move_along_surface(
        &mut self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
        max_visited: usize,
    ) -> Result<(MoveAlongSurface, Status)> {
        ensure_param!(self.nav.is_valid_poly_ref(start_ref));
        ensure_param!(visfinite(start_pos) && visfinite(end_pos) && max_visited > 0);

        self.tiny_node_pool.clear();
        let start = self
            .tiny_node_pool
            .get_node(start_ref, 0)
            .ok_or(Status::FAILURE | Status::OUT_OF_NODES)?;
        {
            let node = self.tiny_node_pool.node_mut(start);
            node.pidx = NULL_NODE;
            node.cost = 0.0;
            node.total = 0.0;
            node.flags = NodeFlags::CLOSED;
        }
        let mut stack = VecDeque::with_capacity(MAX_LOCAL_STACK);
        stack.push_back(start);

        let mut best_pos = *start_pos;
        let mut best_dist = f32::MAX;
        let mut best_node: Option<NodeIndex> = None;

        let search_pos = vlerp(start_pos, end_pos, 0.5);
        let search_rad_sqr = sqr(vdist(start_pos, end_pos) / 2.0 + 0.001);

        while let Some(cur_idx) = stack.pop_front() {
            let cur_ref = self.tiny_node_pool.node(cur_idx).id;
            let Some((tile, poly)) = self.nav.get_tile_and_poly_by_ref_unchecked(cur_ref) else {
                continue;
            };
            let cur = PolyInfo {
                poly_ref: cur_ref,
                tile,
                poly,
            };
            let nv = poly.vert_count();
            let verts = tile.poly_verts(poly);

            if point_in_polygon(end_pos, &verts[..nv]) {
                best_node = Some(cur_idx);
                best_pos = *end_pos;
                break;
            }

            for j in 0..nv {
                let vj = &verts[j];
                let vi = &verts[(j + 1) % nv];
                let neis = self.edge_neighbours(cur, j, filter);

                if neis.is_empty() {
                    // Wall: candidate for the closest reachable point
                    let (dist_sqr, t) = dist_pt_seg_sqr_2d(end_pos, vj, vi);
                    if dist_sqr < best_dist {
                        best_pos = vlerp(vj, vi, t);
                        best_dist = dist_sqr;
                        best_node = Some(cur_idx);
                    }
                    continue;
                }

                for nei_ref in neis {
                    let Some(nei_idx) = self.tiny_node_pool.get_node(nei_ref, 0) else {
                        continue;
                    };
                    if self.tiny_node_pool.node(nei_idx).flags.contains(NodeFlags::CLOSED) {
                        continue;
                    }
                    // Cheaper than the exact portal and good enough to bound the walk
                    if dist_pt_seg_sqr_2d(&search_pos, vj, vi).0 > search_rad_sqr {
                        continue;
                    }
                    if stack.len() < MAX_LOCAL_STACK {
                        let node = self.tiny_node_pool.node_mut(nei_idx);
                        node.pidx = cur_idx;
                        node.flags.insert(NodeFlags::CLOSED);
                        stack.push_back(nei_idx);
                    }
                }
            }
        }

        let mut visited = Vec::new();
        let mut status = Status::SUCCESS;
        let mut cur = best_node;
        while let Some(idx) = cur {
            visited.push(self.tiny_node_pool.node(idx).id);
            cur = self.tiny_node_pool.parent(idx);
        }
        visited.reverse();
        if visited.len() > max_visited {
            visited.truncate(max_visited);
            status |= Status::BUFFER_TOO_SMALL;
        }

        Ok((
            MoveAlongSurface {
                result_pos: best_pos,
                visited,
            },
            status,
        ))
    }

    /// Non-overlapping polygons around `center` reachable from `start_ref`.
    ///
    /// Polygons that overlap an already collected, unconnected polygon in xz
    /// are skipped, so the result is a single layer of surface.
    pub fn find_local_neighbourhood(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &dyn QueryFilter,
        max_result: usize,
    ) -> Result<(Vec<LocalNeighbour>, Status)> {
        ensure_param!(self.nav.is_valid_poly_ref(start_ref));
        ensure_param!(visfinite(center) && radius >= 0.0 && radius.is_finite() && max_result > 0);

        let nav = self.nav;
        self.tiny_node_pool.clear();
        let start = self
            .tiny_node_pool
            .get_node(start_ref, 0)
            .ok_or(Status::FAILURE | Status::OUT_OF_NODES)?;
        {
            let node = self.tiny_node_pool.node_mut(start);
            node.pidx = NULL_NODE;
            node.flags = NodeFlags::CLOSED;
        }
        let mut stack = VecDeque::with_capacity(MAX_LOCAL_STACK);
        stack.push_back(start);

        let radius_sqr = sqr(radius);
        let mut status = Status::SUCCESS;
        let mut result = vec![LocalNeighbour {
            poly_ref: start_ref,
            parent: PolyRef::NULL,
        }];

        while let Some(cur_idx) = stack.pop_front() {
            let cur_ref = self.tiny_node_pool.node(cur_idx).id;
            let Some((tile, poly)) = nav.get_tile_and_poly_by_ref_unchecked(cur_ref) else {
                continue;
            };
            let cur = PolyInfo {
                poly_ref: cur_ref,
                tile,
                poly,
            };

            for nei in neighbours(nav, tile, poly, PolyRef::NULL) {
                let nei_info = nei.info;
                let Some(nei_idx) = self.tiny_node_pool.get_node(nei_info.poly_ref, 0) else {
                    continue;
                };
                if self.tiny_node_pool.node(nei_idx).flags.contains(NodeFlags::CLOSED) {
                    continue;
                }
                if nei_info.poly.is_off_mesh_connection()
                    || !filter.pass_filter(nei_info.poly_ref, nei_info.tile, nei_info.poly)
                {
                    continue;
                }
                let Some((va, vb)) = portal_points(cur, nei_info) else {
                    continue;
                };
                if dist_pt_seg_sqr_2d(center, &va, &vb).0 > radius_sqr {
                    continue;
                }

                // Closed before the overlap test so a rejected polygon is not retried
                {
                    let node = self.tiny_node_pool.node_mut(nei_idx);
                    node.flags.insert(NodeFlags::CLOSED);
                    node.pidx = cur_idx;
                }

                let npa = nei_info.poly.vert_count();
                let pa = nei_info.tile.poly_verts(nei_info.poly);
                let overlaps = result.iter().any(|past| {
                    // Connected polygons do not overlap
                    if tile.poly_links(poly).any(|l| l.reference == past.poly_ref) {
                        return false;
                    }
                    let Some((past_tile, past_poly)) = nav.get_tile_and_poly_by_ref_unchecked(past.poly_ref) else {
                        return false;
                    };
                    let pb = past_tile.poly_verts(past_poly);
                    overlap_poly_poly_2d(&pa[..npa], &pb[..past_poly.vert_count()])
                });
                if overlaps {
                    continue;
                }

                if result.len() < max_result {
                    result.push(LocalNeighbour {
                        poly_ref: nei_info.poly_ref,
                        parent: cur_ref,
                    });
                } else {
                    status |= Status::BUFFER_TOO_SMALL;
                }
                if stack.len() < MAX_LOCAL_STACK {
                    stack.push_back(nei_idx);
                }
            }
        }

        Ok((result, status))
    }

    /// Wall segments of one polygon, and with `store_portals` the portal
    /// segments to passable neighbours as well.
    pub fn get_poly_wall_segments(
        &self,
        poly_ref: PolyRef,
        filter: &dyn QueryFilter,
        store_portals: bool,
        max_segments: usize,
    ) -> Result<(Vec<WallSegment>, Status)> {
        let cur = self.poly_info(poly_ref)?;
        let PolyInfo { tile, poly, .. } = cur;
        let nv = poly.vert_count();

        let mut segments = Vec::new();
        let mut status = Status::SUCCESS;
        let mut push = |segments: &mut Vec<WallSegment>, start: [f32; 3], end: [f32; 3], neighbour: PolyRef| {
            if segments.len() < max_segments {
                segments.push(WallSegment { start, end, neighbour });
            } else {
                status |= Status::BUFFER_TOO_SMALL;
            }
        };

        for j in 0..nv {
            let vj = tile.verts[poly.verts[j] as usize];
            let vi = tile.verts[poly.verts[(j + 1) % nv] as usize];
            let nei = poly.neis[j];

            if nei & EXT_LINK == 0 {
                // Internal edge: one segment, a portal if the neighbour passes
                let mut nei_ref = PolyRef::NULL;
                if nei != 0 {
                    let idx = (nei - 1) as usize;
                    let r = self.nav.poly_ref(tile.index, idx);
                    if tile.polys.get(idx).is_some_and(|p| filter.pass_filter(r, tile, p)) {
                        nei_ref = r;
                    }
                }
                if nei_ref.is_valid() && !store_portals {
                    continue;
                }
                push(&mut segments, vj, vi, nei_ref);
                continue;
            }

            // Tile border: split the edge into portal and wall pieces
            let mut ints = Vec::with_capacity(MAX_EDGE_INTERVALS);
            for link in tile.poly_links(poly).filter(|l| l.edge as usize == j && l.reference.is_valid()) {
                let passable = self
                    .nav
                    .get_tile_and_poly_by_ref_unchecked(link.reference)
                    .is_some_and(|(t, p)| filter.pass_filter(link.reference, t, p));
                if passable {
                    insert_interval(&mut ints, link.bmin as i16, link.bmax as i16, link.reference);
                }
            }
            insert_interval(&mut ints, -1, 0, PolyRef::NULL);
            insert_interval(&mut ints, 255, 256, PolyRef::NULL);

            for k in 1..ints.len() {
                if store_portals && ints[k].neighbour.is_valid() {
                    let tmin = ints[k].tmin as f32 / 255.0;
                    let tmax = ints[k].tmax as f32 / 255.0;
                    push(&mut segments, vlerp(&vj, &vi, tmin), vlerp(&vj, &vi, tmax), ints[k].neighbour);
                }
                let imin = ints[k - 1].tmax;
                let imax = ints[k].tmin;
                if imin != imax {
                    let tmin = imin as f32 / 255.0;
                    let tmax = imax as f32 / 255.0;
                    push(&mut segments, vlerp(&vj, &vi, tmin), vlerp(&vj, &vi, tmax), PolyRef::NULL);
                }
            }
        }

        Ok((segments, status))
    }

    /// Random point on the mesh.
    ///
    /// A tile is picked uniformly, then a polygon weighted by its area, then
    /// a point inside it. `rand` must return values in `[0, 1)`.
    pub fn find_random_point(
        &self,
        filter: &dyn QueryFilter,
        mut rand: impl FnMut() -> f32,
    ) -> Result<(PolyRef, [f32; 3])> {
        let mut picked_tile = None;
        let mut tile_sum = 0.0;
        for tile in self.nav.tiles() {
            // Every tile weighs the same
            tile_sum += 1.0;
            if rand() * tile_sum <= 1.0 {
                picked_tile = Some(tile);
            }
        }
        let tile = picked_tile.ok_or(Status::FAILURE)?;

        let mut picked = None;
        let mut area_sum = 0.0;
        for (i, poly) in tile.polys.iter().enumerate() {
            if poly.is_off_mesh_connection() {
                continue;
            }
            let r = self.nav.poly_ref(tile.index, i);
            if !filter.pass_filter(r, tile, poly) {
                continue;
            }
            let verts = tile.poly_verts(poly);
            let area: f32 = (2..poly.vert_count())
                .map(|j| tri_area_2d(&verts[0], &verts[j - 1], &verts[j]))
                .sum::<f32>()
                .abs();
            area_sum += area;
            if rand() * area_sum <= area {
                picked = Some((r, i));
            }
        }
        let (poly_ref, poly_index) = picked.ok_or(Status::FAILURE)?;

        let poly = &tile.polys[poly_index];
        let verts = tile.poly_verts(poly);
        let s = rand();
        let t = rand();
        let pt = random_point_in_convex_poly(&verts[..poly.vert_count()], s, t);
        let (pt, _) = tile.closest_point_on_poly(poly_index, &pt);
        Ok((poly_ref, pt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{block_cell, grid_tile, mesh_with_tile, poly_ref_at, single_tile_mesh};
    use crate::{DefaultQueryFilter, QueryConfig};

    #[test]
    fn test_insert_interval_keeps_order() {
        let mut ints = Vec::new();
        insert_interval(&mut ints, 100, 200, PolyRef::from_raw(1));
        insert_interval(&mut ints, -1, 0, PolyRef::NULL);
        insert_interval(&mut ints, 255, 256, PolyRef::NULL);
        insert_interval(&mut ints, 10, 50, PolyRef::from_raw(2));
        let order: Vec<i16> = ints.iter().map(|i| i.tmin).collect();
        assert_eq!(order, vec![-1, 10, 100, 255]);
    }

    #[test]
    fn test_move_along_surface_reaches_target() {
        let mesh = single_tile_mesh(3, 1, 1.0);
        let mut query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let filter = DefaultQueryFilter::default();
        let start = poly_ref_at(&mesh, 0, 0, 0);

        let (moved, status) = query
            .move_along_surface(start, &[0.5, 0.0, 0.5], &[2.5, 0.0, 0.5], &filter, 8)
            .unwrap();
        assert_eq!(status, Status::SUCCESS);
        assert_eq!(moved.result_pos, [2.5, 0.0, 0.5]);
        let expected: Vec<PolyRef> = (0..3).map(|i| poly_ref_at(&mesh, 0, 0, i)).collect();
        assert_eq!(moved.visited, expected);
    }

    #[test]
    fn test_move_along_surface_stops_at_wall() {
        let mut tile = grid_tile(0, 0, 3, 1, 1.0, false);
        block_cell(&mut tile, 1);
        let mesh = mesh_with_tile(tile, 3.0, 1.0);
        let mut query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let filter = DefaultQueryFilter::default();
        let start = poly_ref_at(&mesh, 0, 0, 0);

        let (moved, status) = query
            .move_along_surface(start, &[0.5, 0.0, 0.5], &[2.5, 0.0, 0.5], &filter, 8)
            .unwrap();
        assert!(status.is_success());
        assert!((moved.result_pos[0] - 1.0).abs() < 1e-5);
        assert!((moved.result_pos[2] - 0.5).abs() < 1e-5);
        assert_eq!(moved.visited, vec![start]);
    }

    #[test]
    fn test_local_neighbourhood_radius() {
        let mesh = single_tile_mesh(5, 1, 1.0);
        let mut query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let filter = DefaultQueryFilter::default();
        let start = poly_ref_at(&mesh, 0, 0, 2);

        let (found, status) = query
            .find_local_neighbourhood(start, &[2.5, 0.0, 0.5], 0.8, &filter, 16)
            .unwrap();
        assert!(status.is_success());
        assert_eq!(found.len(), 3);
        assert_eq!(found[0], LocalNeighbour { poly_ref: start, parent: PolyRef::NULL });
        assert!(found[1..].iter().all(|n| n.parent == start));
    }

    #[test]
    fn test_wall_segments() {
        let mesh = single_tile_mesh(2, 1, 1.0);
        let query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let filter = DefaultQueryFilter::default();
        let r = poly_ref_at(&mesh, 0, 0, 0);

        // Three border walls, one shared edge
        let (walls, _) = query.get_poly_wall_segments(r, &filter, false, 16).unwrap();
        assert_eq!(walls.len(), 3);
        assert!(walls.iter().all(WallSegment::is_wall));

        let (all, _) = query.get_poly_wall_segments(r, &filter, true, 16).unwrap();
        assert_eq!(all.len(), 4);
        let portal = all.iter().find(|s| !s.is_wall()).unwrap();
        assert_eq!(portal.neighbour, poly_ref_at(&mesh, 0, 0, 1));

        let (few, status) = query.get_poly_wall_segments(r, &filter, true, 2).unwrap();
        assert_eq!(few.len(), 2);
        assert!(status.has_detail(Status::BUFFER_TOO_SMALL));
    }

    #[test]
    fn test_random_point_lies_on_mesh() {
        let mesh = single_tile_mesh(2, 2, 1.0);
        let query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let filter = DefaultQueryFilter::default();

        let mut seed = 0.37_f32;
        let mut rand = move || {
            seed = (seed * 7.13 + 0.11).fract();
            seed
        };
        for _ in 0..20 {
            let (r, pt) = query.find_random_point(&filter, &mut rand).unwrap();
            let (closest, over) = mesh.closest_point_on_poly(r, &pt).unwrap();
            assert!(over);
            assert!((closest[0] - pt[0]).abs() < 1e-4 && (closest[2] - pt[2]).abs() < 1e-4);
        }

        let nothing = DefaultQueryFilter::new(crate::PolyFlags::SWIM, crate::PolyFlags::empty());
        assert!(query.find_random_point(&nothing, || 0.5).is_err());
    }
}

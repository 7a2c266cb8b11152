//! Navigation mesh query engine
//!
//! [`NavMeshQuery`] borrows a [`NavMesh`] and owns the scratch memory the
//! searches run on: a main node pool and open list for A* and Dijkstra, and a
//! tiny pool for local walks. Path searches live here; raycasts, string
//! pulling, sliced searches and local searches extend the type from their own
//! modules.

use crate::config::QueryConfig;
use crate::geometry::{
    dist_pt_seg_sqr_2d, distance_pt_poly_edges_sqr, intersect_segment_poly_2d, next_pow2, sqr, vdist,
    vdist_sqr, visfinite, vlerp, vnormalize, vsub,
};
use crate::handle::PolyRef;
use crate::nav_mesh::{Link, LiveTile, NavMesh};
use crate::node_pool::{Node, NodeFlags, NodeIndex, NodePool, NodeQueue, NULL_NODE};
use crate::poly_query::{CollectPolys, FindNearestPolyQuery, PolyQuery};
use crate::query_filter::{PolyInfo, QueryFilter};
use crate::raycast::RaycastOptions;
use crate::sliced_pathfinding::{FindPathOptions, SlicedQuery};
use crate::status::{ensure_param, Result, Status};
use crate::tile_data::Poly;
use crate::{EXT_LINK, LINK_SIDE_INTERNAL, MAX_VERTS_PER_POLY};

/// Polygons handed to a [`PolyQuery`] per call
const QUERY_BATCH_SIZE: usize = 32;

/// Nodes one polygon may own, one per crossing side
pub(crate) const MAX_STATES_PER_NODE: usize = 4;

/// Result of [`NavMeshQuery::find_nearest_poly`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestPoly {
    pub poly_ref: PolyRef,
    /// Closest point on the polygon
    pub point: [f32; 3],
    /// True if the query center lies directly above or below the polygon
    pub over_poly: bool,
}

/// Polygons reached by a Dijkstra flood, in the order they were settled
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircleSearch {
    pub refs: Vec<PolyRef>,
    /// Polygon each entry was reached from, null for the start polygon
    pub parents: Vec<PolyRef>,
    /// Search cost from the start to each entry
    pub costs: Vec<f32>,
}

impl CircleSearch {
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Result of [`NavMeshQuery::find_distance_to_wall`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallHit {
    /// Distance to the nearest wall, or the search radius if none was found
    pub distance: f32,
    /// Nearest point on the wall. Equals the query center when no wall was hit.
    pub hit_pos: [f32; 3],
    /// Wall normal pointing towards the center, zero when no wall was hit
    pub hit_normal: [f32; 3],
}

/// A polygon reached over a link
#[derive(Debug, Clone, Copy)]
pub(crate) struct Neighbour<'a> {
    pub link: &'a Link,
    pub info: PolyInfo<'a>,
}

/// Links of `poly` that lead somewhere, skipping `skip` (usually the parent)
pub(crate) fn neighbours<'a>(
    nav: &'a NavMesh,
    tile: LiveTile<'a>,
    poly: &'a Poly,
    skip: PolyRef,
) -> impl Iterator<Item = Neighbour<'a>> + 'a {
    tile.poly_links(poly).filter_map(move |link| {
        let r = link.reference;
        if r.is_null() || r == skip {
            return None;
        }
        let (tile, poly) = nav.get_tile_and_poly_by_ref_unchecked(r)?;
        Some(Neighbour {
            link,
            info: PolyInfo { poly_ref: r, tile, poly },
        })
    })
}

/// Portal between two adjacent polygons, left and right as seen from `from`
pub(crate) fn portal_points(from: PolyInfo<'_>, to: PolyInfo<'_>) -> Option<([f32; 3], [f32; 3])> {
    let link = from
        .tile
        .poly_links(from.poly)
        .find(|l| l.reference == to.poly_ref)?;

    // Off-mesh connections collapse the portal onto their endpoint
    if from.poly.is_off_mesh_connection() {
        let v = from.tile.verts[from.poly.verts[link.edge as usize] as usize];
        return Some((v, v));
    }
    if to.poly.is_off_mesh_connection() {
        let back = to
            .tile
            .poly_links(to.poly)
            .find(|l| l.reference == from.poly_ref)?;
        let v = to.tile.verts[to.poly.verts[back.edge as usize] as usize];
        return Some((v, v));
    }

    let nv = from.poly.vert_count();
    let edge = link.edge as usize;
    let v0 = &from.tile.verts[from.poly.verts[edge] as usize];
    let v1 = &from.tile.verts[from.poly.verts[(edge + 1) % nv] as usize];

    // Tile border links may only cover part of the edge
    if link.side != LINK_SIDE_INTERNAL && (link.bmin != 0 || link.bmax != 255) {
        let s = 1.0 / 255.0;
        return Some((
            vlerp(v0, v1, link.bmin as f32 * s),
            vlerp(v0, v1, link.bmax as f32 * s),
        ));
    }
    Some((*v0, *v1))
}

/// Search state of one A* run between two polygons
#[derive(Debug, Clone)]
pub(crate) struct PathSearch {
    pub status: Status,
    pub start_ref: PolyRef,
    pub end_ref: PolyRef,
    pub start_pos: [f32; 3],
    pub end_pos: [f32; 3],
    pub last_best_node: NodeIndex,
    pub last_best_node_cost: f32,
    pub options: FindPathOptions,
    pub raycast_limit_sqr: f32,
}

impl PathSearch {
    pub fn new(start_ref: PolyRef, end_ref: PolyRef, start_pos: &[f32; 3], end_pos: &[f32; 3]) -> Self {
        Self {
            status: Status::IN_PROGRESS,
            start_ref,
            end_ref,
            start_pos: *start_pos,
            end_pos: *end_pos,
            last_best_node: NULL_NODE,
            last_best_node_cost: f32::MAX,
            options: FindPathOptions::empty(),
            raycast_limit_sqr: f32::MAX,
        }
    }
}

/// What one A* expansion did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchStep {
    /// The open list was empty
    Exhausted,
    /// A node was closed and its neighbours relaxed
    Expanded,
    /// The end polygon was popped
    ReachedEnd,
    /// A polygon on the current branch no longer exists
    Invalid,
}

/// Hooks that specialize the shared Dijkstra flood
trait FloodPolicy {
    /// Whether edge costs come from the filter rather than plain distance
    const FILTER_COST: bool;

    /// Called when a polygon is settled. Returns detail bits to report.
    fn visit(&mut self, nav: &NavMesh, node: &Node, parent_ref: PolyRef, cur: PolyInfo<'_>, filter: &dyn QueryFilter) -> Status;

    /// Whether the flood may cross the portal `va`-`vb` into `to`
    fn crosses(&self, va: &[f32; 3], vb: &[f32; 3], to: &Poly) -> bool;
}

/// Records settled polygons up to a limit
struct RecordPolicy<C> {
    result: CircleSearch,
    max_result: usize,
    crosses: C,
}

impl<C: Fn(&[f32; 3], &[f32; 3]) -> bool> FloodPolicy for RecordPolicy<C> {
    const FILTER_COST: bool = true;

    fn visit(&mut self, _nav: &NavMesh, node: &Node, parent_ref: PolyRef, _cur: PolyInfo<'_>, _filter: &dyn QueryFilter) -> Status {
        if self.result.refs.len() >= self.max_result {
            return Status::BUFFER_TOO_SMALL;
        }
        self.result.refs.push(node.id);
        self.result.parents.push(parent_ref);
        self.result.costs.push(node.total);
        Status::empty()
    }

    fn crosses(&self, va: &[f32; 3], vb: &[f32; 3], _to: &Poly) -> bool {
        (self.crosses)(va, vb)
    }
}

/// Shrinks a search circle to the nearest solid edge
struct WallPolicy {
    center: [f32; 3],
    radius_sqr: f32,
    hit_pos: [f32; 3],
    hit_edge: Option<([f32; 3], [f32; 3])>,
}

impl FloodPolicy for WallPolicy {
    const FILTER_COST: bool = false;

    fn visit(&mut self, nav: &NavMesh, _node: &Node, _parent_ref: PolyRef, cur: PolyInfo<'_>, filter: &dyn QueryFilter) -> Status {
        let PolyInfo { tile, poly, .. } = cur;
        let nv = poly.vert_count();
        for j in 0..nv {
            let nei = poly.neis[j];
            let solid = if nei & EXT_LINK != 0 {
                // Tile border: solid unless the link on this edge is passable
                match tile.poly_links(poly).find(|l| l.edge as usize == j) {
                    Some(link) if link.reference.is_valid() => !nav
                        .get_tile_and_poly_by_ref_unchecked(link.reference)
                        .is_some_and(|(t, p)| filter.pass_filter(link.reference, t, p)),
                    _ => true,
                }
            } else if nei != 0 {
                let idx = (nei - 1) as usize;
                match tile.polys.get(idx) {
                    Some(p) => !filter.pass_filter(nav.poly_ref(tile.index, idx), tile, p),
                    None => true,
                }
            } else {
                true
            };
            if !solid {
                continue;
            }

            let vj = tile.verts[poly.verts[j] as usize];
            let vi = tile.verts[poly.verts[(j + 1) % nv] as usize];
            let (dist_sqr, t) = dist_pt_seg_sqr_2d(&self.center, &vj, &vi);
            if dist_sqr > self.radius_sqr {
                continue;
            }
            self.radius_sqr = dist_sqr;
            self.hit_pos = vlerp(&vj, &vi, t);
            self.hit_edge = Some((vj, vi));
        }
        Status::empty()
    }

    fn crosses(&self, va: &[f32; 3], vb: &[f32; 3], to: &Poly) -> bool {
        if to.is_off_mesh_connection() {
            return false;
        }
        dist_pt_seg_sqr_2d(&self.center, va, vb).0 <= self.radius_sqr
    }
}

/// Query engine over a borrowed [`NavMesh`]
pub struct NavMeshQuery<'a> {
    pub(crate) nav: &'a NavMesh,
    pub(crate) config: QueryConfig,
    pub(crate) node_pool: NodePool,
    pub(crate) open_list: NodeQueue,
    pub(crate) tiny_node_pool: NodePool,
    pub(crate) sliced: Option<SlicedQuery<'a>>,
}

impl std::fmt::Debug for NavMeshQuery<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavMeshQuery")
            .field("config", &self.config)
            .field("nodes", &self.node_pool.node_count())
            .field("sliced", &self.sliced.is_some())
            .finish()
    }
}

impl<'a> NavMeshQuery<'a> {
    /// Creates a query with its node pools sized by `config`
    pub fn new(nav: &'a NavMesh, config: QueryConfig) -> Result<Self> {
        config.validate()?;
        let hash_size = next_pow2((config.max_nodes / 4).max(1) as u32) as usize;
        let tiny_hash = next_pow2((config.tiny_nodes / 2).max(1) as u32) as usize;
        Ok(Self {
            nav,
            node_pool: NodePool::new(config.max_nodes, hash_size),
            open_list: NodeQueue::new(config.max_nodes),
            tiny_node_pool: NodePool::new(config.tiny_nodes, tiny_hash),
            sliced: None,
            config,
        })
    }

    pub fn nav_mesh(&self) -> &'a NavMesh {
        self.nav
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Main node pool, holding the state of the last search
    pub fn node_pool(&self) -> &NodePool {
        &self.node_pool
    }

    /// Validated polygon lookup bundled for filter callbacks
    pub(crate) fn poly_info(&self, poly_ref: PolyRef) -> Result<PolyInfo<'a>> {
        let (tile, poly) = self.nav.get_tile_and_poly_by_ref(poly_ref)?;
        Ok(PolyInfo { poly_ref, tile, poly })
    }

    /// Polygons overlapping the box that pass the filter, up to `max_polys`.
    /// Reports `BUFFER_TOO_SMALL` if more were found.
    pub fn query_polygons(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &dyn QueryFilter,
        max_polys: usize,
    ) -> Result<(Vec<PolyRef>, Status)> {
        ensure_param!(max_polys > 0);
        let mut collector = CollectPolys::new(max_polys);
        self.query_polygons_with(center, half_extents, filter, &mut collector)?;
        let status = if collector.overflow() {
            Status::SUCCESS | Status::BUFFER_TOO_SMALL
        } else {
            Status::SUCCESS
        };
        Ok((collector.into_polys(), status))
    }

    /// Feeds every polygon overlapping the box that passes the filter to `query`
    pub fn query_polygons_with(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &dyn QueryFilter,
        query: &mut dyn PolyQuery,
    ) -> Result<()> {
        ensure_param!(visfinite(center) && visfinite(half_extents));
        ensure_param!(half_extents.iter().all(|&e| e >= 0.0));

        let bmin = [center[0] - half_extents[0], center[1] - half_extents[1], center[2] - half_extents[2]];
        let bmax = [center[0] + half_extents[0], center[1] + half_extents[1], center[2] + half_extents[2]];
        let (minx, miny) = self.nav.calc_tile_loc(&bmin);
        let (maxx, maxy) = self.nav.calc_tile_loc(&bmax);

        for y in miny..=maxy {
            for x in minx..=maxx {
                for tile in self.nav.get_tiles_at(x, y) {
                    self.query_polygons_in_tile(tile, &bmin, &bmax, filter, query);
                }
            }
        }
        Ok(())
    }

    fn query_polygons_in_tile(
        &self,
        tile: LiveTile<'_>,
        qmin: &[f32; 3],
        qmax: &[f32; 3],
        filter: &dyn QueryFilter,
        query: &mut dyn PolyQuery,
    ) {
        let mut polys: Vec<&Poly> = Vec::with_capacity(QUERY_BATCH_SIZE);
        let mut refs = Vec::with_capacity(QUERY_BATCH_SIZE);
        for i in tile.polys_in_bounds(qmin, qmax, usize::MAX) {
            let poly = &tile.polys[i];
            let poly_ref = self.nav.poly_ref(tile.index, i);
            if !filter.pass_filter(poly_ref, tile, poly) {
                continue;
            }
            polys.push(poly);
            refs.push(poly_ref);
            if refs.len() == QUERY_BATCH_SIZE {
                query.process(tile, &polys, &refs);
                polys.clear();
                refs.clear();
            }
        }
        if !refs.is_empty() {
            query.process(tile, &polys, &refs);
        }
    }

    /// Polygon nearest to `center` inside the search box. `Ok(None)` when the
    /// box touches no polygon.
    pub fn find_nearest_poly(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &dyn QueryFilter,
    ) -> Result<Option<NearestPoly>> {
        let mut query = FindNearestPolyQuery::new(self.nav, center);
        self.query_polygons_with(center, half_extents, filter, &mut query)?;
        if query.nearest_ref().is_null() {
            return Ok(None);
        }
        Ok(Some(NearestPoly {
            poly_ref: query.nearest_ref(),
            point: query.nearest_point(),
            over_poly: query.is_over_poly(),
        }))
    }

    /// Finds a polygon corridor from `start_ref` to `end_ref`.
    ///
    /// When the end cannot be reached the corridor leads to the polygon
    /// nearest to `end_pos` and the status carries `PARTIAL_RESULT`. At most
    /// `max_path` polygons are returned, from the start onwards.
    pub fn find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
        max_path: usize,
    ) -> Result<(Vec<PolyRef>, Status)> {
        ensure_param!(self.nav.is_valid_poly_ref(start_ref) && self.nav.is_valid_poly_ref(end_ref));
        ensure_param!(visfinite(start_pos) && visfinite(end_pos) && max_path > 0);

        if start_ref == end_ref {
            return Ok((vec![start_ref], Status::SUCCESS));
        }

        let mut search = PathSearch::new(start_ref, end_ref, start_pos, end_pos);
        self.begin_search(&mut search)?;
        loop {
            match self.expand_best_node(&mut search, filter) {
                SearchStep::Expanded => {}
                SearchStep::Exhausted | SearchStep::ReachedEnd => break,
                SearchStep::Invalid => return Err(Status::FAILURE),
            }
        }

        let last = search.last_best_node;
        let (path, mut status) = self.path_to_node(last, max_path);
        if self.node_pool.node(last).id != end_ref {
            status |= Status::PARTIAL_RESULT;
        }
        Ok((path, status | search.status.details()))
    }

    /// Resets the main pool and opens the start node of `search`
    pub(crate) fn begin_search(&mut self, search: &mut PathSearch) -> Result<()> {
        self.node_pool.clear();
        self.open_list.clear();

        let start = self
            .node_pool
            .get_node(search.start_ref, 0)
            .ok_or(Status::FAILURE | Status::OUT_OF_NODES)?;
        let total = vdist(&search.start_pos, &search.end_pos) * self.config.heuristic_scale;
        let node = self.node_pool.node_mut(start);
        node.pos = search.start_pos;
        node.pidx = NULL_NODE;
        node.cost = 0.0;
        node.total = total;
        node.flags = NodeFlags::OPEN;
        self.open_list.push(start, total);

        search.last_best_node = start;
        search.last_best_node_cost = total;
        search.status = Status::IN_PROGRESS;
        Ok(())
    }

    /// Pops the cheapest open node and relaxes its neighbours
    pub(crate) fn expand_best_node(&mut self, search: &mut PathSearch, filter: &dyn QueryFilter) -> SearchStep {
        let nav = self.nav;
        let Some(best_idx) = self.open_list.pop() else {
            return SearchStep::Exhausted;
        };
        let best = {
            let node = self.node_pool.node_mut(best_idx);
            node.flags.remove(NodeFlags::OPEN);
            node.flags.insert(NodeFlags::CLOSED);
            node.clone()
        };
        if best.id == search.end_ref {
            search.last_best_node = best_idx;
            return SearchStep::ReachedEnd;
        }

        let Ok(best_info) = self.poly_info(best.id) else {
            return SearchStep::Invalid;
        };
        let parent = self.node_pool.parent(best_idx).map(|p| self.node_pool.node(p).clone());
        let grandpa_ref = self
            .node_pool
            .parent(best_idx)
            .and_then(|p| self.node_pool.parent(p))
            .map_or(PolyRef::NULL, |g| self.node_pool.node(g).id);
        let parent_info = match &parent {
            Some(p) => match self.poly_info(p.id) {
                Ok(info) => Some(info),
                Err(_) => return SearchStep::Invalid,
            },
            None => None,
        };
        if grandpa_ref.is_valid() && !nav.is_valid_poly_ref(grandpa_ref) {
            return SearchStep::Invalid;
        }
        let parent_ref = parent.as_ref().map_or(PolyRef::NULL, |p| p.id);

        let any_angle = search.options.contains(FindPathOptions::ANY_ANGLE);
        let try_los = any_angle
            && parent.as_ref().is_some_and(|p| {
                search.raycast_limit_sqr >= f32::MAX || vdist_sqr(&p.pos, &best.pos) < search.raycast_limit_sqr
            });

        for nei in neighbours(nav, best_info.tile, best_info.poly, parent_ref) {
            let nei_info = nei.info;
            let nei_ref = nei_info.poly_ref;
            if !filter.pass_filter(nei_ref, nei_info.tile, nei_info.poly) {
                continue;
            }

            // Crossing side keeps separate nodes for polygons entered from different tiles
            let cross_side = if nei.link.side != LINK_SIDE_INTERNAL {
                nei.link.side >> 1
            } else {
                0
            };
            let Some(nei_idx) = self.node_pool.get_node(nei_ref, cross_side) else {
                search.status |= Status::OUT_OF_NODES;
                continue;
            };

            let (nei_flags, nei_pidx) = {
                let n = self.node_pool.node(nei_idx);
                (n.flags, n.pidx)
            };
            if any_angle && nei_pidx != NULL_NODE && nei_pidx == best.pidx {
                continue;
            }
            if nei_flags.is_empty() {
                if let Some((va, vb)) = portal_points(best_info, nei_info) {
                    self.node_pool.node_mut(nei_idx).pos = vlerp(&va, &vb, 0.5);
                }
            }
            let nei_pos = self.node_pool.node(nei_idx).pos;

            let mut shortcut_cost = None;
            if try_los {
                if let Some(p) = &parent {
                    let hit = self.raycast(parent_ref, &p.pos, &nei_pos, filter, RaycastOptions::USE_COSTS, grandpa_ref, 0);
                    if let Ok((hit, _)) = hit {
                        if hit.t >= 1.0 {
                            shortcut_cost = Some(p.cost + hit.path_cost);
                        }
                    }
                }
            }
            let shortcut = shortcut_cost.is_some();
            let cost = shortcut_cost.unwrap_or_else(|| {
                best.cost + filter.get_cost(&best.pos, &nei_pos, parent_info, best_info, Some(nei_info))
            });

            let (cost, heuristic) = if nei_ref == search.end_ref {
                let end_cost = filter.get_cost(&nei_pos, &search.end_pos, Some(best_info), nei_info, None);
                (cost + end_cost, 0.0)
            } else {
                (cost, vdist(&nei_pos, &search.end_pos) * self.config.heuristic_scale)
            };
            let total = cost + heuristic;

            let node = self.node_pool.node_mut(nei_idx);
            if node.flags.intersects(NodeFlags::OPEN | NodeFlags::CLOSED) && total >= node.total {
                continue;
            }
            node.pidx = if shortcut { best.pidx } else { best_idx };
            node.id = nei_ref;
            node.flags.remove(NodeFlags::CLOSED | NodeFlags::PARENT_DETACHED);
            node.cost = cost;
            node.total = total;
            if shortcut {
                node.flags.insert(NodeFlags::PARENT_DETACHED);
            }
            if node.flags.contains(NodeFlags::OPEN) {
                self.open_list.modify(nei_idx, total);
            } else {
                node.flags.insert(NodeFlags::OPEN);
                self.open_list.push(nei_idx, total);
            }

            if heuristic < search.last_best_node_cost {
                search.last_best_node_cost = heuristic;
                search.last_best_node = nei_idx;
            }
        }
        SearchStep::Expanded
    }

    /// Walks parent links back from `end`. Keeps the first `max_path`
    /// polygons when the corridor is longer.
    pub(crate) fn path_to_node(&self, end: NodeIndex, max_path: usize) -> (Vec<PolyRef>, Status) {
        let mut path = Vec::new();
        let mut cur = Some(end);
        while let Some(idx) = cur {
            path.push(self.node_pool.node(idx).id);
            cur = self.node_pool.parent(idx);
        }
        path.reverse();

        if path.len() > max_path {
            path.truncate(max_path);
            return (path, Status::SUCCESS | Status::BUFFER_TOO_SMALL);
        }
        (path, Status::SUCCESS)
    }

    /// Polygons reachable from `start_ref` whose portals touch the circle.
    ///
    /// Entries come in order of increasing search cost. `BUFFER_TOO_SMALL` is
    /// reported if more than `max_result` polygons were reached.
    pub fn find_polys_around_circle(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &dyn QueryFilter,
        max_result: usize,
    ) -> Result<(CircleSearch, Status)> {
        ensure_param!(self.nav.is_valid_poly_ref(start_ref));
        ensure_param!(visfinite(center) && radius >= 0.0 && radius.is_finite() && max_result > 0);

        let radius_sqr = sqr(radius);
        let center = *center;
        let mut policy = RecordPolicy {
            result: CircleSearch::default(),
            max_result,
            crosses: move |va: &[f32; 3], vb: &[f32; 3]| dist_pt_seg_sqr_2d(&center, va, vb).0 <= radius_sqr,
        };
        let status = self.flood(start_ref, &center, filter, &mut policy);
        Ok((policy.result, Status::SUCCESS | status))
    }

    /// Polygons reachable from `start_ref` whose portals touch the convex shape
    pub fn find_polys_around_shape(
        &mut self,
        start_ref: PolyRef,
        verts: &[[f32; 3]],
        filter: &dyn QueryFilter,
        max_result: usize,
    ) -> Result<(CircleSearch, Status)> {
        ensure_param!(self.nav.is_valid_poly_ref(start_ref));
        ensure_param!(verts.len() >= 3 && verts.iter().all(visfinite) && max_result > 0);

        let mut center = [0.0; 3];
        for v in verts {
            for k in 0..3 {
                center[k] += v[k];
            }
        }
        let scale = 1.0 / verts.len() as f32;
        for c in &mut center {
            *c *= scale;
        }

        let mut policy = RecordPolicy {
            result: CircleSearch::default(),
            max_result,
            crosses: |va: &[f32; 3], vb: &[f32; 3]| {
                intersect_segment_poly_2d(va, vb, verts).is_some_and(|hit| hit.tmin <= 1.0 && hit.tmax >= 0.0)
            },
        };
        let status = self.flood(start_ref, &center, filter, &mut policy);
        Ok((policy.result, Status::SUCCESS | status))
    }

    /// Distance from `center` to the nearest wall within `max_radius`
    pub fn find_distance_to_wall(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        max_radius: f32,
        filter: &dyn QueryFilter,
    ) -> Result<(WallHit, Status)> {
        ensure_param!(self.nav.is_valid_poly_ref(start_ref));
        ensure_param!(visfinite(center) && max_radius >= 0.0 && max_radius.is_finite());

        let mut policy = WallPolicy {
            center: *center,
            radius_sqr: sqr(max_radius),
            hit_pos: *center,
            hit_edge: None,
        };
        let status = self.flood(start_ref, center, filter, &mut policy);

        let hit_normal = match policy.hit_edge {
            Some((vj, vi)) => {
                let to_center = vnormalize(&vsub(center, &policy.hit_pos));
                if to_center == [0.0; 3] {
                    // Center on the wall itself
                    let tangent = [vi[0] - vj[0], 0.0, vi[2] - vj[2]];
                    vnormalize(&[tangent[2], 0.0, -tangent[0]])
                } else {
                    to_center
                }
            }
            None => [0.0; 3],
        };
        let hit = WallHit {
            distance: policy.radius_sqr.sqrt(),
            hit_pos: policy.hit_pos,
            hit_normal,
        };
        Ok((hit, Status::SUCCESS | status))
    }

    /// Dijkstra flood from `start_ref` shared by the circle, shape and wall searches
    fn flood<P: FloodPolicy>(
        &mut self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        filter: &dyn QueryFilter,
        policy: &mut P,
    ) -> Status {
        let nav = self.nav;
        self.node_pool.clear();
        self.open_list.clear();

        let Some(start) = self.node_pool.get_node(start_ref, 0) else {
            return Status::OUT_OF_NODES;
        };
        {
            let node = self.node_pool.node_mut(start);
            node.pos = *start_pos;
            node.pidx = NULL_NODE;
            node.cost = 0.0;
            node.total = 0.0;
            node.flags = NodeFlags::OPEN;
        }
        self.open_list.push(start, 0.0);

        let mut status = Status::empty();
        while let Some(best_idx) = self.open_list.pop() {
            let best = {
                let node = self.node_pool.node_mut(best_idx);
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
                node.clone()
            };
            let Some((tile, poly)) = nav.get_tile_and_poly_by_ref_unchecked(best.id) else {
                continue;
            };
            let best_info = PolyInfo {
                poly_ref: best.id,
                tile,
                poly,
            };
            let parent_ref = self
                .node_pool
                .parent(best_idx)
                .map_or(PolyRef::NULL, |p| self.node_pool.node(p).id);
            let parent_info = nav
                .get_tile_and_poly_by_ref_unchecked(parent_ref)
                .filter(|_| parent_ref.is_valid())
                .map(|(tile, poly)| PolyInfo {
                    poly_ref: parent_ref,
                    tile,
                    poly,
                });

            status |= policy.visit(nav, &best, parent_ref, best_info, filter);

            for nei in neighbours(nav, tile, poly, parent_ref) {
                let nei_info = nei.info;
                if !filter.pass_filter(nei_info.poly_ref, nei_info.tile, nei_info.poly) {
                    continue;
                }
                let Some((va, vb)) = portal_points(best_info, nei_info) else {
                    continue;
                };
                if !policy.crosses(&va, &vb, nei_info.poly) {
                    continue;
                }

                let Some(nei_idx) = self.node_pool.get_node(nei_info.poly_ref, 0) else {
                    status |= Status::OUT_OF_NODES;
                    continue;
                };
                let flags = self.node_pool.node(nei_idx).flags;
                if flags.contains(NodeFlags::CLOSED) {
                    continue;
                }
                if flags.is_empty() {
                    self.node_pool.node_mut(nei_idx).pos = vlerp(&va, &vb, 0.5);
                }
                let nei_pos = self.node_pool.node(nei_idx).pos;
                let step = if P::FILTER_COST {
                    filter.get_cost(&best.pos, &nei_pos, parent_info, best_info, Some(nei_info))
                } else {
                    vdist(&best.pos, &nei_pos)
                };
                let total = best.total + step;

                let node = self.node_pool.node_mut(nei_idx);
                if node.flags.contains(NodeFlags::OPEN) && total >= node.total {
                    continue;
                }
                node.id = nei_info.poly_ref;
                node.pidx = best_idx;
                node.cost = total;
                node.total = total;
                if node.flags.contains(NodeFlags::OPEN) {
                    self.open_list.modify(nei_idx, total);
                } else {
                    node.flags.insert(NodeFlags::OPEN);
                    self.open_list.push(nei_idx, total);
                }
            }
        }
        status
    }

    /// Closest point on the polygon and whether `pos` lies over it
    pub fn closest_point_on_poly(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<([f32; 3], bool)> {
        ensure_param!(visfinite(pos));
        self.nav.closest_point_on_poly(poly_ref, pos)
    }

    /// `pos` itself when inside the polygon in xz, else the nearest point on
    /// its outline. Ignores the detail mesh.
    pub fn closest_point_on_poly_boundary(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<[f32; 3]> {
        ensure_param!(visfinite(pos));
        let (tile, poly) = self.nav.get_tile_and_poly_by_ref(poly_ref)?;
        let nv = poly.vert_count();
        let verts = tile.poly_verts(poly);

        let mut edged = [0.0; MAX_VERTS_PER_POLY];
        let mut edget = [0.0; MAX_VERTS_PER_POLY];
        if distance_pt_poly_edges_sqr(pos, &verts[..nv], &mut edged, &mut edget) {
            return Ok(*pos);
        }

        let mut imin = 0;
        for i in 1..nv {
            if edged[i] < edged[imin] {
                imin = i;
            }
        }
        Ok(vlerp(&verts[imin], &verts[(imin + 1) % nv], edget[imin]))
    }

    /// Surface height at the xz location of `pos`.
    ///
    /// Off-mesh connections interpolate between their endpoints. Fails with
    /// `INVALID_PARAM` when `pos` is outside a ground polygon.
    pub fn get_poly_height(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<f32> {
        ensure_param!(visfinite(pos));
        let (tile, poly) = self.nav.get_tile_and_poly_by_ref(poly_ref)?;
        if poly.is_off_mesh_connection() {
            let v0 = &tile.verts[poly.verts[0] as usize];
            let v1 = &tile.verts[poly.verts[1] as usize];
            let (_, t) = dist_pt_seg_sqr_2d(pos, v0, v1);
            return Ok(v0[1] + (v1[1] - v0[1]) * t);
        }
        let ip = self.nav.codec().decode_poly(poly_ref) as usize;
        self.nav
            .get_poly_height(tile, ip, pos)
            .ok_or(Status::FAILURE | Status::INVALID_PARAM)
    }

    /// Left and right end of the portal from `from` into `to`
    pub fn get_portal_points(&self, from: PolyRef, to: PolyRef) -> Result<([f32; 3], [f32; 3])> {
        let from = self.poly_info(from)?;
        let to = self.poly_info(to)?;
        portal_points(from, to).ok_or(Status::FAILURE | Status::INVALID_PARAM)
    }

    /// Midpoint of the portal from `from` into `to`
    pub fn get_edge_mid_point(&self, from: PolyRef, to: PolyRef) -> Result<[f32; 3]> {
        let (left, right) = self.get_portal_points(from, to)?;
        Ok(vlerp(&left, &right, 0.5))
    }

    /// True if the reference is live and passes the filter
    pub fn is_valid_poly_ref(&self, poly_ref: PolyRef, filter: &dyn QueryFilter) -> bool {
        self.nav
            .get_tile_and_poly_by_ref(poly_ref)
            .is_ok_and(|(tile, poly)| filter.pass_filter(poly_ref, tile, poly))
    }

    /// True if the last search closed a node of the polygon
    pub fn is_in_closed_list(&self, poly_ref: PolyRef) -> bool {
        self.node_pool
            .find_nodes(poly_ref, MAX_STATES_PER_NODE)
            .into_iter()
            .any(|i| self.node_pool.node(i).flags.contains(NodeFlags::CLOSED))
    }
}

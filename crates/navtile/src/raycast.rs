//! Surface raycasts
//!
//! The ray is cast in the xz plane along the mesh surface, polygon by
//! polygon, until it leaves the walkable area or reaches its end.

use bitflags::bitflags;

use crate::geometry::{intersect_segment_poly_2d, sqr, visfinite, vmad, vnormalize, vsub};
use crate::handle::PolyRef;
use crate::nav_mesh_query::NavMeshQuery;
use crate::query_filter::{PolyInfo, QueryFilter};
use crate::status::{ensure_param, Result, Status};
use crate::LINK_SIDE_INTERNAL;

bitflags! {
    /// Options for [`NavMeshQuery::raycast`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RaycastOptions: u8 {
        /// Accumulate filter costs along the ray into [`RaycastHit::path_cost`]
        const USE_COSTS = 0x01;
    }
}

/// Outcome of a raycast
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Hit parameter along the ray, `f32::MAX` if the ray reached its end
    pub t: f32,
    /// Normal of the wall that was hit, facing back along the ray
    pub hit_normal: [f32; 3],
    /// Edge of the last polygon where the wall was hit
    pub hit_edge_index: Option<usize>,
    /// Polygons visited by the ray
    pub path: Vec<PolyRef>,
    /// Cost of the visited path, only with [`RaycastOptions::USE_COSTS`]
    pub path_cost: f32,
}

impl RaycastHit {
    fn new() -> Self {
        Self {
            t: 0.0,
            hit_normal: [0.0; 3],
            hit_edge_index: None,
            path: Vec::new(),
            path_cost: 0.0,
        }
    }

    /// True if the ray stopped at a wall
    pub fn hit_wall(&self) -> bool {
        self.t < f32::MAX
    }

    /// Point where the ray stopped, for a ray from `start` to `end`
    pub fn hit_point(&self, start: &[f32; 3], end: &[f32; 3]) -> [f32; 3] {
        if self.hit_wall() {
            vmad(start, &vsub(end, start), self.t)
        } else {
            *end
        }
    }
}

impl<'a> NavMeshQuery<'a> {
    /// Casts a ray from `start_pos` towards `end_pos` along the surface.
    ///
    /// `start_pos` should lie inside `start_ref`. `prev_ref` is the polygon
    /// the caller came from and only feeds filter costs. At most `max_path`
    /// visited polygons are kept; dropping any reports `BUFFER_TOO_SMALL`.
    #[allow(clippy::too_many_arguments)]
    pub fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
        options: RaycastOptions,
        prev_ref: PolyRef,
        max_path: usize,
    ) -> Result<(RaycastHit, Status)> {
        ensure_param!(self.nav.is_valid_poly_ref(start_ref));
        ensure_param!(visfinite(start_pos) && visfinite(end_pos));
        ensure_param!(prev_ref.is_null() || self.nav.is_valid_poly_ref(prev_ref));

        let mut hit = RaycastHit::new();
        let mut status = Status::SUCCESS;
        let dir = vsub(end_pos, start_pos);
        let mut cur_pos = *start_pos;

        let mut cur = self.poly_info(start_ref)?;
        let mut prev = if prev_ref.is_valid() {
            Some(self.poly_info(prev_ref)?)
        } else {
            None
        };

        loop {
            let nv = cur.poly.vert_count();
            let verts = cur.tile.poly_verts(cur.poly);

            let Some(seg) = intersect_segment_poly_2d(start_pos, end_pos, &verts[..nv]) else {
                // Could not hit the polygon, keep the old t and report hit
                return Ok((hit, status));
            };
            hit.hit_edge_index = seg.seg_max;
            if seg.tmax > hit.t {
                hit.t = seg.tmax;
            }

            if hit.path.len() < max_path {
                hit.path.push(cur.poly_ref);
            } else {
                status |= Status::BUFFER_TOO_SMALL;
            }

            // Ray end is completely inside the polygon
            let Some(seg_max) = seg.seg_max else {
                hit.t = f32::MAX;
                if options.contains(RaycastOptions::USE_COSTS) {
                    hit.path_cost += filter.get_cost(&cur_pos, end_pos, prev, cur, Some(cur));
                }
                return Ok((hit, status));
            };

            let next = self.ray_exit(cur, seg_max, seg.tmax, start_pos, end_pos, filter);

            if options.contains(RaycastOptions::USE_COSTS) {
                // Exit point on the far edge, with the height taken from the edge
                let last_pos = cur_pos;
                cur_pos = vmad(start_pos, &dir, hit.t);
                let e1 = &verts[seg_max];
                let e2 = &verts[(seg_max + 1) % nv];
                let edge_dir = vsub(e2, e1);
                let diff = vsub(&cur_pos, e1);
                let s = if sqr(edge_dir[0]) > sqr(edge_dir[2]) {
                    diff[0] / edge_dir[0]
                } else {
                    diff[2] / edge_dir[2]
                };
                cur_pos[1] = e1[1] + edge_dir[1] * s;
                hit.path_cost += filter.get_cost(&last_pos, &cur_pos, prev, cur, next);
            }

            let Some(next) = next else {
                // No neighbour: a wall
                let va = &verts[seg_max];
                let vb = &verts[(seg_max + 1) % nv];
                let dx = vb[0] - va[0];
                let dz = vb[2] - va[2];
                hit.hit_normal = vnormalize(&[dz, 0.0, -dx]);
                return Ok((hit, status));
            };

            prev = Some(cur);
            cur = next;
        }
    }

    /// Neighbour the ray enters when it leaves `cur` through edge `edge` at `tmax`
    fn ray_exit(
        &self,
        cur: PolyInfo<'a>,
        edge: usize,
        tmax: f32,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
    ) -> Option<PolyInfo<'a>> {
        let nv = cur.poly.vert_count();
        for link in cur.tile.poly_links(cur.poly) {
            if link.edge as usize != edge {
                continue;
            }
            let Some((tile, poly)) = self.nav.get_tile_and_poly_by_ref_unchecked(link.reference) else {
                continue;
            };
            if poly.is_off_mesh_connection() || !filter.pass_filter(link.reference, tile, poly) {
                continue;
            }
            let next = PolyInfo {
                poly_ref: link.reference,
                tile,
                poly,
            };

            if link.side == LINK_SIDE_INTERNAL || (link.bmin == 0 && link.bmax == 255) {
                return Some(next);
            }

            // Partial portal: the crossing must fall inside the link's sub-range
            let left = &cur.tile.verts[cur.poly.verts[edge] as usize];
            let right = &cur.tile.verts[cur.poly.verts[(edge + 1) % nv] as usize];
            let axis = match link.side {
                0 | 4 => 2,
                2 | 6 => 0,
                _ => continue,
            };
            let s = 1.0 / 255.0;
            let mut lmin = left[axis] + (right[axis] - left[axis]) * (link.bmin as f32 * s);
            let mut lmax = left[axis] + (right[axis] - left[axis]) * (link.bmax as f32 * s);
            if lmin > lmax {
                std::mem::swap(&mut lmin, &mut lmax);
            }
            let x = start_pos[axis] + (end_pos[axis] - start_pos[axis]) * tmax;
            if x >= lmin && x <= lmax {
                return Some(next);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{poly_ref_at, single_tile_mesh};
    use crate::{DefaultQueryFilter, QueryConfig};

    #[test]
    fn test_hit_point() {
        let mut hit = RaycastHit::new();
        hit.t = 0.25;
        assert_eq!(hit.hit_point(&[0.0; 3], &[4.0, 0.0, 0.0]), [1.0, 0.0, 0.0]);
        hit.t = f32::MAX;
        assert!(!hit.hit_wall());
        assert_eq!(hit.hit_point(&[0.0; 3], &[4.0, 0.0, 0.0]), [4.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rejects_invalid_input() {
        let mesh = single_tile_mesh(2, 1, 1.0);
        let query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let filter = DefaultQueryFilter::default();
        let r = poly_ref_at(&mesh, 0, 0, 0);

        let err = query
            .raycast(PolyRef::NULL, &[0.5, 0.0, 0.5], &[1.5, 0.0, 0.5], &filter, RaycastOptions::empty(), PolyRef::NULL, 8)
            .unwrap_err();
        assert!(err.has_detail(Status::INVALID_PARAM));

        let err = query
            .raycast(r, &[0.5, 0.0, f32::INFINITY], &[1.5, 0.0, 0.5], &filter, RaycastOptions::empty(), PolyRef::NULL, 8)
            .unwrap_err();
        assert!(err.has_detail(Status::INVALID_PARAM));
    }

    #[test]
    fn test_path_buffer_too_small() {
        let mesh = single_tile_mesh(4, 1, 1.0);
        let query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let filter = DefaultQueryFilter::default();
        let r = poly_ref_at(&mesh, 0, 0, 0);

        let (hit, status) = query
            .raycast(r, &[0.5, 0.0, 0.5], &[3.5, 0.0, 0.5], &filter, RaycastOptions::empty(), PolyRef::NULL, 2)
            .unwrap();
        assert!(!hit.hit_wall());
        assert_eq!(hit.path.len(), 2);
        assert!(status.has_detail(Status::BUFFER_TOO_SMALL));
    }
}

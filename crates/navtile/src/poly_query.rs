//! Callbacks for batched polygon queries
//!
//! [`crate::NavMeshQuery::query_polygons_with`] hands every polygon that
//! passes the filter to a [`PolyQuery`], in batches that never span tiles.

use crate::geometry::{vlen_sqr, vsub};
use crate::handle::PolyRef;
use crate::nav_mesh::{LiveTile, NavMesh};
use crate::tile_data::Poly;

/// Receives batches of polygons touched by a query box
pub trait PolyQuery {
    /// Called for each batch. `polys[i]` is the polygon behind `refs[i]`.
    fn process(&mut self, tile: LiveTile<'_>, polys: &[&Poly], refs: &[PolyRef]);
}

/// Collects references up to a fixed capacity
#[derive(Debug, Clone, Default)]
pub struct CollectPolys {
    polys: Vec<PolyRef>,
    max_polys: usize,
    overflow: bool,
}

impl CollectPolys {
    pub fn new(max_polys: usize) -> Self {
        Self {
            polys: Vec::new(),
            max_polys,
            overflow: false,
        }
    }

    pub fn polys(&self) -> &[PolyRef] {
        &self.polys
    }

    pub fn into_polys(self) -> Vec<PolyRef> {
        self.polys
    }

    /// True if more polygons were touched than could be kept
    pub fn overflow(&self) -> bool {
        self.overflow
    }
}

impl PolyQuery for CollectPolys {
    fn process(&mut self, _tile: LiveTile<'_>, _polys: &[&Poly], refs: &[PolyRef]) {
        let remaining = self.max_polys.saturating_sub(self.polys.len());
        if remaining < refs.len() {
            self.overflow = true;
        }
        self.polys.extend_from_slice(&refs[..remaining.min(refs.len())]);
    }
}

/// Tracks the polygon nearest to a point
#[derive(Debug)]
pub struct FindNearestPolyQuery<'a> {
    mesh: &'a NavMesh,
    center: [f32; 3],
    nearest_distance_sqr: f32,
    nearest_ref: PolyRef,
    nearest_point: [f32; 3],
    over_poly: bool,
}

impl<'a> FindNearestPolyQuery<'a> {
    pub fn new(mesh: &'a NavMesh, center: &[f32; 3]) -> Self {
        Self {
            mesh,
            center: *center,
            nearest_distance_sqr: f32::MAX,
            nearest_ref: PolyRef::NULL,
            nearest_point: *center,
            over_poly: false,
        }
    }

    pub fn nearest_ref(&self) -> PolyRef {
        self.nearest_ref
    }

    pub fn nearest_point(&self) -> [f32; 3] {
        self.nearest_point
    }

    /// True if the center lies directly above or below the nearest polygon
    pub fn is_over_poly(&self) -> bool {
        self.over_poly
    }

    pub fn nearest_distance_sqr(&self) -> f32 {
        self.nearest_distance_sqr
    }
}

impl PolyQuery for FindNearestPolyQuery<'_> {
    fn process(&mut self, tile: LiveTile<'_>, _polys: &[&Poly], refs: &[PolyRef]) {
        let codec = self.mesh.codec();
        for &poly_ref in refs {
            let ip = codec.decode_poly(poly_ref) as usize;
            let (closest, over_poly) = tile.closest_point_on_poly(ip, &self.center);

            // Directly over the polygon and within climb height counts as on it
            let diff = vsub(&self.center, &closest);
            let d = if over_poly {
                let d = diff[1].abs() - tile.header.walkable_climb;
                if d > 0.0 {
                    d * d
                } else {
                    0.0
                }
            } else {
                vlen_sqr(&diff)
            };

            if d < self.nearest_distance_sqr {
                self.nearest_distance_sqr = d;
                self.nearest_ref = poly_ref;
                self.nearest_point = closest;
                self.over_poly = over_poly;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::single_tile_mesh;

    #[test]
    fn test_collect_polys_overflow() {
        let mesh = single_tile_mesh(1, 1, 1.0);
        let tile = mesh.tile(0).unwrap();
        let mut query = CollectPolys::new(3);

        let refs: Vec<PolyRef> = (1..=2).map(PolyRef::from_raw).collect();
        query.process(tile, &[], &refs);
        assert_eq!(query.polys(), &refs[..]);
        assert!(!query.overflow());

        let more: Vec<PolyRef> = (3..=6).map(PolyRef::from_raw).collect();
        query.process(tile, &[], &more);
        assert_eq!(query.polys().len(), 3);
        assert!(query.overflow());
    }

    #[test]
    fn test_find_nearest_prefers_poly_under_point() {
        let mesh = single_tile_mesh(2, 1, 2.0);
        let tile = mesh.tile(0).unwrap();
        let base = mesh.get_poly_ref_base(tile);
        let codec = mesh.codec();
        let refs = [
            codec.encode(codec.decode_salt(base), tile.index as u32, 0),
            codec.encode(codec.decode_salt(base), tile.index as u32, 1),
        ];

        let mut query = FindNearestPolyQuery::new(&mesh, &[3.0, 0.5, 1.0]);
        query.process(tile, &[], &refs);
        assert_eq!(query.nearest_ref(), refs[1]);
        assert!(query.is_over_poly());
        // Within climb height: distance collapses to zero
        assert_eq!(query.nearest_distance_sqr(), 0.0);
        assert_eq!(query.nearest_point(), [3.0, 0.0, 1.0]);
    }
}

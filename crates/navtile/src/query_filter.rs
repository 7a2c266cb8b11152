//! Polygon filtering and traversal costs

use crate::geometry::vdist;
use crate::handle::PolyRef;
use crate::nav_mesh::LiveTile;
use crate::tile_data::Poly;
use crate::{PolyFlags, MAX_AREAS};

/// A polygon together with the tile that owns it
#[derive(Debug, Clone, Copy)]
pub struct PolyInfo<'a> {
    pub poly_ref: PolyRef,
    pub tile: LiveTile<'a>,
    pub poly: &'a Poly,
}

/// Decides which polygons a query may visit and what moving across them costs
pub trait QueryFilter {
    /// Returns true if the polygon can be visited
    fn pass_filter(&self, poly_ref: PolyRef, tile: LiveTile<'_>, poly: &Poly) -> bool;

    /// Cost of moving from `pa` to `pb` across `cur`.
    ///
    /// `prev` is the polygon the move came from and `next` the polygon it
    /// continues into, when known.
    fn get_cost(
        &self,
        pa: &[f32; 3],
        pb: &[f32; 3],
        prev: Option<PolyInfo<'_>>,
        cur: PolyInfo<'_>,
        next: Option<PolyInfo<'_>>,
    ) -> f32;
}

impl<T: QueryFilter + ?Sized> QueryFilter for &T {
    fn pass_filter(&self, poly_ref: PolyRef, tile: LiveTile<'_>, poly: &Poly) -> bool {
        (**self).pass_filter(poly_ref, tile, poly)
    }

    fn get_cost(
        &self,
        pa: &[f32; 3],
        pb: &[f32; 3],
        prev: Option<PolyInfo<'_>>,
        cur: PolyInfo<'_>,
        next: Option<PolyInfo<'_>>,
    ) -> f32 {
        (**self).get_cost(pa, pb, prev, cur, next)
    }
}

impl<T: QueryFilter + ?Sized> QueryFilter for Box<T> {
    fn pass_filter(&self, poly_ref: PolyRef, tile: LiveTile<'_>, poly: &Poly) -> bool {
        (**self).pass_filter(poly_ref, tile, poly)
    }

    fn get_cost(
        &self,
        pa: &[f32; 3],
        pb: &[f32; 3],
        prev: Option<PolyInfo<'_>>,
        cur: PolyInfo<'_>,
        next: Option<PolyInfo<'_>>,
    ) -> f32 {
        (**self).get_cost(pa, pb, prev, cur, next)
    }
}

/// Flag based filter with a cost multiplier per area id
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct DefaultQueryFilter {
    area_cost: Vec<f32>,
    include_flags: PolyFlags,
    exclude_flags: PolyFlags,
}

impl Default for DefaultQueryFilter {
    fn default() -> Self {
        Self {
            area_cost: vec![1.0; MAX_AREAS],
            include_flags: PolyFlags::ALL,
            exclude_flags: PolyFlags::empty(),
        }
    }
}

impl DefaultQueryFilter {
    pub fn new(include_flags: PolyFlags, exclude_flags: PolyFlags) -> Self {
        Self {
            include_flags,
            exclude_flags,
            ..Self::default()
        }
    }

    /// Cost multiplier of the area; out of range ids cost 1
    pub fn area_cost(&self, area: usize) -> f32 {
        self.area_cost.get(area).copied().unwrap_or(1.0)
    }

    /// Sets the cost multiplier of an area. Ids outside `0..64` are ignored.
    pub fn set_area_cost(&mut self, area: usize, cost: f32) {
        if let Some(c) = self.area_cost.get_mut(area) {
            *c = cost;
        }
    }

    pub fn include_flags(&self) -> PolyFlags {
        self.include_flags
    }

    pub fn set_include_flags(&mut self, flags: PolyFlags) {
        self.include_flags = flags;
    }

    pub fn exclude_flags(&self) -> PolyFlags {
        self.exclude_flags
    }

    pub fn set_exclude_flags(&mut self, flags: PolyFlags) {
        self.exclude_flags = flags;
    }
}

impl QueryFilter for DefaultQueryFilter {
    fn pass_filter(&self, _poly_ref: PolyRef, _tile: LiveTile<'_>, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags) && !poly.flags.intersects(self.exclude_flags)
    }

    fn get_cost(
        &self,
        pa: &[f32; 3],
        pb: &[f32; 3],
        _prev: Option<PolyInfo<'_>>,
        cur: PolyInfo<'_>,
        _next: Option<PolyInfo<'_>>,
    ) -> f32 {
        vdist(pa, pb) * self.area_cost(cur.poly.area as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::single_tile_mesh;

    #[test]
    fn test_flag_filtering() {
        let mesh = single_tile_mesh(2, 1, 1.0);
        let tile = mesh.tile(0).unwrap();
        let r = mesh.get_poly_ref_base(tile);
        let mut poly = tile.polys[0].clone();

        let filter = DefaultQueryFilter::default();
        assert!(filter.pass_filter(r, tile, &poly));

        let filter = DefaultQueryFilter::new(PolyFlags::WALK, PolyFlags::DISABLED);
        assert!(filter.pass_filter(r, tile, &poly));
        poly.flags |= PolyFlags::DISABLED;
        assert!(!filter.pass_filter(r, tile, &poly));

        poly.flags = PolyFlags::SWIM;
        assert!(!filter.pass_filter(r, tile, &poly));
    }

    #[test]
    fn test_area_cost() {
        let mesh = single_tile_mesh(2, 1, 1.0);
        let tile = mesh.tile(0).unwrap();
        let mut poly = tile.polys[0].clone();
        poly.area = 3;

        let mut filter = DefaultQueryFilter::default();
        filter.set_area_cost(3, 2.5);
        filter.set_area_cost(200, 9.0);
        assert_eq!(filter.area_cost(3), 2.5);
        assert_eq!(filter.area_cost(200), 1.0);

        let cur = PolyInfo {
            poly_ref: mesh.get_poly_ref_base(tile),
            tile,
            poly: &poly,
        };
        let cost = filter.get_cost(&[0.0, 0.0, 0.0], &[2.0, 0.0, 0.0], None, cur, None);
        assert!((cost - 5.0).abs() < 1e-6);

        // Reference impl forwards
        let by_ref = &filter;
        assert!((by_ref.get_cost(&[0.0; 3], &[1.0, 0.0, 0.0], None, cur, None) - 2.5).abs() < 1e-6);
    }
}

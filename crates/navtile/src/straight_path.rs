//! String pulling over a polygon corridor
//!
//! Turns a corridor from [`NavMeshQuery::find_path`] into the list of corner
//! points an agent walks through, using the simple stupid funnel algorithm.

use bitflags::bitflags;

use crate::geometry::{dist_pt_seg_sqr_2d, intersect_seg_seg_2d, sqr, tri_area_2d, vequal, visfinite, vlerp};
use crate::handle::PolyRef;
use crate::nav_mesh_query::{portal_points, NavMeshQuery};
use crate::status::{ensure_param, Result, Status};
use crate::PolyType;

bitflags! {
    /// Describes a point of a straight path
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct StraightPathFlags: u8 {
        /// The point is the start position
        const START = 0x01;
        /// The point is the end position
        const END = 0x02;
        /// The point is the start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

bitflags! {
    /// Extra points to emit along the straight path
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StraightPathOptions: u8 {
        /// A point wherever the path crosses into a different area
        const AREA_CROSSINGS = 0x01;
        /// A point at every polygon edge crossing
        const ALL_CROSSINGS = 0x02;
    }
}

/// One corner of a straight path
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct StraightPathPoint {
    pub pos: [f32; 3],
    pub flags: StraightPathFlags,
    /// Polygon the path enters at this point, null at the end
    pub poly_ref: PolyRef,
}

/// Output buffer of the funnel with its capacity
struct StraightPath {
    points: Vec<StraightPathPoint>,
    max_points: usize,
}

impl StraightPath {
    /// Appends a point, or updates the last one if it sits at the same spot.
    /// Returns the final status once the path is complete or full.
    fn append(&mut self, pos: &[f32; 3], flags: StraightPathFlags, poly_ref: PolyRef) -> Option<Status> {
        if let Some(last) = self.points.last_mut() {
            if vequal(&last.pos, pos) {
                last.flags = flags;
                last.poly_ref = poly_ref;
                return None;
            }
        }

        self.points.push(StraightPathPoint {
            pos: *pos,
            flags,
            poly_ref,
        });
        if flags.contains(StraightPathFlags::END) {
            return Some(Status::SUCCESS);
        }
        if self.points.len() >= self.max_points {
            return Some(Status::SUCCESS | Status::BUFFER_TOO_SMALL);
        }
        None
    }

    fn full_status(&self) -> Status {
        if self.points.len() >= self.max_points {
            Status::BUFFER_TOO_SMALL
        } else {
            Status::empty()
        }
    }
}

impl NavMeshQuery<'_> {
    /// Corner points of the corridor `path` from `start_pos` to `end_pos`.
    ///
    /// The start and end are clamped onto the first and last polygon. If the
    /// corridor breaks off, the path ends at the last reachable polygon with
    /// `PARTIAL_RESULT`.
    pub fn find_straight_path(
        &self,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        path: &[PolyRef],
        max_straight_path: usize,
        options: StraightPathOptions,
    ) -> Result<(Vec<StraightPathPoint>, Status)> {
        ensure_param!(visfinite(start_pos) && visfinite(end_pos));
        ensure_param!(!path.is_empty() && path[0].is_valid() && max_straight_path > 0);

        let mut out = StraightPath {
            points: Vec::new(),
            max_points: max_straight_path,
        };
        let crossings = options.intersects(StraightPathOptions::AREA_CROSSINGS | StraightPathOptions::ALL_CROSSINGS);

        let closest_start = self
            .closest_point_on_poly_boundary(path[0], start_pos)
            .map_err(|_| Status::FAILURE | Status::INVALID_PARAM)?;
        let mut closest_end = self
            .closest_point_on_poly_boundary(path[path.len() - 1], end_pos)
            .map_err(|_| Status::FAILURE | Status::INVALID_PARAM)?;

        if let Some(status) = out.append(&closest_start, StraightPathFlags::START, path[0]) {
            return Ok((out.points, status));
        }

        if path.len() > 1 {
            let mut apex = closest_start;
            let mut portal_left = apex;
            let mut portal_right = apex;
            let mut apex_index = 0;
            let mut left_index = 0;
            let mut right_index = 0;
            let mut left_type = PolyType::Ground;
            let mut right_type = PolyType::Ground;
            let mut left_ref = path[0];
            let mut right_ref = path[0];

            let mut i = 0;
            while i < path.len() {
                let (left, right, to_type) = if i + 1 < path.len() {
                    let portal = self.poly_info(path[i]).ok().zip(self.poly_info(path[i + 1]).ok());
                    let Some((left, right, to_type)) =
                        portal.and_then(|(from, to)| portal_points(from, to).map(|(l, r)| (l, r, to.poly.poly_type)))
                    else {
                        // path[i + 1] is gone: end at path[i] with what we have
                        closest_end = self
                            .closest_point_on_poly_boundary(path[i], end_pos)
                            .map_err(|_| Status::FAILURE | Status::INVALID_PARAM)?;
                        if crossings {
                            self.append_portals(&mut out, apex_index, i, &closest_end, path, options);
                        }
                        out.append(&closest_end, StraightPathFlags::empty(), path[i]);
                        let status = Status::SUCCESS | Status::PARTIAL_RESULT | out.full_status();
                        return Ok((out.points, status));
                    };

                    // Starting right on the first portal: skip it
                    if i == 0 && dist_pt_seg_sqr_2d(&apex, &left, &right).0 < sqr(0.001) {
                        i += 1;
                        continue;
                    }
                    (left, right, to_type)
                } else {
                    (closest_end, closest_end, PolyType::Ground)
                };
                let next_ref = path.get(i + 1).copied().unwrap_or(PolyRef::NULL);

                // Right side
                if tri_area_2d(&apex, &portal_right, &right) <= 0.0 {
                    if vequal(&apex, &portal_right) || tri_area_2d(&apex, &portal_left, &right) > 0.0 {
                        portal_right = right;
                        right_ref = next_ref;
                        right_type = to_type;
                        right_index = i;
                    } else {
                        // Right crossed over left: left becomes the new apex
                        if crossings {
                            if let Some(status) = self.append_portals(&mut out, apex_index, left_index, &portal_left, path, options) {
                                return Ok((out.points, status));
                            }
                        }
                        apex = portal_left;
                        apex_index = left_index;
                        let flags = corner_flags(left_ref, left_type);
                        if let Some(status) = out.append(&apex, flags, left_ref) {
                            return Ok((out.points, status));
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left side
                if tri_area_2d(&apex, &portal_left, &left) >= 0.0 {
                    if vequal(&apex, &portal_left) || tri_area_2d(&apex, &portal_right, &left) < 0.0 {
                        portal_left = left;
                        left_ref = next_ref;
                        left_type = to_type;
                        left_index = i;
                    } else {
                        // Left crossed over right: right becomes the new apex
                        if crossings {
                            if let Some(status) = self.append_portals(&mut out, apex_index, right_index, &portal_right, path, options) {
                                return Ok((out.points, status));
                            }
                        }
                        apex = portal_right;
                        apex_index = right_index;
                        let flags = corner_flags(right_ref, right_type);
                        if let Some(status) = out.append(&apex, flags, right_ref) {
                            return Ok((out.points, status));
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }
                i += 1;
            }

            if crossings {
                if let Some(status) = self.append_portals(&mut out, apex_index, path.len() - 1, &closest_end, path, options) {
                    return Ok((out.points, status));
                }
            }
        }

        let status = out
            .append(&closest_end, StraightPathFlags::END, PolyRef::NULL)
            .unwrap_or(Status::SUCCESS);
        Ok((out.points, status))
    }

    /// Adds the crossings of the corridor edges between `start_index` and
    /// `end_index` with the segment from the last point to `end_pos`
    fn append_portals(
        &self,
        out: &mut StraightPath,
        start_index: usize,
        end_index: usize,
        end_pos: &[f32; 3],
        path: &[PolyRef],
        options: StraightPathOptions,
    ) -> Option<Status> {
        let start_pos = out.points.last()?.pos;
        for i in start_index..end_index {
            let (Ok(from), Ok(to)) = (self.poly_info(path[i]), self.poly_info(path[i + 1])) else {
                return Some(Status::FAILURE | Status::INVALID_PARAM);
            };
            let Some((left, right)) = portal_points(from, to) else {
                break;
            };
            if options.contains(StraightPathOptions::AREA_CROSSINGS) && from.poly.area == to.poly.area {
                continue;
            }
            if let Some((_, t)) = intersect_seg_seg_2d(&start_pos, end_pos, &left, &right) {
                let pt = vlerp(&left, &right, t);
                if let Some(status) = out.append(&pt, StraightPathFlags::empty(), path[i + 1]) {
                    return Some(status);
                }
            }
        }
        None
    }
}

/// Flags of a funnel corner entering `poly_ref`
fn corner_flags(poly_ref: PolyRef, poly_type: PolyType) -> StraightPathFlags {
    if poly_ref.is_null() {
        StraightPathFlags::END
    } else if poly_type == PolyType::OffMeshConnection {
        StraightPathFlags::OFFMESH_CONNECTION
    } else {
        StraightPathFlags::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{poly_ref_at, single_tile_mesh};
    use crate::QueryConfig;

    #[test]
    fn test_single_poly_path() {
        let mesh = single_tile_mesh(2, 2, 1.0);
        let query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let r = poly_ref_at(&mesh, 0, 0, 0);

        let (points, status) = query
            .find_straight_path(&[0.2, 0.0, 0.2], &[0.8, 0.0, 0.7], &[r], 8, StraightPathOptions::empty())
            .unwrap();
        assert_eq!(status, Status::SUCCESS);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].flags, StraightPathFlags::START);
        assert_eq!(points[0].poly_ref, r);
        assert_eq!(points[1].flags, StraightPathFlags::END);
        assert_eq!(points[1].poly_ref, PolyRef::NULL);
        assert_eq!(points[1].pos, [0.8, 0.0, 0.7]);
    }

    #[test]
    fn test_end_is_clamped_onto_last_poly() {
        let mesh = single_tile_mesh(2, 1, 1.0);
        let query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let a = poly_ref_at(&mesh, 0, 0, 0);
        let b = poly_ref_at(&mesh, 0, 0, 1);

        let (points, _) = query
            .find_straight_path(&[0.5, 0.0, 0.5], &[5.0, 0.0, 0.5], &[a, b], 8, StraightPathOptions::empty())
            .unwrap();
        let last = points.last().unwrap();
        assert!((last.pos[0] - 2.0).abs() < 1e-5);
        assert!(last.flags.contains(StraightPathFlags::END));
    }

    #[test]
    fn test_buffer_of_one() {
        let mesh = single_tile_mesh(2, 1, 1.0);
        let query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let a = poly_ref_at(&mesh, 0, 0, 0);
        let b = poly_ref_at(&mesh, 0, 0, 1);

        let (points, status) = query
            .find_straight_path(&[0.5, 0.0, 0.5], &[1.5, 0.0, 0.5], &[a, b], 1, StraightPathOptions::empty())
            .unwrap();
        assert_eq!(points.len(), 1);
        assert!(status.has_detail(Status::BUFFER_TOO_SMALL));
    }

    #[test]
    fn test_all_crossings() {
        let mesh = single_tile_mesh(3, 1, 1.0);
        let query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let path: Vec<PolyRef> = (0..3).map(|i| poly_ref_at(&mesh, 0, 0, i)).collect();

        let (points, status) = query
            .find_straight_path(&[0.5, 0.0, 0.5], &[2.5, 0.0, 0.5], &path, 8, StraightPathOptions::ALL_CROSSINGS)
            .unwrap();
        assert!(status.is_success());
        assert_eq!(points.len(), 4);
        assert!((points[1].pos[0] - 1.0).abs() < 1e-5);
        assert_eq!(points[1].poly_ref, path[1]);
        assert!((points[2].pos[0] - 2.0).abs() < 1e-5);

        // Same area everywhere: no area crossings
        let (points, _) = query
            .find_straight_path(&[0.5, 0.0, 0.5], &[2.5, 0.0, 0.5], &path, 8, StraightPathOptions::AREA_CROSSINGS)
            .unwrap();
        assert_eq!(points.len(), 2);
    }
}

//! Geometry primitives shared by the mesh and the query engine
//!
//! All 2D helpers work on the xz-plane and ignore the y component. Polygons
//! are slices of `[f32; 3]` vertices wound so that interior points lie on the
//! positive side of every edge, e.g. (0,0), (0,1), (1,1), (1,0) in (x, z).

use glam::Vec3;

#[inline]
fn v3(a: &[f32; 3]) -> Vec3 {
    Vec3::from_array(*a)
}

/// Returns the square of the value
#[inline]
pub fn sqr(a: f32) -> f32 {
    a * a
}

/// Performs a vector addition (v1 + v2)
#[inline]
pub fn vadd(v1: &[f32; 3], v2: &[f32; 3]) -> [f32; 3] {
    [v1[0] + v2[0], v1[1] + v2[1], v1[2] + v2[2]]
}

/// Performs a vector subtraction (v1 - v2)
#[inline]
pub fn vsub(v1: &[f32; 3], v2: &[f32; 3]) -> [f32; 3] {
    [v1[0] - v2[0], v1[1] - v2[1], v1[2] - v2[2]]
}

/// Performs a scaled vector addition (v1 + (v2 * s))
#[inline]
pub fn vmad(v1: &[f32; 3], v2: &[f32; 3], s: f32) -> [f32; 3] {
    [v1[0] + v2[0] * s, v1[1] + v2[1] * s, v1[2] + v2[2] * s]
}

/// Linear interpolation between two vectors (v1 toward v2)
#[inline]
pub fn vlerp(v1: &[f32; 3], v2: &[f32; 3], t: f32) -> [f32; 3] {
    v3(v1).lerp(v3(v2), t).to_array()
}

/// Squared length of the vector
#[inline]
pub fn vlen_sqr(v: &[f32; 3]) -> f32 {
    v3(v).length_squared()
}

/// Distance between two points
#[inline]
pub fn vdist(v1: &[f32; 3], v2: &[f32; 3]) -> f32 {
    v3(v1).distance(v3(v2))
}

/// Squared distance between two points
#[inline]
pub fn vdist_sqr(v1: &[f32; 3], v2: &[f32; 3]) -> f32 {
    v3(v1).distance_squared(v3(v2))
}

/// Normalizes the vector. A zero vector is returned unchanged.
#[inline]
pub fn vnormalize(v: &[f32; 3]) -> [f32; 3] {
    v3(v).normalize_or_zero().to_array()
}

/// 'Sloppy' colocation check of the specified points
#[inline]
pub fn vequal(p0: &[f32; 3], p1: &[f32; 3]) -> bool {
    const THR: f32 = 1.0 / 16384.0;
    vdist_sqr(p0, p1) < THR * THR
}

/// Checks that all components are finite
#[inline]
pub fn visfinite(v: &[f32; 3]) -> bool {
    v.iter().all(|c| c.is_finite())
}

/// Dot product on the xz-plane
#[inline]
pub fn vdot_2d(u: &[f32; 3], v: &[f32; 3]) -> f32 {
    u[0] * v[0] + u[2] * v[2]
}

/// xz-plane perp product (uz*vx - ux*vz)
#[inline]
pub fn vperp_2d(u: &[f32; 3], v: &[f32; 3]) -> f32 {
    u[2] * v[0] - u[0] * v[2]
}

/// Signed xz-plane area of the triangle ABC (twice the area). Positive when
/// the triangle turns clockwise seen from above.
#[inline]
pub fn tri_area_2d(a: &[f32; 3], b: &[f32; 3], c: &[f32; 3]) -> f32 {
    let abx = b[0] - a[0];
    let abz = b[2] - a[2];
    let acx = c[0] - a[0];
    let acz = c[2] - a[2];
    acx * abz - abx * acz
}

/// Determines if two axis-aligned bounding boxes overlap
#[inline]
pub fn overlap_bounds(amin: &[f32; 3], amax: &[f32; 3], bmin: &[f32; 3], bmax: &[f32; 3]) -> bool {
    !(amin[0] > bmax[0]
        || amax[0] < bmin[0]
        || amin[1] > bmax[1]
        || amax[1] < bmin[1]
        || amin[2] > bmax[2]
        || amax[2] < bmin[2])
}

/// Determines if two quantized axis-aligned bounding boxes overlap
#[inline]
pub fn overlap_quant_bounds(amin: &[u16; 3], amax: &[u16; 3], bmin: &[u16; 3], bmax: &[u16; 3]) -> bool {
    !(amin[0] > bmax[0]
        || amax[0] < bmin[0]
        || amin[1] > bmax[1]
        || amax[1] < bmin[1]
        || amin[2] > bmax[2]
        || amax[2] < bmin[2])
}

/// Closest point on triangle ABC to point P
pub fn closest_pt_point_triangle(p: &[f32; 3], a: &[f32; 3], b: &[f32; 3], c: &[f32; 3]) -> [f32; 3] {
    let (p, a, b, c) = (v3(p), v3(a), v3(b), v3(c));
    let ab = b - a;
    let ac = c - a;

    // Vertex region outside A
    let ap = p - a;
    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a.to_array();
    }

    // Vertex region outside B
    let bp = p - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b.to_array();
    }

    // Edge region of AB
    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return (a + ab * v).to_array();
    }

    // Vertex region outside C
    let cp = p - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c.to_array();
    }

    // Edge region of AC
    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return (a + ac * w).to_array();
    }

    // Edge region of BC
    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return (b + (c - b) * w).to_array();
    }

    // Inside face region
    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    (a + ab * v + ac * w).to_array()
}

/// Height of triangle ABC at the xz location of P, if P projects inside it
pub fn closest_height_point_triangle(
    p: &[f32; 3],
    a: &[f32; 3],
    b: &[f32; 3],
    c: &[f32; 3],
) -> Option<f32> {
    const EPS: f32 = 1e-6;

    let v0 = vsub(c, a);
    let v1 = vsub(b, a);
    let v2 = vsub(p, a);

    // Barycentric coordinates scaled by denom
    let mut denom = v0[0] * v1[2] - v0[2] * v1[0];
    if denom.abs() < EPS {
        return None;
    }

    let mut u = v1[2] * v2[0] - v1[0] * v2[2];
    let mut v = v0[0] * v2[2] - v0[2] * v2[0];

    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }

    if u >= 0.0 && v >= 0.0 && (u + v) <= denom {
        Some(a[1] + (v0[1] * u + v1[1] * v) / denom)
    } else {
        None
    }
}

/// Result of clipping a segment against a convex polygon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPolyHit {
    /// Parametric entry distance along the segment
    pub tmin: f32,
    /// Parametric exit distance along the segment
    pub tmax: f32,
    /// Edge the segment enters through, if it starts outside
    pub seg_min: Option<usize>,
    /// Edge the segment leaves through, if it ends outside
    pub seg_max: Option<usize>,
}

/// Clips segment p0-p1 against a convex polygon on the xz-plane.
///
/// Edge `j` runs from `verts[j]` to `verts[j + 1]`. Returns `None` when the
/// segment misses the polygon.
pub fn intersect_segment_poly_2d(p0: &[f32; 3], p1: &[f32; 3], verts: &[[f32; 3]]) -> Option<SegmentPolyHit> {
    const EPS: f32 = 0.000_000_01;

    let mut hit = SegmentPolyHit {
        tmin: 0.0,
        tmax: 1.0,
        seg_min: None,
        seg_max: None,
    };

    let nverts = verts.len();
    let dir = vsub(p1, p0);

    let mut j = nverts.wrapping_sub(1);
    for i in 0..nverts {
        let edge = vsub(&verts[i], &verts[j]);
        let diff = vsub(p0, &verts[j]);
        let n = vperp_2d(&edge, &diff);
        let d = vperp_2d(&dir, &edge);
        if d.abs() < EPS {
            // S is nearly parallel to this edge
            if n < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = n / d;
        if d < 0.0 {
            // Segment is entering across this edge
            if t > hit.tmin {
                hit.tmin = t;
                hit.seg_min = Some(j);
                if hit.tmin > hit.tmax {
                    return None;
                }
            }
        } else if t < hit.tmax {
            // Segment is leaving across this edge
            hit.tmax = t;
            hit.seg_max = Some(j);
            if hit.tmax < hit.tmin {
                return None;
            }
        }
        j = i;
    }

    Some(hit)
}

/// Intersects segment ap-aq with segment bp-bq on the xz-plane.
///
/// Returns the parameters `(s, t)` of the intersection along each segment
/// treated as infinite lines, or `None` when they are parallel.
pub fn intersect_seg_seg_2d(ap: &[f32; 3], aq: &[f32; 3], bp: &[f32; 3], bq: &[f32; 3]) -> Option<(f32, f32)> {
    let u = vsub(aq, ap);
    let v = vsub(bq, bp);
    let w = vsub(ap, bp);
    let d = vperp_2d(&u, &v);
    if d.abs() < 1e-6 {
        return None;
    }
    let s = vperp_2d(&v, &w) / d;
    let t = vperp_2d(&u, &w) / d;
    Some((s, t))
}

/// Determines if the point is inside the polygon on the xz-plane
pub fn point_in_polygon(pt: &[f32; 3], verts: &[[f32; 3]]) -> bool {
    let nverts = verts.len();
    let mut inside = false;
    let mut j = nverts.wrapping_sub(1);
    for i in 0..nverts {
        let vi = &verts[i];
        let vj = &verts[j];
        if ((vi[2] > pt[2]) != (vj[2] > pt[2]))
            && (pt[0] < (vj[0] - vi[0]) * (pt[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Squared xz distance from a point to segment p-q, plus the parameter of the
/// closest point along the segment
pub fn dist_pt_seg_sqr_2d(pt: &[f32; 3], p: &[f32; 3], q: &[f32; 3]) -> (f32, f32) {
    let pqx = q[0] - p[0];
    let pqz = q[2] - p[2];
    let mut dx = pt[0] - p[0];
    let mut dz = pt[2] - p[2];
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    dx = p[0] + t * pqx - pt[0];
    dz = p[2] + t * pqz - pt[2];
    (dx * dx + dz * dz, t)
}

/// Squared distance from the point to every polygon edge.
///
/// Returns whether the point is inside the polygon; `ed[j]`/`et[j]` receive the
/// distance and segment parameter for edge `j`.
pub fn distance_pt_poly_edges_sqr(pt: &[f32; 3], verts: &[[f32; 3]], ed: &mut [f32], et: &mut [f32]) -> bool {
    let nverts = verts.len();
    let mut inside = false;
    let mut j = nverts.wrapping_sub(1);
    for i in 0..nverts {
        let vi = &verts[i];
        let vj = &verts[j];
        if ((vi[2] > pt[2]) != (vj[2] > pt[2]))
            && (pt[0] < (vj[0] - vi[0]) * (pt[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            inside = !inside;
        }
        let (d, t) = dist_pt_seg_sqr_2d(pt, vj, vi);
        ed[j] = d;
        et[j] = t;
        j = i;
    }
    inside
}

/// Centroid of the polygon vertices
pub fn calc_poly_center(verts: &[[f32; 3]]) -> [f32; 3] {
    let sum = verts.iter().fold(Vec3::ZERO, |acc, v| acc + v3(v));
    (sum / verts.len().max(1) as f32).to_array()
}

fn project_poly(axis: &[f32; 3], poly: &[[f32; 3]]) -> (f32, f32) {
    poly.iter().fold((f32::MAX, f32::MIN), |(rmin, rmax), v| {
        let d = vdot_2d(axis, v);
        (rmin.min(d), rmax.max(d))
    })
}

#[inline]
fn overlap_range(amin: f32, amax: f32, bmin: f32, bmax: f32, eps: f32) -> bool {
    !((amin + eps) > bmax || (amax - eps) < bmin)
}

/// Determines if two convex polygons overlap on the xz-plane
pub fn overlap_poly_poly_2d(polya: &[[f32; 3]], polyb: &[[f32; 3]]) -> bool {
    const EPS: f32 = 1e-4;

    for (poly, other) in [(polya, polyb), (polyb, polya)] {
        let n = poly.len();
        let mut j = n.wrapping_sub(1);
        for i in 0..n {
            let va = &poly[j];
            let vb = &poly[i];
            let axis = [vb[2] - va[2], 0.0, -(vb[0] - va[0])];
            let (amin, amax) = project_poly(&axis, poly);
            let (bmin, bmax) = project_poly(&axis, other);
            if !overlap_range(amin, amax, bmin, bmax, EPS) {
                // Found separating axis
                return false;
            }
            j = i;
        }
    }
    true
}

/// Picks a point inside a convex polygon from two uniform samples `s` and `t`
pub fn random_point_in_convex_poly(pts: &[[f32; 3]], s: f32, t: f32) -> [f32; 3] {
    let npts = pts.len();
    if npts < 3 {
        return calc_poly_center(pts);
    }

    // Triangle fan areas
    let areas: Vec<f32> = (2..npts)
        .map(|i| tri_area_2d(&pts[0], &pts[i - 1], &pts[i]).abs().max(0.001))
        .collect();
    let area_sum: f32 = areas.iter().sum();

    let thr = s * area_sum;
    let mut acc = 0.0;
    let mut u = 1.0;
    let mut tri = npts - 1;
    for (k, area) in areas.iter().enumerate() {
        let i = k + 2;
        if thr >= acc && thr < acc + area {
            u = (thr - acc) / area;
            tri = i;
            break;
        }
        acc += area;
    }

    let v = t.sqrt();
    let a = 1.0 - v;
    let b = (1.0 - u) * v;
    let c = u * v;
    let pa = &pts[0];
    let pb = &pts[tri - 1];
    let pc = &pts[tri];

    [
        a * pa[0] + b * pb[0] + c * pc[0],
        a * pa[1] + b * pb[1] + c * pc[1],
        a * pa[2] + b * pb[2] + c * pc[2],
    ]
}

/// Returns the next power of 2
#[inline]
pub fn next_pow2(v: u32) -> u32 {
    if v == 0 {
        0
    } else {
        v.next_power_of_two()
    }
}

/// The tile side facing `side`
#[inline]
pub fn opposite_tile(side: u8) -> u8 {
    (side + 4) & 0x7
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: [[f32; 3]; 4] = [
        [0.0, 0.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 0.0, 1.0],
        [1.0, 0.0, 0.0],
    ];

    #[test]
    fn test_vector_operations() {
        let v1 = [1.0, 2.0, 3.0];
        let v2 = [4.0, 5.0, 6.0];
        assert_eq!(vadd(&v1, &v2), [5.0, 7.0, 9.0]);
        assert_eq!(vsub(&v2, &v1), [3.0, 3.0, 3.0]);
        assert_eq!(vmad(&v1, &v2, 0.5), [3.0, 4.5, 6.0]);
        assert_eq!(vlerp(&v1, &v2, 0.5), [2.5, 3.5, 4.5]);
    }

    #[test]
    fn test_distance() {
        let v1 = [0.0, 0.0, 0.0];
        let v2 = [3.0, 4.0, 0.0];

        assert_eq!(vdist(&v1, &v2), 5.0);
        assert_eq!(vdist_sqr(&v1, &v2), 25.0);
    }

    #[test]
    fn test_closest_point_triangle() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 0.0, 0.0];
        let c = [0.0, 0.0, 1.0];

        let inside = closest_pt_point_triangle(&[0.25, 1.0, 0.25], &a, &b, &c);
        assert!((inside[0] - 0.25).abs() < 1e-5);
        assert!(inside[1].abs() < 1e-5);
        assert!((inside[2] - 0.25).abs() < 1e-5);

        let corner = closest_pt_point_triangle(&[-1.0, 0.0, -1.0], &a, &b, &c);
        assert_eq!(corner, a);
    }

    #[test]
    fn test_closest_height_point_triangle() {
        let a = [0.0, 1.0, 0.0];
        let b = [0.0, 1.0, 1.0];
        let c = [1.0, 1.0, 0.0];
        assert_eq!(closest_height_point_triangle(&[0.2, 5.0, 0.2], &a, &b, &c), Some(1.0));
        assert_eq!(closest_height_point_triangle(&[2.0, 5.0, 2.0], &a, &b, &c), None);
    }

    #[test]
    fn test_point_in_polygon() {
        assert!(point_in_polygon(&[0.5, 0.0, 0.5], &SQUARE));
        assert!(!point_in_polygon(&[1.5, 0.0, 0.5], &SQUARE));
        assert!(!point_in_polygon(&[0.5, 0.0, -0.1], &SQUARE));
    }

    #[test]
    fn test_intersect_segment_poly_inside() {
        let hit = intersect_segment_poly_2d(&[0.2, 0.0, 0.2], &[0.8, 0.0, 0.8], &SQUARE).unwrap();
        assert_eq!(hit.seg_max, None);
        assert_eq!(hit.tmax, 1.0);
    }

    #[test]
    fn test_intersect_segment_poly_exit_edge() {
        // Leaves through x = 1, which is edge 2 (verts[2] -> verts[3])
        let hit = intersect_segment_poly_2d(&[0.5, 0.0, 0.5], &[1.5, 0.0, 0.5], &SQUARE).unwrap();
        assert_eq!(hit.seg_max, Some(2));
        assert!((hit.tmax - 0.5).abs() < 1e-5);

        assert!(intersect_segment_poly_2d(&[2.0, 0.0, 2.0], &[3.0, 0.0, 3.0], &SQUARE).is_none());
    }

    #[test]
    fn test_intersect_seg_seg() {
        let (s, t) =
            intersect_seg_seg_2d(&[0.0, 0.0, 0.0], &[2.0, 0.0, 0.0], &[1.0, 0.0, -1.0], &[1.0, 0.0, 1.0])
                .unwrap();
        assert!((s - 0.5).abs() < 1e-5);
        assert!((t - 0.5).abs() < 1e-5);
        assert!(
            intersect_seg_seg_2d(&[0.0, 0.0, 0.0], &[1.0, 0.0, 0.0], &[0.0, 0.0, 1.0], &[1.0, 0.0, 1.0])
                .is_none()
        );
    }

    #[test]
    fn test_distance_pt_poly_edges() {
        let mut ed = [0.0; 4];
        let mut et = [0.0; 4];
        let inside = distance_pt_poly_edges_sqr(&[0.5, 0.0, 0.25], &SQUARE, &mut ed, &mut et);
        assert!(inside);
        // Edge 3 runs along z = 0
        assert!((ed[3] - 0.0625).abs() < 1e-5);
    }

    #[test]
    fn test_overlap_poly_poly() {
        let shifted: Vec<[f32; 3]> = SQUARE.iter().map(|v| [v[0] + 0.5, v[1], v[2]]).collect();
        assert!(overlap_poly_poly_2d(&SQUARE, &shifted));
        let far: Vec<[f32; 3]> = SQUARE.iter().map(|v| [v[0] + 3.0, v[1], v[2]]).collect();
        assert!(!overlap_poly_poly_2d(&SQUARE, &far));
    }

    #[test]
    fn test_random_point_in_convex_poly() {
        for &(s, t) in &[(0.0, 0.0), (0.3, 0.7), (0.99, 0.99), (0.5, 0.5)] {
            let p = random_point_in_convex_poly(&SQUARE, s, t);
            assert!((-1e-4..=1.0 + 1e-4).contains(&p[0]));
            assert!((-1e-4..=1.0 + 1e-4).contains(&p[2]));
        }
    }

    #[test]
    fn test_pow2_and_opposite_tile() {
        assert_eq!(next_pow2(0), 0);
        assert_eq!(next_pow2(3), 4);
        assert_eq!(next_pow2(17), 32);
        assert_eq!(opposite_tile(0), 4);
        assert_eq!(opposite_tile(6), 2);
    }
}

//! Flattened bounding volume tree over the polygons of a tile
//!
//! The tree is stored depth first. A leaf holds a polygon index in `i`; an
//! internal node holds the negated number of nodes in its subtree, which is
//! the offset to skip when the node's bounds miss the query box.

use crate::geometry::overlap_quant_bounds;
use crate::tile_data::{BvNode, TileData};

#[derive(Debug, Clone, Copy)]
struct BvItem {
    bmin: [u16; 3],
    bmax: [u16; 3],
    poly: i32,
}

/// Builds a BV tree for the ground polygons of the tile, quantized with the
/// header's `bv_quant_factor` relative to `bmin`.
pub fn build_bv_tree(data: &TileData) -> Vec<BvNode> {
    let header = &data.header;
    let qf = header.bv_quant_factor;
    let quant = |v: f32, base: f32| ((v - base) * qf).clamp(0.0, f32::from(u16::MAX));

    let mut items: Vec<BvItem> = data
        .polys
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.is_off_mesh_connection())
        .map(|(i, poly)| {
            let verts = data.poly_verts(poly);
            let mut bmin = [f32::MAX; 3];
            let mut bmax = [f32::MIN; 3];
            for v in &verts[..poly.vert_count()] {
                for k in 0..3 {
                    bmin[k] = bmin[k].min(v[k]);
                    bmax[k] = bmax[k].max(v[k]);
                }
            }
            let mut item = BvItem {
                bmin: [0; 3],
                bmax: [0; 3],
                poly: i as i32,
            };
            for k in 0..3 {
                item.bmin[k] = quant(bmin[k], header.bmin[k]).floor() as u16;
                item.bmax[k] = quant(bmax[k], header.bmin[k]).ceil() as u16;
            }
            item
        })
        .collect();

    let mut nodes = Vec::with_capacity(items.len() * 2);
    if !items.is_empty() {
        subdivide(&mut items, &mut nodes);
    }
    nodes
}

fn subdivide(items: &mut [BvItem], nodes: &mut Vec<BvNode>) {
    let icur = nodes.len();
    nodes.push(BvNode::default());

    if let [item] = items {
        nodes[icur] = BvNode {
            bmin: item.bmin,
            bmax: item.bmax,
            i: item.poly,
        };
        return;
    }

    let mut bmin = [u16::MAX; 3];
    let mut bmax = [0u16; 3];
    for it in items.iter() {
        for k in 0..3 {
            bmin[k] = bmin[k].min(it.bmin[k]);
            bmax[k] = bmax[k].max(it.bmax[k]);
        }
    }

    // Split along the longest axis
    let extent = |k: usize| bmax[k] - bmin[k];
    let axis = if extent(0) >= extent(1) && extent(0) >= extent(2) {
        0
    } else if extent(1) >= extent(2) {
        1
    } else {
        2
    };
    items.sort_by_key(|it| it.bmin[axis]);

    let split = items.len() / 2;
    let (left, right) = items.split_at_mut(split);
    subdivide(left, nodes);
    subdivide(right, nodes);

    let escape = (nodes.len() - icur) as i32;
    nodes[icur] = BvNode {
        bmin,
        bmax,
        i: -escape,
    };
}

/// Walks the tree and calls `emit` with every polygon index whose bounds
/// overlap the quantized query box.
pub fn query_bv_tree(nodes: &[BvNode], qmin: &[u16; 3], qmax: &[u16; 3], mut emit: impl FnMut(usize)) {
    let mut i = 0;
    while i < nodes.len() {
        let node = &nodes[i];
        let overlap = overlap_quant_bounds(qmin, qmax, &node.bmin, &node.bmax);
        let is_leaf = node.i >= 0;

        if is_leaf && overlap {
            emit(node.i as usize);
        }

        if overlap || is_leaf {
            i += 1;
        } else {
            i += (-node.i) as usize;
        }
    }
}

/// Quantizes a world-space query box into tile BV space.
///
/// The box is clamped to the tile bounds first. Min values are rounded down
/// to even and max values up to odd so that touching boxes still overlap.
pub fn quantize_query_box(data: &TileData, qmin: &[f32; 3], qmax: &[f32; 3]) -> ([u16; 3], [u16; 3]) {
    let tbmin = &data.header.bmin;
    let tbmax = &data.header.bmax;
    let qf = data.header.bv_quant_factor;

    let mut bmin = [0u16; 3];
    let mut bmax = [0u16; 3];
    for k in 0..3 {
        let minv = qmin[k].clamp(tbmin[k], tbmax[k]) - tbmin[k];
        let maxv = qmax[k].clamp(tbmin[k], tbmax[k]) - tbmin[k];
        bmin[k] = ((qf * minv) as u16) & 0xfffe;
        bmax[k] = ((qf * maxv + 1.0) as u16) | 1;
    }
    (bmin, bmax)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::grid_tile;

    #[test]
    fn test_tree_shape() {
        let tile = grid_tile(0, 0, 4, 4, 1.0, false);
        let nodes = build_bv_tree(&tile);
        // n leaves produce 2n - 1 nodes
        assert_eq!(nodes.len(), tile.polys.len() * 2 - 1);
        assert_eq!(-nodes[0].i as usize, nodes.len());
        let leaves = nodes.iter().filter(|n| n.i >= 0).count();
        assert_eq!(leaves, tile.polys.len());
    }

    #[test]
    fn test_query_whole_tile_finds_everything() {
        let tile = grid_tile(0, 0, 3, 3, 1.0, false);
        let nodes = build_bv_tree(&tile);
        let (qmin, qmax) = quantize_query_box(&tile, &[-10.0, -10.0, -10.0], &[10.0, 10.0, 10.0]);
        let mut found = Vec::new();
        query_bv_tree(&nodes, &qmin, &qmax, |i| found.push(i));
        found.sort_unstable();
        assert_eq!(found, (0..tile.polys.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_query_corner() {
        let tile = grid_tile(0, 0, 4, 4, 1.0, false);
        let nodes = build_bv_tree(&tile);
        let (qmin, qmax) = quantize_query_box(&tile, &[0.1, -1.0, 0.1], &[0.2, 1.0, 0.2]);
        let mut found = Vec::new();
        query_bv_tree(&nodes, &qmin, &qmax, |i| found.push(i));
        // Conservative: the corner cell must be among the hits
        assert!(found.contains(&0));
        assert!(found.len() < tile.polys.len());
    }

    #[test]
    fn test_quantize_rounding() {
        let tile = grid_tile(0, 0, 2, 2, 1.0, false);
        let (qmin, qmax) = quantize_query_box(&tile, &[0.5, 0.0, 0.5], &[0.5, 0.0, 0.5]);
        for k in 0..3 {
            assert_eq!(qmin[k] & 1, 0);
            assert_eq!(qmax[k] & 1, 1);
            assert!(qmin[k] <= qmax[k]);
        }
    }
}

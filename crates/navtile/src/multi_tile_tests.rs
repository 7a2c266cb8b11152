//! Tests for meshes made of several tiles
//!
//! Tiles are stitched together through portal links when they are added and
//! unstitched when they are removed. Queries should cross tile borders as if
//! the mesh were one piece.

#[cfg(test)]
mod tests {
    use crate::test_mesh_helpers::{poly_ref_at, tiled_mesh};
    use crate::{
        DefaultQueryFilter, NavMesh, NavMeshQuery, PolyRef, QueryConfig, StraightPathFlags, StraightPathOptions,
        TileFlags, LINK_SIDE_INTERNAL,
    };

    /// Every (from, link) pair of the mesh
    fn all_links(mesh: &NavMesh) -> Vec<(PolyRef, crate::Link)> {
        let mut out = Vec::new();
        for tile in mesh.tiles() {
            for (i, poly) in tile.polys.iter().enumerate() {
                let from = mesh.poly_ref(tile.index, i);
                out.extend(tile.poly_links(poly).map(|l| (from, *l)));
            }
        }
        out
    }

    fn portal_links(mesh: &NavMesh) -> Vec<(PolyRef, crate::Link)> {
        all_links(mesh)
            .into_iter()
            .filter(|(_, l)| l.side != LINK_SIDE_INTERNAL)
            .collect()
    }

    #[test]
    fn test_link_targets_stay_in_tile_range() {
        let mesh = tiled_mesh(2, 2, 2, 1.0, false);
        let codec = mesh.codec();
        for (_, link) in all_links(&mesh) {
            assert!((codec.decode_tile(link.reference) as usize) < mesh.max_tiles());
            assert!(mesh.is_valid_poly_ref(link.reference));
        }
    }

    #[test]
    fn test_portal_links_are_symmetric() {
        let mesh = tiled_mesh(2, 2, 2, 1.0, false);
        let portals = portal_links(&mesh);
        // Two shared tile borders per axis, two cells each, linked both ways
        assert_eq!(portals.len(), 16);

        for (from, link) in &portals {
            let (tile, poly) = mesh.get_tile_and_poly_by_ref(link.reference).unwrap();
            let back = tile
                .poly_links(poly)
                .find(|l| l.reference == *from)
                .expect("portal without a link back");
            assert_eq!(back.side, (link.side + 4) & 7);
        }
    }

    #[test]
    fn test_connecting_polys_across_border() {
        let mesh = tiled_mesh(2, 1, 2, 1.0, false);
        let east = mesh.get_tile_at(1, 0, 0).unwrap();

        // The whole shared border, seen from the west tile, meets the -x portals of the east tile
        let found = mesh.find_connecting_polys(&[2.0, 0.0, 0.0], &[2.0, 0.0, 2.0], east, 4, 8);
        assert_eq!(
            found,
            vec![
                (poly_ref_at(&mesh, 1, 0, 0), [0.0, 1.0]),
                (poly_ref_at(&mesh, 1, 0, 2), [1.0, 2.0]),
            ]
        );

        let capped = mesh.find_connecting_polys(&[2.0, 0.0, 0.0], &[2.0, 0.0, 2.0], east, 4, 1);
        assert_eq!(capped, found[..1].to_vec());

        // The far side of the east tile is not on this border
        let far = mesh.find_connecting_polys(&[4.0, 0.0, 0.0], &[4.0, 0.0, 2.0], east, 4, 8);
        assert!(far.is_empty());
    }

    #[test]
    fn test_remove_and_readd_restitches() {
        let mut mesh = tiled_mesh(2, 1, 2, 1.0, false);
        assert_eq!(portal_links(&mesh).len(), 4);

        let tile_ref = mesh.get_tile_ref_at(1, 0, 0).unwrap();
        let data = mesh.remove_tile(tile_ref).unwrap().expect("mesh does not own the data");
        assert!(portal_links(&mesh).is_empty());
        assert!(all_links(&mesh).iter().all(|(_, l)| mesh.is_valid_poly_ref(l.reference)));

        let readded = mesh.add_tile(data, TileFlags::empty(), tile_ref).unwrap();
        assert_eq!(readded, tile_ref);
        assert_eq!(portal_links(&mesh).len(), 4);
    }

    #[test]
    fn test_path_across_tile_border() {
        let mesh = tiled_mesh(2, 1, 2, 1.0, false);
        let mut query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let filter = DefaultQueryFilter::default();

        let start = poly_ref_at(&mesh, 0, 0, 0);
        let end = poly_ref_at(&mesh, 1, 0, 1);
        let start_pos = [0.5, 0.0, 0.5];
        let end_pos = [3.5, 0.0, 0.5];

        let (path, status) = query.find_path(start, end, &start_pos, &end_pos, &filter, 16).unwrap();
        assert_eq!(status, crate::Status::SUCCESS);
        assert_eq!(
            path,
            vec![start, poly_ref_at(&mesh, 0, 0, 1), poly_ref_at(&mesh, 1, 0, 0), end]
        );

        let (points, _) = query
            .find_straight_path(&start_pos, &end_pos, &path, 8, StraightPathOptions::empty())
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].flags, StraightPathFlags::START);
        assert_eq!(points[1].flags, StraightPathFlags::END);
        assert_eq!(points[1].pos, end_pos);
    }

    #[test]
    fn test_single_poly_tiles_cross_at_shared_edge() {
        let mesh = tiled_mesh(2, 1, 1, 1.0, false);
        let mut query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let filter = DefaultQueryFilter::default();

        let start = poly_ref_at(&mesh, 0, 0, 0);
        let end = poly_ref_at(&mesh, 1, 0, 0);
        let start_pos = [0.5, 0.0, 0.5];
        let end_pos = [1.5, 0.0, 0.5];

        let (path, status) = query.find_path(start, end, &start_pos, &end_pos, &filter, 4).unwrap();
        assert_eq!(status, crate::Status::SUCCESS);
        assert_eq!(path, vec![start, end]);

        let (points, status) = query
            .find_straight_path(&start_pos, &end_pos, &path, 8, StraightPathOptions::ALL_CROSSINGS)
            .unwrap();
        assert_eq!(status, crate::Status::SUCCESS);
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].flags, StraightPathFlags::START);
        assert_eq!(points[0].pos, start_pos);

        let portal = &points[1];
        assert!(portal.flags.is_empty());
        assert_eq!(portal.poly_ref, end);
        assert!((portal.pos[0] - 1.0).abs() < 1e-5);
        assert!((portal.pos[2] - 0.5).abs() < 1e-3);

        assert_eq!(points[2].flags, StraightPathFlags::END);
        assert_eq!(points[2].pos, end_pos);
    }

    #[test]
    fn test_nearest_poly_in_neighbour_tile() {
        let mesh = tiled_mesh(2, 1, 2, 1.0, true);
        let query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let filter = DefaultQueryFilter::default();

        let nearest = query
            .find_nearest_poly(&[2.5, 0.2, 0.5], &[0.4, 1.0, 0.4], &filter)
            .unwrap()
            .unwrap();
        assert_eq!(nearest.poly_ref, poly_ref_at(&mesh, 1, 0, 0));
        assert!(nearest.over_poly);
    }

    #[test]
    fn test_stale_handles_rejected_after_removal() {
        let mut mesh = tiled_mesh(2, 1, 2, 1.0, false);
        let start = poly_ref_at(&mesh, 0, 0, 0);
        let end = poly_ref_at(&mesh, 1, 0, 1);
        let tile_ref = mesh.get_tile_ref_at(1, 0, 0).unwrap();
        mesh.remove_tile(tile_ref).unwrap();

        let mut query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let filter = DefaultQueryFilter::default();
        let err = query
            .find_path(start, end, &[0.5, 0.0, 0.5], &[3.5, 0.0, 0.5], &filter, 16)
            .unwrap_err();
        assert!(err.has_detail(crate::Status::INVALID_PARAM));

        let err = query
            .init_sliced_find_path(
                start,
                end,
                &[0.5, 0.0, 0.5],
                &[3.5, 0.0, 0.5],
                filter,
                crate::FindPathOptions::empty(),
            )
            .unwrap_err();
        assert!(err.is_failure());
        assert!(query.sliced_find_path_status().is_none());
    }
}

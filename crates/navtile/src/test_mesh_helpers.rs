//! In-memory tile payloads for tests
//!
//! Tiles are flat grids of square cells at y = 0. Cell (cx, cz) of a tile is
//! polygon `cz * nx + cx`; its edges are, in order, the -x, +z, +x and -z
//! sides. Edges on the tile border are marked as portals so neighbouring
//! tiles stitch together.

use crate::bv_tree::build_bv_tree;
use crate::tile_data::{OffMeshConnection, Poly, PolyDetail, TileData, TileHeader, OFFMESH_CON_BIDIR};
use crate::{
    NavMesh, NavMeshParams, PolyFlags, PolyRef, PolyType, TileFlags, EXT_LINK, LINK_SIDE_INTERNAL,
};

/// Mesh parameters for square tiles at the origin
pub fn grid_params(max_tiles: u32, tile_size: f32) -> NavMeshParams {
    NavMeshParams {
        origin: [0.0; 3],
        tile_width: tile_size,
        tile_height: tile_size,
        max_tiles,
        max_polys_per_tile: 256,
        ..Default::default()
    }
}

/// A tile at grid cell (tx, ty) made of nx * nz square cells of size `cell`
pub fn grid_tile(tx: i32, ty: i32, nx: usize, nz: usize, cell: f32, with_bv: bool) -> TileData {
    let x0 = tx as f32 * nx as f32 * cell;
    let z0 = ty as f32 * nz as f32 * cell;

    let mut verts = Vec::with_capacity((nx + 1) * (nz + 1));
    for cz in 0..=nz {
        for cx in 0..=nx {
            verts.push([x0 + cx as f32 * cell, 0.0, z0 + cz as f32 * cell]);
        }
    }
    let vi = |cx: usize, cz: usize| (cz * (nx + 1) + cx) as u16;
    let pi = |cx: usize, cz: usize| (cz * nx + cx) as u16;

    let mut polys = Vec::with_capacity(nx * nz);
    for cz in 0..nz {
        for cx in 0..nx {
            let mut poly = Poly::new(
                &[vi(cx, cz), vi(cx, cz + 1), vi(cx + 1, cz + 1), vi(cx + 1, cz)],
                PolyFlags::WALK,
                0,
            );
            poly.neis = [
                if cx > 0 { pi(cx - 1, cz) + 1 } else { EXT_LINK | 4 },
                if cz + 1 < nz { pi(cx, cz + 1) + 1 } else { EXT_LINK | 2 },
                if cx + 1 < nx { pi(cx + 1, cz) + 1 } else { EXT_LINK },
                if cz > 0 { pi(cx, cz - 1) + 1 } else { EXT_LINK | 6 },
                0,
                0,
            ];
            polys.push(poly);
        }
    }

    let mut header = TileHeader::new(tx, ty, 0);
    header.bmin = [x0, -1.0, z0];
    header.bmax = [x0 + nx as f32 * cell, 1.0, z0 + nz as f32 * cell];
    header.off_mesh_base = polys.len();
    header.bv_quant_factor = 16.0;

    let mut tile = TileData {
        header,
        polys,
        verts,
        detail_meshes: Vec::new(),
        detail_verts: Vec::new(),
        detail_tris: Vec::new(),
        bv_tree: Vec::new(),
        off_mesh_cons: Vec::new(),
    };
    if with_bv {
        tile.bv_tree = build_bv_tree(&tile);
    }
    tile
}

/// Marks a cell as solid by turning the shared edges of its neighbours into walls
pub fn block_cell(tile: &mut TileData, poly_index: usize) {
    let target = poly_index as u16 + 1;
    for poly in &mut tile.polys {
        for nei in &mut poly.neis {
            if *nei == target {
                *nei = 0;
            }
        }
    }
    tile.polys[poly_index].neis = [0; crate::MAX_VERTS_PER_POLY];
    tile.polys[poly_index].flags = PolyFlags::DISABLED;
}

/// Gives every polygon a detail mesh: a fan with one raised center vertex
pub fn add_raised_detail(tile: &mut TileData, height: f32) {
    tile.detail_meshes.clear();
    tile.detail_verts.clear();
    tile.detail_tris.clear();
    for i in 0..tile.polys.len() {
        let poly = &tile.polys[i];
        let nv = poly.vert_count();
        let verts = tile.poly_verts(poly);
        let mut center = crate::geometry::calc_poly_center(&verts[..nv]);
        center[1] = height;

        let vert_base = tile.detail_verts.len() as u32;
        let tri_base = tile.detail_tris.len() as u32;
        tile.detail_verts.push(center);
        for k in 0..nv {
            tile.detail_tris
                .push([k as u8, ((k + 1) % nv) as u8, nv as u8, 0]);
        }
        tile.detail_meshes.push(PolyDetail {
            vert_base,
            tri_base,
            vert_count: 1,
            tri_count: nv as u8,
        });
    }
}

/// Appends an off-mesh connection from `start` to `end`
pub fn add_off_mesh_connection(tile: &mut TileData, start: [f32; 3], end: [f32; 3], radius: f32, bidir: bool) -> usize {
    let v = tile.verts.len() as u16;
    tile.verts.push(start);
    tile.verts.push(end);

    let poly_index = tile.polys.len();
    let mut poly = Poly::new(&[v, v + 1], PolyFlags::WALK | PolyFlags::JUMP, 0);
    poly.poly_type = PolyType::OffMeshConnection;
    tile.polys.push(poly);

    tile.off_mesh_cons.push(OffMeshConnection {
        pos: [start[0], start[1], start[2], end[0], end[1], end[2]],
        radius,
        poly: poly_index as u16,
        flags: if bidir { OFFMESH_CON_BIDIR } else { 0 },
        side: LINK_SIDE_INTERNAL,
        user_id: 0,
    });
    poly_index
}

/// One tile of nx * nz cells filling the whole mesh
pub fn single_tile_mesh(nx: usize, nz: usize, cell: f32) -> NavMesh {
    mesh_with_tile(grid_tile(0, 0, nx, nz, cell, false), nx as f32 * cell, nz as f32 * cell)
}

/// A mesh holding just `tile`, with the given tile dimensions
pub fn mesh_with_tile(tile: TileData, tile_width: f32, tile_height: f32) -> NavMesh {
    let params = NavMeshParams {
        tile_width,
        tile_height,
        ..grid_params(1, tile_width)
    };
    let mut mesh = NavMesh::new(params).unwrap();
    mesh.add_tile(tile, TileFlags::empty(), PolyRef::NULL).unwrap();
    mesh
}

/// tiles_x * tiles_y tiles of cells * cells square cells each
pub fn tiled_mesh(tiles_x: i32, tiles_y: i32, cells: usize, cell: f32, with_bv: bool) -> NavMesh {
    let mut mesh = NavMesh::new(grid_params((tiles_x * tiles_y) as u32 + 2, cells as f32 * cell)).unwrap();
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            mesh.add_tile(
                grid_tile(tx, ty, cells, cells, cell, with_bv),
                TileFlags::empty(),
                PolyRef::NULL,
            )
            .unwrap();
        }
    }
    mesh
}

/// Reference of polygon `poly` in the tile at (tx, ty), layer 0
pub fn poly_ref_at(mesh: &NavMesh, tx: i32, ty: i32, poly: u32) -> PolyRef {
    let tile_ref = mesh.get_tile_ref_at(tx, ty, 0).unwrap();
    let codec = mesh.codec();
    codec.encode(codec.decode_salt(tile_ref), codec.decode_tile(tile_ref), poly)
}

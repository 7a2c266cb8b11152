//! Sliced A* pathfinding
//!
//! The search runs in bounded steps so a caller can spread it over several
//! frames. The state lives in one record on the [`NavMeshQuery`]; the node
//! pool is shared with [`NavMeshQuery::find_path`], so starting any other
//! search on the same query invalidates a sliced search in flight.

use bitflags::bitflags;

use crate::geometry::{sqr, visfinite};
use crate::handle::PolyRef;
use crate::nav_mesh_query::{NavMeshQuery, PathSearch, SearchStep};
use crate::node_pool::{NodeFlags, NodeIndex, NULL_NODE};
use crate::query_filter::QueryFilter;
use crate::raycast::RaycastOptions;
use crate::status::{ensure_param, Result, Status};

/// Any-angle shortcuts are only tried within this many agent radii
const RAYCAST_LIMIT_PROPORTIONS: f32 = 50.0;

bitflags! {
    /// Options for [`NavMeshQuery::init_sliced_find_path`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FindPathOptions: u8 {
        /// Shortcut the corridor with raycasts towards earlier polygons
        const ANY_ANGLE = 0x02;
    }
}

/// State of a sliced search between calls
pub(crate) struct SlicedQuery<'a> {
    pub search: PathSearch,
    pub filter: Box<dyn QueryFilter + 'a>,
}

impl<'a> NavMeshQuery<'a> {
    /// Starts a sliced search. The filter is kept until the search is
    /// finalized or cancelled.
    ///
    /// Returns `SUCCESS` right away when start and end are the same polygon,
    /// `IN_PROGRESS` otherwise.
    pub fn init_sliced_find_path<F: QueryFilter + 'a>(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: F,
        options: FindPathOptions,
    ) -> Result<Status> {
        self.sliced = None;
        ensure_param!(self.nav.is_valid_poly_ref(start_ref) && self.nav.is_valid_poly_ref(end_ref));
        ensure_param!(visfinite(start_pos) && visfinite(end_pos));

        let mut search = PathSearch::new(start_ref, end_ref, start_pos, end_pos);
        search.options = options;
        if options.contains(FindPathOptions::ANY_ANGLE) {
            // The limit is not sensitive, the start tile's agent is good enough
            if let Some(tile) = self.nav.get_tile_by_ref(start_ref) {
                search.raycast_limit_sqr = sqr(tile.header.walkable_radius * RAYCAST_LIMIT_PROPORTIONS);
            }
        }

        if start_ref == end_ref {
            search.status = Status::SUCCESS;
        } else {
            self.begin_search(&mut search)?;
        }
        let status = search.status;
        log::debug!("sliced path search {start_ref} -> {end_ref} started: {status}");

        self.sliced = Some(SlicedQuery {
            search,
            filter: Box::new(filter),
        });
        Ok(status)
    }

    /// Runs up to `max_iter` expansions. Returns the search status and the
    /// number of iterations done.
    ///
    /// Fails if no search was started, or if a polygon the search depends
    /// on disappeared since the last call.
    pub fn update_sliced_find_path(&mut self, max_iter: usize) -> Result<(Status, usize)> {
        let Some(mut sliced) = self.sliced.take() else {
            return Err(Status::FAILURE);
        };
        let result = self.advance_sliced(&mut sliced, max_iter);
        if let Err(status) = result {
            log::debug!("sliced path search failed: {status}");
        }
        self.sliced = Some(sliced);
        result
    }

    fn advance_sliced(&mut self, sliced: &mut SlicedQuery<'a>, max_iter: usize) -> Result<(Status, usize)> {
        let search = &mut sliced.search;
        if search.status.is_failure() {
            return Err(search.status);
        }
        if !search.status.is_in_progress() {
            return Ok((search.status, 0));
        }
        if !self.nav.is_valid_poly_ref(search.start_ref) || !self.nav.is_valid_poly_ref(search.end_ref) {
            search.status = Status::FAILURE;
            return Err(Status::FAILURE);
        }

        let mut iter = 0;
        while iter < max_iter {
            match self.expand_best_node(search, sliced.filter.as_ref()) {
                SearchStep::Exhausted => break,
                SearchStep::Expanded => iter += 1,
                SearchStep::ReachedEnd => {
                    search.status = Status::success_with(search.status);
                    return Ok((search.status, iter + 1));
                }
                SearchStep::Invalid => {
                    search.status = Status::FAILURE;
                    return Err(Status::FAILURE);
                }
            }
        }

        if self.open_list.is_empty() {
            search.status = Status::success_with(search.status);
        }
        Ok((search.status, iter))
    }

    /// Status of the sliced search in flight, if any
    pub fn sliced_find_path_status(&self) -> Option<Status> {
        self.sliced.as_ref().map(|s| s.search.status)
    }

    /// Drops the sliced search in flight
    pub fn cancel_sliced_find_path(&mut self) {
        if self.sliced.take().is_some() {
            log::debug!("sliced path search cancelled");
        }
    }

    /// Ends the sliced search and returns the corridor to the end polygon,
    /// or to the polygon nearest to it with `PARTIAL_RESULT`.
    pub fn finalize_sliced_find_path(&mut self, max_path: usize) -> Result<(Vec<PolyRef>, Status)> {
        ensure_param!(max_path > 0);
        let Some(sliced) = self.sliced.take() else {
            return Err(Status::FAILURE);
        };
        let search = &sliced.search;
        if search.status.is_failure() {
            return Err(Status::FAILURE);
        }
        if search.start_ref == search.end_ref {
            return Ok((vec![search.start_ref], Status::success_with(search.status)));
        }

        let mut details = search.status.details();
        let last = search.last_best_node;
        if self.node_pool.node(last).id != search.end_ref {
            details |= Status::PARTIAL_RESULT;
        }
        let (path, store_details) = self.store_reversed_path(last, max_path, sliced.filter.as_ref());
        Ok((path, Status::success_with(details | store_details)))
    }

    /// Ends the sliced search with a corridor towards the furthest polygon of
    /// `existing` that the search visited.
    ///
    /// Useful when replanning: the new corridor can be spliced onto the old
    /// one. Falls back to the polygon nearest to the end, with
    /// `PARTIAL_RESULT`, if none of `existing` was visited.
    pub fn finalize_sliced_find_path_partial(
        &mut self,
        existing: &[PolyRef],
        max_path: usize,
    ) -> Result<(Vec<PolyRef>, Status)> {
        ensure_param!(!existing.is_empty() && max_path > 0);
        let Some(sliced) = self.sliced.take() else {
            return Err(Status::FAILURE);
        };
        let search = &sliced.search;
        if search.status.is_failure() {
            return Err(Status::FAILURE);
        }
        if search.start_ref == search.end_ref {
            return Ok((vec![search.start_ref], Status::success_with(search.status)));
        }

        let mut details = search.status.details();
        let visited = existing
            .iter()
            .rev()
            .find_map(|&r| self.node_pool.find_nodes(r, 1).first().copied());
        let node = match visited {
            Some(node) => node,
            None => {
                details |= Status::PARTIAL_RESULT;
                search.last_best_node
            }
        };
        let (path, store_details) = self.store_reversed_path(node, max_path, sliced.filter.as_ref());
        Ok((path, Status::success_with(details | store_details)))
    }

    /// Turns the parent chain ending at `end` into a corridor from the start.
    /// Links marked detached were shortcuts and are filled in with raycasts.
    fn store_reversed_path(&mut self, end: NodeIndex, max_path: usize, filter: &dyn QueryFilter) -> (Vec<PolyRef>, Status) {
        // Reverse the chain, moving each detached flag onto the node it now points from
        let mut prev = NULL_NODE;
        let mut cur = end;
        let mut prev_ray = NodeFlags::empty();
        loop {
            let node = self.node_pool.node_mut(cur);
            let next = node.pidx;
            node.pidx = prev;
            let next_ray = node.flags & NodeFlags::PARENT_DETACHED;
            node.flags = (node.flags - NodeFlags::PARENT_DETACHED) | prev_ray;
            prev_ray = next_ray;
            prev = cur;
            if next == NULL_NODE {
                break;
            }
            cur = next;
        }

        let mut path = Vec::new();
        let mut details = Status::empty();
        let mut cur = prev;
        loop {
            let node = self.node_pool.node(cur).clone();
            let next = node.pidx;
            if node.flags.contains(NodeFlags::PARENT_DETACHED) && next != NULL_NODE {
                let (next_id, next_pos) = {
                    let n = self.node_pool.node(next);
                    (n.id, n.pos)
                };
                let remaining = max_path.saturating_sub(path.len());
                match self.raycast(node.id, &node.pos, &next_pos, filter, RaycastOptions::empty(), PolyRef::NULL, remaining) {
                    Ok((hit, status)) => {
                        path.extend_from_slice(&hit.path);
                        // The ray ends on the boundary of the next polygon
                        if path.last() == Some(&next_id) {
                            path.pop();
                        }
                        details |= status.details();
                    }
                    Err(status) => details |= status.details(),
                }
            } else if path.len() < max_path {
                path.push(node.id);
                if path.len() >= max_path && next != NULL_NODE {
                    details |= Status::BUFFER_TOO_SMALL;
                }
            } else {
                details |= Status::BUFFER_TOO_SMALL;
            }

            if !details.is_empty() || next == NULL_NODE {
                break;
            }
            cur = next;
        }
        (path, details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{poly_ref_at, single_tile_mesh};
    use crate::{DefaultQueryFilter, QueryConfig};

    #[test]
    fn test_update_without_init_fails() {
        let mesh = single_tile_mesh(2, 2, 1.0);
        let mut query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        assert!(query.update_sliced_find_path(10).unwrap_err().is_failure());
        assert!(query.finalize_sliced_find_path(10).is_err());
        assert!(query.sliced_find_path_status().is_none());
    }

    #[test]
    fn test_same_poly_completes_at_init() {
        let mesh = single_tile_mesh(2, 2, 1.0);
        let mut query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let r = poly_ref_at(&mesh, 0, 0, 0);
        let status = query
            .init_sliced_find_path(r, r, &[0.2, 0.0, 0.2], &[0.8, 0.0, 0.8], DefaultQueryFilter::default(), FindPathOptions::empty())
            .unwrap();
        assert!(status.is_success());

        let (path, status) = query.finalize_sliced_find_path(4).unwrap();
        assert_eq!(path, vec![r]);
        assert!(status.is_success());
        assert!(query.sliced_find_path_status().is_none());
    }

    #[test]
    fn test_init_rejects_invalid_refs() {
        let mesh = single_tile_mesh(2, 2, 1.0);
        let mut query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let r = poly_ref_at(&mesh, 0, 0, 0);
        let err = query
            .init_sliced_find_path(r, PolyRef::NULL, &[0.0; 3], &[1.0; 3], DefaultQueryFilter::default(), FindPathOptions::empty())
            .unwrap_err();
        assert!(err.has_detail(Status::INVALID_PARAM));
        assert!(query.sliced_find_path_status().is_none());
    }

    #[test]
    fn test_cancel() {
        let mesh = single_tile_mesh(3, 1, 1.0);
        let mut query = NavMeshQuery::new(&mesh, QueryConfig::default()).unwrap();
        let start = poly_ref_at(&mesh, 0, 0, 0);
        let end = poly_ref_at(&mesh, 0, 0, 2);
        let status = query
            .init_sliced_find_path(start, end, &[0.5, 0.0, 0.5], &[2.5, 0.0, 0.5], DefaultQueryFilter::default(), FindPathOptions::empty())
            .unwrap();
        assert!(status.is_in_progress());

        query.cancel_sliced_find_path();
        assert!(query.sliced_find_path_status().is_none());
        assert!(query.update_sliced_find_path(1).is_err());
    }
}

//! Plane geometry for island clustering.
//!
//! Positions are 3D but clustering happens on the horizontal XZ plane; the
//! vertical (Y) axis is ignored. Distances are compared squared so the hot
//! paths never take a square root.

/// World position `[x, y, z]`.
pub type Position3D = [f64; 3];

const X_AXIS: usize = 0;
const Z_AXIS: usize = 2;

/// Squared distance between two positions on the XZ plane.
pub fn squared_plane_distance(p1: &Position3D, p2: &Position3D) -> f64 {
    let dx = p2[X_AXIS] - p1[X_AXIS];
    let dz = p2[Z_AXIS] - p1[Z_AXIS];
    dx * dx + dz * dz
}

/// Center and bounding radius of a group of positions.
///
/// The center is the XZ mean with Y pinned to 0. The radius is the plane
/// distance from the center to the farthest member. An empty group sits at
/// the origin with radius 0.
pub fn centroid_and_radius(positions: &[Position3D]) -> (Position3D, f64) {
    if positions.is_empty() {
        return ([0.0, 0.0, 0.0], 0.0);
    }

    let n = positions.len() as f64;
    let (sum_x, sum_z) = positions
        .iter()
        .fold((0.0, 0.0), |(x, z), p| (x + p[X_AXIS], z + p[Z_AXIS]));
    let center = [sum_x / n, 0.0, sum_z / n];

    let farthest = positions
        .iter()
        .map(|p| squared_plane_distance(p, &center))
        .fold(0.0_f64, f64::max);

    (center, farthest.sqrt())
}

/// True iff any member of `group` is within `distance` of `peer` (inclusive).
pub fn peer_intersects_group(peer: &Position3D, group: &[Position3D], distance: f64) -> bool {
    let limit = distance * distance;
    group
        .iter()
        .any(|other| squared_plane_distance(peer, other) <= limit)
}

/// Bounding circles `(ca, ra)` and `(cb, rb)`, inflated by `distance`, overlap.
pub fn circles_overlap(
    ca: &Position3D,
    ra: f64,
    cb: &Position3D,
    rb: f64,
    distance: f64,
) -> bool {
    let reach = ra + rb + distance;
    squared_plane_distance(ca, cb) <= reach * reach
}

/// Geometry of one island as seen by the intersection test.
#[derive(Debug, Clone, Copy)]
pub struct IslandShape<'a> {
    pub center: Position3D,
    pub radius: f64,
    pub positions: &'a [Position3D],
}

/// Two islands intersect when their bounding circles, inflated by
/// `distance`, overlap and at least one pair of members is within
/// `distance` of each other.
///
/// The circle test rejects far-apart islands before the O(n·m) pair scan.
pub fn islands_intersect(a: &IslandShape<'_>, b: &IslandShape<'_>, distance: f64) -> bool {
    if !circles_overlap(&a.center, a.radius, &b.center, b.radius, distance) {
        return false;
    }
    a.positions
        .iter()
        .any(|p| peer_intersects_group(p, b.positions, distance))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-7
    }

    #[test]
    fn plane_distance_ignores_height() {
        let a = [0.0, 0.0, 0.0];
        let b = [3.0, 1000.0, 4.0];
        assert_eq!(squared_plane_distance(&a, &b), 25.0);
    }

    #[test]
    fn empty_group_is_origin() {
        assert_eq!(centroid_and_radius(&[]), ([0.0, 0.0, 0.0], 0.0));
    }

    #[test]
    fn singleton_center_is_the_peer() {
        let (center, radius) = centroid_and_radius(&[[12.0, 0.0, -7.5]]);
        assert_eq!(center, [12.0, 0.0, -7.5]);
        assert_eq!(radius, 0.0);
    }

    #[test]
    fn two_peer_geometry() {
        let (center, radius) = centroid_and_radius(&[[0.0, 0.0, 0.0], [40.0, 0.0, 40.0]]);
        assert_eq!(center, [20.0, 0.0, 20.0]);
        assert!(close(radius, 800.0_f64.sqrt()));
    }

    #[test]
    fn radius_reaches_farthest_peer() {
        let positions = [
            [0.0, 0.0, 0.0],
            [10.0, 0.0, 10.0],
            [6.0, 0.0, 6.0],
            [40.0, 0.0, 40.0],
        ];
        let (center, radius) = centroid_and_radius(&positions);
        assert_eq!(center, [14.0, 0.0, 14.0]);
        assert!(close(radius, 1352.0_f64.sqrt()));
    }

    #[test]
    fn center_drops_height() {
        let (center, _) = centroid_and_radius(&[[2.0, 50.0, 2.0], [4.0, 10.0, 4.0]]);
        assert_eq!(center, [3.0, 0.0, 3.0]);
    }

    #[test]
    fn peer_group_boundary_is_inclusive() {
        let group = [[64.0, 0.0, 0.0]];
        assert!(peer_intersects_group(&[0.0, 0.0, 0.0], &group, 64.0));
        assert!(!peer_intersects_group(&[-0.01, 0.0, 0.0], &group, 64.0));
        assert!(!peer_intersects_group(&[0.0, 0.0, 0.0], &[], 64.0));
    }

    #[test]
    fn islands_intersect_needs_a_close_pair() {
        // Bounding circles overlap but no pair of peers is close enough.
        let a_pos = [[0.0, 0.0, 0.0], [100.0, 0.0, 0.0]];
        let b_pos = [[50.0, 0.0, 40.0], [50.0, 0.0, -40.0]];
        let (ac, ar) = centroid_and_radius(&a_pos);
        let (bc, br) = centroid_and_radius(&b_pos);
        let a = IslandShape { center: ac, radius: ar, positions: &a_pos };
        let b = IslandShape { center: bc, radius: br, positions: &b_pos };
        assert!(!islands_intersect(&a, &b, 10.0));
        assert!(islands_intersect(&a, &b, 65.0));
    }

    #[test]
    fn islands_far_apart_rejected_by_bounds() {
        let a_pos = [[0.0, 0.0, 0.0]];
        let b_pos = [[200.0, 0.0, 200.0]];
        let a = IslandShape { center: a_pos[0], radius: 0.0, positions: &a_pos };
        let b = IslandShape { center: b_pos[0], radius: 0.0, positions: &b_pos };
        assert!(!islands_intersect(&a, &b, 64.0));
    }
}

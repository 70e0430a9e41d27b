//! Greedy grouping of overlapping class members into count-badge group markers
//!
//! Members are visited in class order. A member not yet absorbed becomes a candidate boss
//! and absorbs every later or earlier member whose box meets the boss box scaled by
//! [`OVERLAY_GROUPING_SCALE`]. Absorbed members are skipped both as bosses and as joiners
//! for the rest of the pass, so the result depends on member order. This is not a maximal
//! clustering.

use super::camera::rects_intersect;
use super::overlay::OverlayId;

/// Boss boxes are widened by this factor in both dimensions
pub const OVERLAY_GROUPING_SCALE: i32 = 2;

/// Class member as seen by one grouping pass; `x`/`y` is the map-pixel anchor
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Member {
    pub id: OverlayId,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    /// Shown and allowed at the current zoom
    pub eligible: bool,
    pub in_group: bool,
    pub boss: bool,
}

impl Member {
    pub fn new(id: OverlayId, x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { id, x, y, w, h, eligible: true, in_group: false, boss: false }
    }
}

/// Group produced by a pass: joiners in class order followed by the boss
#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    pub boss: OverlayId,
    pub members: Vec<OverlayId>,
    /// Centroid of all members in map pixels
    pub center: (f64, f64),
}

#[derive(Clone, Copy, Debug)]
pub struct Declusterer {
    pub scale: i32,
}

impl Declusterer {
    /// Group one class. Flags on `members` are updated in place.
    pub fn group_class(&self, members: &mut [Member]) -> Vec<Cluster> {
        let mut clusters = Vec::new();
        for boss in 0..members.len() {
            let candidate = &members[boss];
            if !candidate.eligible || candidate.in_group {
                continue;
            }
            if let Some(cluster) = self.gather(members, boss) {
                clusters.push(cluster);
            }
        }
        clusters
    }

    fn gather(&self, members: &mut [Member], boss: usize) -> Option<Cluster> {
        let b = members[boss];
        if b.w <= 0 || b.h <= 0 {
            return None;
        }

        let mut sum = (0.0, 0.0);
        let mut joined = Vec::new();
        for (i, m) in members.iter_mut().enumerate() {
            if i == boss || m.in_group || !m.eligible || m.w <= 0 || m.h <= 0 {
                continue;
            }
            if rects_intersect(m.x, m.y, m.w, m.h, b.x, b.y, b.w * self.scale, b.h * self.scale) {
                m.in_group = true;
                m.boss = false;
                sum.0 += m.x as f64;
                sum.1 += m.y as f64;
                joined.push(m.id);
            }
        }
        if joined.is_empty() {
            return None;
        }

        let count = joined.len() as f64 + 1.0;
        members[boss].in_group = true;
        members[boss].boss = true;
        joined.push(b.id);
        Some(Cluster {
            boss: b.id,
            members: joined,
            center: ((sum.0 + b.x as f64) / count, (sum.1 + b.y as f64) / count),
        })
    }
}

impl Default for Declusterer {
    fn default() -> Self {
        Self { scale: OVERLAY_GROUPING_SCALE }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn ids(n: usize) -> Vec<OverlayId> {
        let mut map: SlotMap<OverlayId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn test_three_marker_scenario() {
        let ids = ids(3);
        let mut members = vec![
            Member::new(ids[0], 0, 0, 40, 40),
            Member::new(ids[1], 5, 5, 40, 40),
            Member::new(ids[2], 500, 500, 40, 40),
        ];
        let clusters = Declusterer::default().group_class(&mut members);

        assert_eq!(clusters.len(), 1);
        let group = &clusters[0];
        assert_eq!(group.boss, ids[0]);
        assert_eq!(group.members, vec![ids[1], ids[0]]);
        assert!((group.center.0 - 2.5).abs() < 1e-9);
        assert!((group.center.1 - 2.5).abs() < 1e-9);
        assert_eq!(group.members.len().to_string(), "2");

        assert!(members[0].boss && members[0].in_group);
        assert!(members[1].in_group && !members[1].boss);
        assert!(!members[2].in_group);
    }

    #[test]
    fn test_grouping_is_idempotent() {
        let ids = ids(5);
        let layout = [(0, 0), (30, 10), (70, 70), (150, 150), (400, 0)];
        let fresh = || -> Vec<Member> {
            ids.iter()
                .zip(layout)
                .map(|(id, (x, y))| Member::new(*id, x, y, 40, 40))
                .collect()
        };
        let declusterer = Declusterer::default();
        let mut first = fresh();
        let mut second = fresh();
        let a = declusterer.group_class(&mut first);
        let b = declusterer.group_class(&mut second);
        assert_eq!(a, b);
        assert_eq!(first, second);
    }

    #[test]
    fn test_order_dependent_chain() {
        // a-b overlap and b-c overlap, but a and c do not: only the first boss wins
        let ids = ids(3);
        let mut members = vec![
            Member::new(ids[0], 0, 0, 40, 40),
            Member::new(ids[1], 70, 0, 40, 40),
            Member::new(ids[2], 140, 0, 40, 40),
        ];
        let clusters = Declusterer::default().group_class(&mut members);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members, vec![ids[1], ids[0]]);
        assert!(!members[2].in_group);
    }

    #[test]
    fn test_ineligible_and_empty_boxes_skipped() {
        let ids = ids(3);
        let mut hidden = Member::new(ids[1], 5, 5, 40, 40);
        hidden.eligible = false;
        let mut members = vec![
            Member::new(ids[0], 0, 0, 40, 40),
            hidden,
            Member::new(ids[2], 10, 10, 0, 0),
        ];
        let clusters = Declusterer::default().group_class(&mut members);
        assert!(clusters.is_empty());
        assert!(members.iter().all(|m| !m.in_group));
    }
}

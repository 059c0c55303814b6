//! Broadphase collision detection over binned AABBs.

use std::collections::HashSet;

use glam::DVec3;

use super::collider::{Aabb, Collider, CollisionFilter};
use super::rigid_body::{Pose, RigidBody, RigidBodyType};

struct Entry {
    entity: hecs::Entity,
    aabb: Aabb,
    body_type: RigidBodyType,
    filter: CollisionFilter,
}

/// AABB pair generation, brute-force or spatially binned.
///
/// With `bins_per_axis` set, entries are hashed into a uniform grid and only
/// co-resident entries are tested; this is what keeps granular scenes with
/// thousands of particles tractable. Without it, all pairs are tested.
pub struct Broadphase {
    pub bins_per_axis: Option<[u32; 3]>,
}

impl Broadphase {
    pub fn new() -> Self {
        Self {
            bins_per_axis: None,
        }
    }

    /// Find all candidate pairs whose inflated AABBs overlap.
    ///
    /// Static-static pairs, pairs with a deactivated member, and pairs
    /// rejected by either side's collision filter are skipped.
    pub fn find_pairs(
        &self,
        world: &hecs::World,
        envelope: f64,
    ) -> Vec<(hecs::Entity, hecs::Entity)> {
        let mut entries: Vec<Entry> = Vec::new();

        for (entity, (collider, pose, rb)) in
            world.query::<(&Collider, &Pose, &RigidBody)>().iter()
        {
            if !rb.active {
                continue;
            }
            entries.push(Entry {
                entity,
                aabb: collider.compute_aabb(pose).inflated(envelope),
                body_type: rb.body_type,
                filter: collider.filter,
            });
        }

        match self.bins_per_axis {
            Some(bins) if entries.len() > 64 => Self::binned_pairs(&entries, bins),
            _ => Self::brute_force_pairs(&entries),
        }
    }

    fn admit(a: &Entry, b: &Entry) -> bool {
        if a.body_type == RigidBodyType::Static && b.body_type == RigidBodyType::Static {
            return false;
        }
        if !a.filter.admits(&b.filter) || !b.filter.admits(&a.filter) {
            return false;
        }
        a.aabb.overlaps(&b.aabb)
    }

    fn brute_force_pairs(entries: &[Entry]) -> Vec<(hecs::Entity, hecs::Entity)> {
        let mut pairs = Vec::new();
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                if Self::admit(&entries[i], &entries[j]) {
                    pairs.push((entries[i].entity, entries[j].entity));
                }
            }
        }
        pairs
    }

    fn binned_pairs(entries: &[Entry], bins: [u32; 3]) -> Vec<(hecs::Entity, hecs::Entity)> {
        // Domain bounds from the entries themselves.
        let mut min = DVec3::splat(f64::MAX);
        let mut max = DVec3::splat(f64::MIN);
        for e in entries {
            min = min.min(e.aabb.min);
            max = max.max(e.aabb.max);
        }

        let nx = bins[0].max(1) as usize;
        let ny = bins[1].max(1) as usize;
        let nz = bins[2].max(1) as usize;
        let extent = (max - min).max(DVec3::splat(1e-9));
        let cell = DVec3::new(
            extent.x / nx as f64,
            extent.y / ny as f64,
            extent.z / nz as f64,
        );

        let clamp_cell = |v: f64, n: usize| -> usize { (v.max(0.0) as usize).min(n - 1) };

        let mut grid: Vec<Vec<usize>> = vec![Vec::new(); nx * ny * nz];
        for (idx, e) in entries.iter().enumerate() {
            let lo = (e.aabb.min - min) / cell;
            let hi = (e.aabb.max - min) / cell;
            let (ix0, ix1) = (clamp_cell(lo.x, nx), clamp_cell(hi.x, nx));
            let (iy0, iy1) = (clamp_cell(lo.y, ny), clamp_cell(hi.y, ny));
            let (iz0, iz1) = (clamp_cell(lo.z, nz), clamp_cell(hi.z, nz));
            for ix in ix0..=ix1 {
                for iy in iy0..=iy1 {
                    for iz in iz0..=iz1 {
                        grid[(iz * ny + iy) * nx + ix].push(idx);
                    }
                }
            }
        }

        // An AABB spanning several cells yields the same pair more than once.
        let mut seen: HashSet<(u64, u64)> = HashSet::new();
        let mut pairs = Vec::new();
        for bucket in &grid {
            for (k, &i) in bucket.iter().enumerate() {
                for &j in &bucket[(k + 1)..] {
                    let key = if entries[i].entity.to_bits() <= entries[j].entity.to_bits() {
                        (entries[i].entity.to_bits().get(), entries[j].entity.to_bits().get())
                    } else {
                        (entries[j].entity.to_bits().get(), entries[i].entity.to_bits().get())
                    };
                    if !seen.insert(key) {
                        continue;
                    }
                    if Self::admit(&entries[i], &entries[j]) {
                        pairs.push((entries[i].entity, entries[j].entity));
                    }
                }
            }
        }
        pairs
    }
}

impl Default for Broadphase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::collider::ColliderShape;

    fn sphere(world: &mut hecs::World, pos: DVec3, radius: f64, dynamic: bool) -> hecs::Entity {
        let rb = if dynamic {
            RigidBody::new_dynamic(1.0, DVec3::ONE)
        } else {
            RigidBody::new_static()
        };
        world.spawn((
            Pose::from_position(pos),
            rb,
            Collider::new(ColliderShape::Sphere { radius }),
        ))
    }

    #[test]
    fn test_broadphase_overlapping() {
        let mut world = hecs::World::new();
        sphere(&mut world, DVec3::ZERO, 1.0, true);
        sphere(&mut world, DVec3::new(1.0, 0.0, 0.0), 1.0, true);

        let broadphase = Broadphase::new();
        let pairs = broadphase.find_pairs(&world, 0.0);
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn test_broadphase_no_overlap() {
        let mut world = hecs::World::new();
        sphere(&mut world, DVec3::ZERO, 0.5, true);
        sphere(&mut world, DVec3::new(10.0, 0.0, 0.0), 0.5, true);

        let broadphase = Broadphase::new();
        let pairs = broadphase.find_pairs(&world, 0.0);
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_broadphase_static_static_skipped() {
        let mut world = hecs::World::new();
        sphere(&mut world, DVec3::ZERO, 1.0, false);
        sphere(&mut world, DVec3::ZERO, 1.0, false);

        let broadphase = Broadphase::new();
        let pairs = broadphase.find_pairs(&world, 0.0);
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_broadphase_family_mask_respected() {
        let mut world = hecs::World::new();
        let filter = CollisionFilter::new(1).without_family(1);
        world.spawn((
            Pose::IDENTITY,
            RigidBody::new_dynamic(1.0, DVec3::ONE),
            Collider::new(ColliderShape::Sphere { radius: 1.0 }).with_filter(filter),
        ));
        world.spawn((
            Pose::IDENTITY,
            RigidBody::new_dynamic(1.0, DVec3::ONE),
            Collider::new(ColliderShape::Sphere { radius: 1.0 }).with_filter(filter),
        ));

        let broadphase = Broadphase::new();
        let pairs = broadphase.find_pairs(&world, 0.0);
        assert!(
            pairs.is_empty(),
            "same-family masked colliders must not pair"
        );
    }

    #[test]
    fn test_binned_matches_brute_force() {
        let mut world = hecs::World::new();
        // A line of touching spheres, enough to trip the binned path.
        for i in 0..100 {
            sphere(&mut world, DVec3::new(i as f64 * 0.9, 0.0, 0.0), 0.5, true);
        }

        let brute = Broadphase::new();
        let mut expected = brute.find_pairs(&world, 0.0);

        let binned = Broadphase {
            bins_per_axis: Some([16, 1, 1]),
        };
        let mut got = binned.find_pairs(&world, 0.0);

        let key = |p: &(hecs::Entity, hecs::Entity)| {
            let (a, b) = (p.0.to_bits().get(), p.1.to_bits().get());
            if a <= b {
                (a, b)
            } else {
                (b, a)
            }
        };
        expected.sort_by_key(key);
        got.sort_by_key(key);
        assert_eq!(
            expected.len(),
            got.len(),
            "binned broadphase must find the same pairs"
        );
        for (e, g) in expected.iter().zip(got.iter()) {
            assert_eq!(key(e), key(g));
        }
    }
}

//! Collider shapes, bounding boxes, and collision filtering.

use glam::{DMat3, DVec3};

use super::rigid_body::Pose;

/// Collider shape, expressed in the body frame.
#[derive(Debug, Clone)]
pub enum ColliderShape {
    Sphere { radius: f64 },
    Box { half_extents: DVec3 },
    /// Triangle with vertices expressed in the body frame.
    Triangle { vertices: [DVec3; 3] },
}

/// Axis-aligned bounding box for broadphase collision detection.
#[derive(Debug, Clone, Copy)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    /// Test whether two AABBs overlap.
    #[inline]
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Test whether a point lies inside the box.
    #[inline]
    pub fn contains(&self, point: DVec3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    /// Grow the box by `margin` on all sides.
    #[inline]
    pub fn inflated(&self, margin: f64) -> Aabb {
        Aabb {
            min: self.min - DVec3::splat(margin),
            max: self.max + DVec3::splat(margin),
        }
    }
}

/// Bitmask-based collision filtering.
///
/// `family` is a bit index; `mask` carries one bit per family this collider
/// may touch. A pair generates contacts only if each side's mask admits the
/// other side's family.
#[derive(Debug, Clone, Copy)]
pub struct CollisionFilter {
    pub family: u32,
    pub mask: u32,
}

impl CollisionFilter {
    /// Family 0, colliding with everything.
    pub const DEFAULT: Self = Self {
        family: 0,
        mask: !0,
    };

    /// Create a filter in the given family, colliding with everything.
    pub fn new(family: u32) -> Self {
        Self { family, mask: !0 }
    }

    /// Disable collision against the given family.
    pub fn without_family(mut self, family: u32) -> Self {
        self.mask &= !(1 << family);
        self
    }

    /// Whether this filter admits contact with the other side's family.
    #[inline]
    pub fn admits(&self, other: &CollisionFilter) -> bool {
        self.mask & (1 << other.family) != 0
    }
}

impl Default for CollisionFilter {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Collision detection component.
#[derive(Debug, Clone)]
pub struct Collider {
    pub shape: ColliderShape,
    /// Offset of the shape from the body origin, in the body frame.
    pub offset: DVec3,
    pub filter: CollisionFilter,
}

impl Collider {
    /// Create a collider with no offset and the default filter.
    pub fn new(shape: ColliderShape) -> Self {
        Self {
            shape,
            offset: DVec3::ZERO,
            filter: CollisionFilter::DEFAULT,
        }
    }

    /// Set the shape offset.
    pub fn with_offset(mut self, offset: DVec3) -> Self {
        self.offset = offset;
        self
    }

    /// Set the collision filter.
    pub fn with_filter(mut self, filter: CollisionFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Compute the world-space AABB of this collider under the given pose.
    pub fn compute_aabb(&self, pose: &Pose) -> Aabb {
        let center = pose.transform_point(self.offset);

        match &self.shape {
            ColliderShape::Sphere { radius } => Aabb {
                min: center - DVec3::splat(*radius),
                max: center + DVec3::splat(*radius),
            },
            ColliderShape::Box { half_extents } => {
                // Project the rotated box axes onto the world axes.
                let rot = DMat3::from_quat(pose.rotation);
                let extent = rot.x_axis.abs() * half_extents.x
                    + rot.y_axis.abs() * half_extents.y
                    + rot.z_axis.abs() * half_extents.z;
                Aabb {
                    min: center - extent,
                    max: center + extent,
                }
            }
            ColliderShape::Triangle { vertices } => {
                let mut min = DVec3::splat(f64::MAX);
                let mut max = DVec3::splat(f64::MIN);
                for v in vertices {
                    let w = pose.transform_point(self.offset + *v);
                    min = min.min(w);
                    max = max.max(w);
                }
                Aabb { min, max }
            }
        }
    }
}

//! Rigid body components and integration functions.

use glam::{DQuat, DVec3};

/// Stable identifier carried by every body the terrain node creates.
///
/// Negative values mark terrain infrastructure (platform, container walls,
/// ground anchor). Granular particles start at a large positive base so they
/// can be told apart from proxy bodies, which carry the index of the mesh
/// vertex or face they stand in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BodyId(pub i64);

/// Position and orientation of a body in the global frame (Z up).
#[derive(Debug, Clone, Copy)]
pub struct Pose {
    pub position: DVec3,
    pub rotation: DQuat,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        position: DVec3::ZERO,
        rotation: DQuat::IDENTITY,
    };

    /// Create a pose at the given position with identity orientation.
    pub fn from_position(position: DVec3) -> Self {
        Self {
            position,
            rotation: DQuat::IDENTITY,
        }
    }

    /// Transform a point from the body frame to the global frame.
    #[inline]
    pub fn transform_point(&self, point: DVec3) -> DVec3 {
        self.rotation * point + self.position
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Rigid body type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigidBodyType {
    /// Affected by forces and collisions.
    Dynamic,
    /// Immovable.
    Static,
}

/// Rigid body component.
#[derive(Debug, Clone)]
pub struct RigidBody {
    pub body_type: RigidBodyType,
    pub mass: f64,
    /// Diagonal inertia tensor in the body frame.
    pub inertia: DVec3,
    pub linear_velocity: DVec3,
    pub angular_velocity: DVec3,
    pub force_accumulator: DVec3,
    pub torque_accumulator: DVec3,
    /// Deactivated bodies are skipped by integration and collision.
    pub active: bool,
}

impl RigidBody {
    /// Create a new dynamic rigid body with the given mass and diagonal inertia.
    pub fn new_dynamic(mass: f64, inertia: DVec3) -> Self {
        Self {
            body_type: RigidBodyType::Dynamic,
            mass,
            inertia,
            linear_velocity: DVec3::ZERO,
            angular_velocity: DVec3::ZERO,
            force_accumulator: DVec3::ZERO,
            torque_accumulator: DVec3::ZERO,
            active: true,
        }
    }

    /// Create a new static rigid body.
    pub fn new_static() -> Self {
        Self {
            body_type: RigidBodyType::Static,
            mass: 0.0,
            inertia: DVec3::ZERO,
            linear_velocity: DVec3::ZERO,
            angular_velocity: DVec3::ZERO,
            force_accumulator: DVec3::ZERO,
            torque_accumulator: DVec3::ZERO,
            active: true,
        }
    }

    /// Inverse mass; zero for static or massless bodies.
    #[inline]
    pub fn inv_mass(&self) -> f64 {
        if self.body_type == RigidBodyType::Dynamic && self.mass > 0.0 {
            1.0 / self.mass
        } else {
            0.0
        }
    }

    /// Component-wise inverse of the diagonal inertia; zero for static bodies.
    #[inline]
    pub fn inv_inertia(&self) -> DVec3 {
        if self.body_type != RigidBodyType::Dynamic {
            return DVec3::ZERO;
        }
        DVec3::new(
            if self.inertia.x > 0.0 {
                1.0 / self.inertia.x
            } else {
                0.0
            },
            if self.inertia.y > 0.0 {
                1.0 / self.inertia.y
            } else {
                0.0
            },
            if self.inertia.z > 0.0 {
                1.0 / self.inertia.z
            } else {
                0.0
            },
        )
    }
}

/// Apply gravity force to all active dynamic rigid bodies.
pub fn apply_gravity(world: &mut hecs::World, gravity: DVec3) {
    for (_, rb) in world.query_mut::<&mut RigidBody>() {
        if rb.body_type == RigidBodyType::Dynamic && rb.mass > 0.0 && rb.active {
            rb.force_accumulator += gravity * rb.mass;
        }
    }
}

/// Integrate velocities using semi-implicit Euler: v += (F/m) * dt.
pub fn integrate_velocities(world: &mut hecs::World, dt: f64) {
    for (_, rb) in world.query_mut::<&mut RigidBody>() {
        if rb.body_type != RigidBodyType::Dynamic || rb.mass <= 0.0 || !rb.active {
            continue;
        }

        let inv_mass = 1.0 / rb.mass;
        rb.linear_velocity += rb.force_accumulator * inv_mass * dt;

        let inv_inertia = rb.inv_inertia();
        rb.angular_velocity += rb.torque_accumulator * inv_inertia * dt;
    }
}

/// Integrate positions: p += v * dt, q += 0.5 * omega_quat * q * dt.
pub fn integrate_positions(world: &mut hecs::World, dt: f64) {
    for (_, (rb, pose)) in world.query_mut::<(&RigidBody, &mut Pose)>() {
        if rb.body_type != RigidBodyType::Dynamic || !rb.active {
            continue;
        }

        pose.position += rb.linear_velocity * dt;

        let omega = rb.angular_velocity;
        if omega.length_squared() > 1e-20 {
            let omega_quat = DQuat::from_xyzw(omega.x, omega.y, omega.z, 0.0);
            let q_dot = omega_quat * pose.rotation * 0.5;
            pose.rotation = (pose.rotation + q_dot * dt).normalize();
        }
    }
}

/// Clear force and torque accumulators on all rigid bodies.
pub fn clear_forces(world: &mut hecs::World) {
    for (_, rb) in world.query_mut::<&mut RigidBody>() {
        rb.force_accumulator = DVec3::ZERO;
        rb.torque_accumulator = DVec3::ZERO;
    }
}

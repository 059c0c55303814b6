//! Rigid-body physics collaborator for the terrain co-simulation node.
//!
//! # Architecture
//!
//! The pipeline runs once per fixed sub-step:
//!
//! 1. Apply forces (gravity)
//! 2. Broadphase collision detection (binned AABB overlap)
//! 3. Narrowphase collision detection (specialized pair tests)
//! 4. Contact resolution (penalty forces or sequential impulses, by method)
//! 5. Integrate velocities and positions
//! 6. Enforce weld constraints
//! 7. Deactivate bodies that left the active bounding box
//! 8. Clear force accumulators, record contact bookkeeping
//!
//! Bodies are hecs entities carrying [`Pose`], [`RigidBody`], [`Collider`],
//! [`SurfaceMaterial`] and [`BodyId`] components.

pub mod broadphase;
pub mod collider;
pub mod contact;
pub mod narrowphase;
pub mod rigid_body;
pub mod solver;

use std::collections::HashMap;

use glam::DVec3;

pub use collider::{Aabb, Collider, ColliderShape, CollisionFilter};
pub use contact::{ContactInfo, ContactManifold, ContactMethod, SurfaceMaterial};
pub use rigid_body::{BodyId, Pose, RigidBody, RigidBodyType};

use broadphase::Broadphase;
use narrowphase::detect_collision;

/// Configuration for the physics simulation.
#[derive(Debug, Clone)]
pub struct PhysicsConfig {
    /// Contact resolution family.
    pub contact_method: ContactMethod,
    /// Gravity vector. Default: (0, 0, -9.81), Z up.
    pub gravity: DVec3,
    /// Number of sequential-impulse iterations (NSC only). Default: 50.
    pub solver_iterations: u32,
    /// Margin added to broadphase AABBs.
    pub collision_envelope: f64,
    /// Spatial binning resolution for the broadphase; brute force when unset.
    pub bins_per_axis: Option<[u32; 3]>,
    /// Bodies whose position leaves this box are deactivated.
    pub active_aabb: Option<Aabb>,
}

impl PhysicsConfig {
    pub fn new(contact_method: ContactMethod) -> Self {
        Self {
            contact_method,
            gravity: DVec3::new(0.0, 0.0, -9.81),
            solver_iterations: 50,
            collision_envelope: 0.0,
            bins_per_axis: None,
            active_aabb: None,
        }
    }
}

/// A body welded to a fixed pose in the global frame.
///
/// Two bodies that are each individually fixed never report mutual contact,
/// so "fixed" terrain that must still collide with fixed proxies is modeled
/// as a dynamic body pinned by one of these.
#[derive(Debug, Clone)]
struct Weld {
    body: hecs::Entity,
    pose: Pose,
}

/// The physics world: owns the stepping pipeline and contact bookkeeping.
///
/// Body state itself lives in the caller's `hecs::World`; this type holds
/// everything that is not per-body (configuration, broadphase, manifolds,
/// contact-force records, weld constraints, simulated time).
pub struct PhysicsWorld {
    config: PhysicsConfig,
    broadphase: Broadphase,
    manifolds: Vec<ContactManifold>,
    /// Per-body solver output from the last step: net impulse (NSC) or net
    /// force (SMC).
    step_records: HashMap<hecs::Entity, DVec3>,
    last_dt: f64,
    /// Cumulative contact forces, rebuilt by [`calculate_contact_forces`].
    contact_forces: HashMap<hecs::Entity, DVec3>,
    welds: Vec<Weld>,
    time: f64,
}

impl PhysicsWorld {
    /// Create a new physics world with the given configuration.
    pub fn new(config: PhysicsConfig) -> Self {
        let broadphase = Broadphase {
            bins_per_axis: config.bins_per_axis,
        };
        Self {
            config,
            broadphase,
            manifolds: Vec::new(),
            step_records: HashMap::new(),
            last_dt: 0.0,
            contact_forces: HashMap::new(),
            welds: Vec::new(),
            time: 0.0,
        }
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    /// Simulated time advanced so far.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Reset the simulated time (does not touch body state).
    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    /// Pin a body to its current pose through a weld constraint.
    pub fn add_weld(&mut self, world: &hecs::World, body: hecs::Entity) {
        let pose = *world
            .get::<&Pose>(body)
            .expect("welded body must have a pose");
        self.welds.push(Weld { body, pose });
    }

    /// Number of contacts detected in the last step.
    pub fn contact_count(&self) -> usize {
        self.manifolds.len()
    }

    /// Rebuild the cumulative per-body contact-force map from the last
    /// step's solver records. Call once per synchronization point; the
    /// result is shared by every subsequent [`contact_force`] query.
    pub fn calculate_contact_forces(&mut self) {
        self.contact_forces.clear();
        if self.last_dt <= 0.0 {
            return;
        }
        let scale = match self.config.contact_method {
            // Impulses convert to forces over the step.
            ContactMethod::Nsc => 1.0 / self.last_dt,
            // Penalty records are forces already.
            ContactMethod::Smc => 1.0,
        };
        for (entity, record) in &self.step_records {
            self.contact_forces.insert(*entity, *record * scale);
        }
    }

    /// Cumulative contact force on a body, as of the last
    /// [`calculate_contact_forces`] call. Zero for bodies not in contact.
    pub fn contact_force(&self, body: hecs::Entity) -> DVec3 {
        self.contact_forces
            .get(&body)
            .copied()
            .unwrap_or(DVec3::ZERO)
    }

    /// Advance the simulation by exactly `dt` seconds (one sub-step).
    ///
    /// Callers needing a coarser cadence subdivide externally; this method
    /// never splits the interval itself.
    pub fn step(&mut self, world: &mut hecs::World, dt: f64) {
        // 1. Apply forces
        rigid_body::apply_gravity(world, self.config.gravity);

        // 2./3. Collision detection
        let pairs = self.broadphase.find_pairs(world, self.config.collision_envelope);
        self.manifolds.clear();
        for (entity_a, entity_b) in &pairs {
            let contact = {
                let collider_a = world.get::<&Collider>(*entity_a);
                let collider_b = world.get::<&Collider>(*entity_b);
                let pose_a = world.get::<&Pose>(*entity_a);
                let pose_b = world.get::<&Pose>(*entity_b);

                if let (Ok(ca), Ok(cb), Ok(pa), Ok(pb)) = (collider_a, collider_b, pose_a, pose_b)
                {
                    detect_collision(&ca, &pa, &cb, &pb)
                } else {
                    None
                }
            };

            if let Some(info) = contact {
                self.manifolds
                    .push(ContactManifold::new(*entity_a, *entity_b, info));
            }
        }

        // 4./5. Contact resolution and integration
        self.step_records.clear();
        match self.config.contact_method {
            ContactMethod::Smc => {
                solver::solve_smc(&self.manifolds, world, &mut self.step_records);
                rigid_body::integrate_velocities(world, dt);
            }
            ContactMethod::Nsc => {
                rigid_body::integrate_velocities(world, dt);
                solver::solve_nsc(
                    &mut self.manifolds,
                    world,
                    self.config.solver_iterations,
                    dt,
                    &mut self.step_records,
                );
            }
        }
        rigid_body::integrate_positions(world, dt);

        // 6. Weld constraints
        for weld in &self.welds {
            if let Ok(mut pose) = world.get::<&mut Pose>(weld.body) {
                *pose = weld.pose;
            }
            if let Ok(mut rb) = world.get::<&mut RigidBody>(weld.body) {
                rb.linear_velocity = DVec3::ZERO;
                rb.angular_velocity = DVec3::ZERO;
            }
        }

        // 7. Deactivation
        if let Some(active) = self.config.active_aabb {
            for (_, (pose, rb)) in world.query_mut::<(&Pose, &mut RigidBody)>() {
                if rb.body_type == RigidBodyType::Dynamic
                    && rb.active
                    && !active.contains(pose.position)
                {
                    rb.active = false;
                    rb.linear_velocity = DVec3::ZERO;
                    rb.angular_velocity = DVec3::ZERO;
                }
            }
        }

        // 8. Bookkeeping
        rigid_body::clear_forces(world);
        self.last_dt = dt;
        self.time += dt;
    }

    /// Overwrite the recorded solver output for a body (test scaffolding for
    /// the force-extraction paths).
    #[cfg(test)]
    pub(crate) fn inject_step_record(&mut self, body: hecs::Entity, record: DVec3, dt: f64) {
        self.step_records.insert(body, record);
        self.last_dt = dt;
    }

    /// Overwrite a cumulative contact force directly (test scaffolding).
    #[cfg(test)]
    pub(crate) fn inject_contact_force(&mut self, body: hecs::Entity, force: DVec3) {
        self.contact_forces.insert(body, force);
    }
}

//! Contact solvers: sequential impulse (NSC) and penalty forces (SMC).
//!
//! Both families record what they applied per body, so the world can rebuild
//! cumulative contact forces after the step. Recording covers static bodies
//! too: a fixed proxy never moves, but the force measured on it is still what
//! gets reported back to the tire rank.

use std::collections::HashMap;

use glam::DVec3;

use super::contact::{ContactManifold, SurfaceMaterial};
use super::rigid_body::{Pose, RigidBody, RigidBodyType};

/// Baumgarte stabilization parameter.
const BAUMGARTE_BETA: f64 = 0.2;
/// Penetration slop (allowed penetration before position correction).
const PENETRATION_SLOP: f64 = 1e-4;

/// Helper struct caching body data for solver calculations.
struct BodyData {
    inv_mass: f64,
    inv_inertia: DVec3,
    linear_velocity: DVec3,
    angular_velocity: DVec3,
    position: DVec3,
    friction: f64,
    restitution: f64,
}

fn body_data(world: &hecs::World, entity: hecs::Entity) -> Option<BodyData> {
    let rb = world.get::<&RigidBody>(entity).ok()?;
    let pose = world.get::<&Pose>(entity).ok()?;
    let (friction, restitution) = match world.get::<&SurfaceMaterial>(entity) {
        Ok(mat) => (mat.friction(), mat.restitution()),
        Err(_) => (0.5, 0.0),
    };
    Some(BodyData {
        inv_mass: rb.inv_mass(),
        inv_inertia: rb.inv_inertia(),
        linear_velocity: rb.linear_velocity,
        angular_velocity: rb.angular_velocity,
        position: pose.position,
        friction,
        restitution,
    })
}

fn record(applied: &mut HashMap<hecs::Entity, DVec3>, entity: hecs::Entity, amount: DVec3) {
    *applied.entry(entity).or_insert(DVec3::ZERO) += amount;
}

/// Apply an impulse to both bodies at the contact point (B positive, A negative).
fn apply_impulse(
    world: &mut hecs::World,
    entity_a: hecs::Entity,
    entity_b: hecs::Entity,
    impulse: DVec3,
    r_a: DVec3,
    r_b: DVec3,
) {
    if let Ok(mut rb) = world.get::<&mut RigidBody>(entity_a) {
        if rb.body_type == RigidBodyType::Dynamic && rb.mass > 0.0 {
            let inv_mass = rb.inv_mass();
            let inv_inertia = rb.inv_inertia();
            rb.linear_velocity -= impulse * inv_mass;
            rb.angular_velocity -= inv_inertia * r_a.cross(impulse);
        }
    }
    if let Ok(mut rb) = world.get::<&mut RigidBody>(entity_b) {
        if rb.body_type == RigidBodyType::Dynamic && rb.mass > 0.0 {
            let inv_mass = rb.inv_mass();
            let inv_inertia = rb.inv_inertia();
            rb.linear_velocity += impulse * inv_mass;
            rb.angular_velocity += inv_inertia * r_b.cross(impulse);
        }
    }
}

/// Solve contact constraints by sequential impulse iteration, recording the
/// net impulse applied to each body.
pub fn solve_nsc(
    manifolds: &mut [ContactManifold],
    world: &mut hecs::World,
    iterations: u32,
    dt: f64,
    applied: &mut HashMap<hecs::Entity, DVec3>,
) {
    for _ in 0..iterations {
        for manifold in manifolds.iter_mut() {
            solve_manifold_nsc(manifold, world, dt, applied);
        }
    }
}

fn solve_manifold_nsc(
    manifold: &mut ContactManifold,
    world: &mut hecs::World,
    dt: f64,
    applied: &mut HashMap<hecs::Entity, DVec3>,
) {
    let a = match body_data(world, manifold.entity_a) {
        Some(d) => d,
        None => return,
    };
    let b = match body_data(world, manifold.entity_b) {
        Some(d) => d,
        None => return,
    };

    // Skip if both sides are immovable.
    if a.inv_mass == 0.0 && b.inv_mass == 0.0 {
        return;
    }

    let normal = manifold.info.normal;
    let restitution = (a.restitution + b.restitution) * 0.5;
    let friction = (a.friction + b.friction) * 0.5;

    let r_a = manifold.info.point - a.position;
    let r_b = manifold.info.point - b.position;

    let vel_a = a.linear_velocity + a.angular_velocity.cross(r_a);
    let vel_b = b.linear_velocity + b.angular_velocity.cross(r_b);
    let contact_velocity = (vel_b - vel_a).dot(normal);

    let r_a_cross_n = r_a.cross(normal);
    let r_b_cross_n = r_b.cross(normal);
    let inv_mass_sum = a.inv_mass
        + b.inv_mass
        + (a.inv_inertia * r_a_cross_n).dot(r_a_cross_n)
        + (b.inv_inertia * r_b_cross_n).dot(r_b_cross_n);

    if inv_mass_sum <= 0.0 {
        return;
    }

    // Baumgarte position correction.
    let bias = BAUMGARTE_BETA / dt * (manifold.info.penetration - PENETRATION_SLOP).max(0.0);

    let j_normal = (-(1.0 + restitution) * contact_velocity + bias) / inv_mass_sum;

    // Clamp the accumulated normal impulse.
    let old_impulse = manifold.normal_impulse;
    manifold.normal_impulse = (old_impulse + j_normal).max(0.0);
    let j_normal = manifold.normal_impulse - old_impulse;

    let impulse = normal * j_normal;
    apply_impulse(world, manifold.entity_a, manifold.entity_b, impulse, r_a, r_b);
    record(applied, manifold.entity_a, -impulse);
    record(applied, manifold.entity_b, impulse);

    // Friction impulse, from velocities updated by the normal impulse.
    let a2 = match body_data(world, manifold.entity_a) {
        Some(d) => d,
        None => return,
    };
    let b2 = match body_data(world, manifold.entity_b) {
        Some(d) => d,
        None => return,
    };

    let vel_a2 = a2.linear_velocity + a2.angular_velocity.cross(r_a);
    let vel_b2 = b2.linear_velocity + b2.angular_velocity.cross(r_b);
    let rel_vel = vel_b2 - vel_a2;

    let tangent_vel = rel_vel - normal * rel_vel.dot(normal);
    let tangent_len = tangent_vel.length();
    if tangent_len <= 1e-9 {
        return;
    }
    let tangent = tangent_vel / tangent_len;

    let r_a_cross_t = r_a.cross(tangent);
    let r_b_cross_t = r_b.cross(tangent);
    let inv_mass_t = a2.inv_mass
        + b2.inv_mass
        + (a2.inv_inertia * r_a_cross_t).dot(r_a_cross_t)
        + (b2.inv_inertia * r_b_cross_t).dot(r_b_cross_t);

    if inv_mass_t <= 0.0 {
        return;
    }

    let j_tangent = -tangent_len / inv_mass_t;

    // Coulomb friction: |Jt| <= mu * |Jn|
    let max_friction = friction * manifold.normal_impulse;
    let j_tangent = j_tangent.clamp(-max_friction, max_friction);

    let friction_impulse = tangent * j_tangent;
    apply_impulse(
        world,
        manifold.entity_a,
        manifold.entity_b,
        friction_impulse,
        r_a,
        r_b,
    );
    record(applied, manifold.entity_a, -friction_impulse);
    record(applied, manifold.entity_b, friction_impulse);
}

/// Combined penalty coefficients for an SMC contact pair.
struct SmcCoefficients {
    kn: f64,
    gn: f64,
    gt: f64,
    friction: f64,
}

fn smc_coefficients(world: &hecs::World, a: hecs::Entity, b: hecs::Entity) -> SmcCoefficients {
    let fetch = |e: hecs::Entity| -> (f64, f64, f64, f64) {
        match world.get::<&SurfaceMaterial>(e).as_deref() {
            Ok(SurfaceMaterial::Smc {
                friction,
                kn,
                gn,
                gt,
                ..
            }) => (*friction, *kn, *gn, *gt),
            _ => (0.5, 2e5, 40.0, 20.0),
        }
    };
    let (mu_a, kn_a, gn_a, gt_a) = fetch(a);
    let (mu_b, kn_b, gn_b, gt_b) = fetch(b);
    SmcCoefficients {
        kn: (kn_a + kn_b) * 0.5,
        gn: (gn_a + gn_b) * 0.5,
        gt: (gt_a + gt_b) * 0.5,
        friction: (mu_a + mu_b) * 0.5,
    }
}

/// Compute penalty contact forces and add them to the force accumulators,
/// recording the net force applied to each body.
///
/// Must run before velocity integration so the forces take effect this step.
pub fn solve_smc(
    manifolds: &[ContactManifold],
    world: &mut hecs::World,
    applied: &mut HashMap<hecs::Entity, DVec3>,
) {
    for manifold in manifolds {
        let a = match body_data(world, manifold.entity_a) {
            Some(d) => d,
            None => continue,
        };
        let b = match body_data(world, manifold.entity_b) {
            Some(d) => d,
            None => continue,
        };

        let coeff = smc_coefficients(world, manifold.entity_a, manifold.entity_b);

        let normal = manifold.info.normal;
        let r_a = manifold.info.point - a.position;
        let r_b = manifold.info.point - b.position;

        let vel_a = a.linear_velocity + a.angular_velocity.cross(r_a);
        let vel_b = b.linear_velocity + b.angular_velocity.cross(r_b);
        let rel_vel = vel_b - vel_a;
        let vn = rel_vel.dot(normal);

        // Spring-damper normal force; repulsive only.
        let fn_mag = (coeff.kn * manifold.info.penetration - coeff.gn * vn).max(0.0);
        if fn_mag <= 0.0 {
            continue;
        }

        // Viscous tangential force, Coulomb-clamped.
        let tangent_vel = rel_vel - normal * vn;
        let tangent_len = tangent_vel.length();
        let tangential = if tangent_len > 1e-9 {
            let ft_mag = (coeff.gt * tangent_len).min(coeff.friction * fn_mag);
            -tangent_vel / tangent_len * ft_mag
        } else {
            DVec3::ZERO
        };

        let force = normal * fn_mag + tangential;

        if let Ok(mut rb) = world.get::<&mut RigidBody>(manifold.entity_a) {
            if rb.body_type == RigidBodyType::Dynamic {
                rb.force_accumulator -= force;
                rb.torque_accumulator -= r_a.cross(force);
            }
        }
        if let Ok(mut rb) = world.get::<&mut RigidBody>(manifold.entity_b) {
            if rb.body_type == RigidBodyType::Dynamic {
                rb.force_accumulator += force;
                rb.torque_accumulator += r_b.cross(force);
            }
        }

        record(applied, manifold.entity_a, -force);
        record(applied, manifold.entity_b, force);
    }
}

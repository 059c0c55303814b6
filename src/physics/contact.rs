//! Contact data structures and surface materials.

use glam::DVec3;

/// Contact-method family used by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactMethod {
    /// Penalty (smooth) contact: compliant spring-damper forces.
    Smc,
    /// Complementarity (non-smooth) contact: impulse-based resolution.
    Nsc,
}

/// Information about a single contact between two shapes.
#[derive(Debug, Clone, Copy)]
pub struct ContactInfo {
    /// Contact normal (from shape A to shape B).
    pub normal: DVec3,
    /// Penetration depth.
    pub penetration: f64,
    /// Contact point in world space.
    pub point: DVec3,
}

/// A contact between two bodies, with accumulated impulse data.
#[derive(Debug, Clone)]
pub struct ContactManifold {
    pub entity_a: hecs::Entity,
    pub entity_b: hecs::Entity,
    pub info: ContactInfo,
    /// Accumulated normal impulse (sequential impulse solver).
    pub normal_impulse: f64,
}

impl ContactManifold {
    pub fn new(entity_a: hecs::Entity, entity_b: hecs::Entity, info: ContactInfo) -> Self {
        Self {
            entity_a,
            entity_b,
            info,
            normal_impulse: 0.0,
        }
    }
}

/// Contact material parameters, tagged by contact method.
///
/// The penalty family carries the full set of compliance terms; the
/// complementarity family only uses friction and restitution.
#[derive(Debug, Clone, Copy)]
pub enum SurfaceMaterial {
    Smc {
        friction: f64,
        restitution: f64,
        young_modulus: f64,
        poisson_ratio: f64,
        kn: f64,
        gn: f64,
        kt: f64,
        gt: f64,
    },
    Nsc {
        friction: f64,
        restitution: f64,
    },
}

impl SurfaceMaterial {
    /// Default terrain material for the given contact method.
    pub fn default_for(method: ContactMethod) -> Self {
        match method {
            ContactMethod::Smc => SurfaceMaterial::Smc {
                friction: 0.9,
                restitution: 0.0,
                young_modulus: 2e5,
                poisson_ratio: 0.3,
                kn: 2e5,
                gn: 40.0,
                kt: 2e5,
                gt: 20.0,
            },
            ContactMethod::Nsc => SurfaceMaterial::Nsc {
                friction: 0.9,
                restitution: 0.0,
            },
        }
    }

    /// Build a material from the 8-float vector of the per-tire material
    /// handshake. The wire width is fixed regardless of method; under
    /// [`ContactMethod::Nsc`] only the first two entries are meaningful.
    pub fn from_wire(method: ContactMethod, props: &[f32; 8]) -> Self {
        match method {
            ContactMethod::Smc => SurfaceMaterial::Smc {
                friction: props[0] as f64,
                restitution: props[1] as f64,
                young_modulus: props[2] as f64,
                poisson_ratio: props[3] as f64,
                kn: props[4] as f64,
                gn: props[5] as f64,
                kt: props[6] as f64,
                gt: props[7] as f64,
            },
            ContactMethod::Nsc => SurfaceMaterial::Nsc {
                friction: props[0] as f64,
                restitution: props[1] as f64,
            },
        }
    }

    /// Contact method this material belongs to.
    pub fn method(&self) -> ContactMethod {
        match self {
            SurfaceMaterial::Smc { .. } => ContactMethod::Smc,
            SurfaceMaterial::Nsc { .. } => ContactMethod::Nsc,
        }
    }

    pub fn friction(&self) -> f64 {
        match self {
            SurfaceMaterial::Smc { friction, .. } | SurfaceMaterial::Nsc { friction, .. } => {
                *friction
            }
        }
    }

    pub fn restitution(&self) -> f64 {
        match self {
            SurfaceMaterial::Smc { restitution, .. }
            | SurfaceMaterial::Nsc { restitution, .. } => *restitution,
        }
    }
}

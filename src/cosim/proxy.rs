//! Proxy bodies standing in for remote tire meshes.
//!
//! The terrain rank never sees tire geometry directly; it maintains locally
//! owned collision-only bodies ("proxies") that track the mesh state received
//! each step. Rigid terrain uses one sphere per mesh vertex (node proxies);
//! granular terrain uses one triangle per mesh face (face proxies). All
//! proxies of a run share one collision family with intra-family collision
//! disabled, so tire self-contact never masquerades as terrain contact.

use std::collections::HashMap;

use glam::{DQuat, DVec3};

use crate::physics::{
    BodyId, Collider, ColliderShape, CollisionFilter, PhysicsWorld, Pose, RigidBody,
    SurfaceMaterial,
};

/// Collision family shared by all proxy bodies.
pub const TIRE_FAMILY: u32 = 1;

/// Placeholder edge length for face-proxy triangles before the first
/// synchronization rewrites their vertices.
const FACE_PROXY_PLACEHOLDER_LEN: f64 = 0.1;

/// Kinematic state of one mesh vertex, as received from the tire rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct VertexState {
    pub position: DVec3,
    pub velocity: DVec3,
}

/// A proxy body and the index of the mesh vertex or face it stands in for.
#[derive(Debug, Clone, Copy)]
pub struct ProxyBody {
    pub body: hecs::Entity,
    pub index: usize,
}

/// Per-tire bookkeeping: mesh topology, the freshest vertex state, and the
/// proxy bodies owned on its behalf.
#[derive(Debug)]
pub struct TireData {
    pub num_vertices: usize,
    pub num_triangles: usize,
    /// Offset of this tire's vertices within the node-wide vertex numbering.
    pub start_vertex: usize,
    /// Offset of this tire's triangles within the node-wide face numbering.
    pub start_triangle: usize,
    /// Overwritten wholesale every synchronization step.
    pub vertex_states: Vec<VertexState>,
    /// Vertex index triples. Topology is fixed, but the tire rank re-sends
    /// it every step and the stored copy is refreshed each time.
    pub triangles: Vec<[usize; 3]>,
    pub material: SurfaceMaterial,
    pub proxies: Vec<ProxyBody>,
}

impl TireData {
    pub fn new(
        num_vertices: usize,
        num_triangles: usize,
        start_vertex: usize,
        start_triangle: usize,
        material: SurfaceMaterial,
    ) -> Self {
        Self {
            num_vertices,
            num_triangles,
            start_vertex,
            start_triangle,
            vertex_states: vec![VertexState::default(); num_vertices],
            triangles: vec![[0; 3]; num_triangles],
            material,
            proxies: Vec::new(),
        }
    }
}

fn proxy_filter() -> CollisionFilter {
    CollisionFilter::new(TIRE_FAMILY).without_family(TIRE_FAMILY)
}

fn proxy_rigid_body(mass: f64, inertia: DVec3, fixed: bool) -> RigidBody {
    if fixed {
        RigidBody::new_static()
    } else {
        RigidBody::new_dynamic(mass, inertia)
    }
}

/// Create one sphere-collider body per mesh vertex. Each proxy's identifier
/// is the node-wide index of its vertex.
pub(crate) fn create_node_proxies(
    world: &mut hecs::World,
    tire: &mut TireData,
    mass: f64,
    radius: f64,
    fixed: bool,
) {
    let inertia = 0.4 * mass * radius * radius * DVec3::ONE;
    for iv in 0..tire.num_vertices {
        let body = world.spawn((
            Pose::IDENTITY,
            proxy_rigid_body(mass, inertia, fixed),
            Collider::new(ColliderShape::Sphere { radius }).with_filter(proxy_filter()),
            tire.material,
            BodyId((tire.start_vertex + iv) as i64),
        ));
        tire.proxies.push(ProxyBody { body, index: iv });
    }
}

/// Create one triangle-collider body per mesh face. Each proxy's identifier
/// is the node-wide index of its face. The contact shape is rewritten at
/// every synchronization, so the initial vertices are placeholders.
pub(crate) fn create_face_proxies(
    world: &mut hecs::World,
    tire: &mut TireData,
    mass: f64,
    fixed: bool,
) {
    // TODO: better approximation of the face-proxy inertia than this
    // uniform placeholder.
    let inertia = 1e-3 * mass * DVec3::splat(0.1);
    let len = FACE_PROXY_PLACEHOLDER_LEN;

    for it in 0..tire.num_triangles {
        let body = world.spawn((
            Pose::IDENTITY,
            proxy_rigid_body(mass, inertia, fixed),
            Collider::new(ColliderShape::Triangle {
                vertices: [
                    DVec3::new(len, 0.0, 0.0),
                    DVec3::new(0.0, len, 0.0),
                    DVec3::new(0.0, 0.0, len),
                ],
            })
            .with_filter(proxy_filter()),
            tire.material,
            BodyId((tire.start_triangle + it) as i64),
        ));
        tire.proxies.push(ProxyBody { body, index: it });
    }
}

/// Set position and velocity of node proxies from the tire mesh vertices.
/// Orientation is reset to identity and angular velocity to zero; a vertex
/// proxy carries no meaningful rotation.
pub(crate) fn update_node_proxies(world: &mut hecs::World, tire: &TireData) {
    for (proxy, state) in tire.proxies.iter().zip(&tire.vertex_states) {
        if let Ok(mut pose) = world.get::<&mut Pose>(proxy.body) {
            pose.position = state.position;
            pose.rotation = DQuat::IDENTITY;
        }
        if let Ok(mut rb) = world.get::<&mut RigidBody>(proxy.body) {
            rb.linear_velocity = state.velocity;
            rb.angular_velocity = DVec3::ZERO;
        }
    }
}

/// Reconstruct each face proxy from its triangle's current vertex state:
/// position at the vertex centroid, identity orientation, linear velocity
/// equal to the vertex-velocity average (exact for a centroidal frame), and
/// the contact shape rewritten to the current vertex offsets.
///
/// The angular velocity is left at zero. Recovering it would mean solving
/// the over-determined 9x3 system from the three vertex velocities in a
/// least-squares sense; the co-simulation runs with this simplification.
pub(crate) fn update_face_proxies(world: &mut hecs::World, tire: &TireData) {
    for (it, proxy) in tire.proxies.iter().enumerate() {
        let tri = tire.triangles[it];

        // Vertex locations and velocities, expressed in the global frame.
        let pa = tire.vertex_states[tri[0]].position;
        let pb = tire.vertex_states[tri[1]].position;
        let pc = tire.vertex_states[tri[2]].position;
        let va = tire.vertex_states[tri[0]].velocity;
        let vb = tire.vertex_states[tri[1]].velocity;
        let vc = tire.vertex_states[tri[2]].velocity;

        let pos = (pa + pb + pc) / 3.0;

        if let Ok(mut pose) = world.get::<&mut Pose>(proxy.body) {
            pose.position = pos;
            pose.rotation = DQuat::IDENTITY;
        }
        if let Ok(mut rb) = world.get::<&mut RigidBody>(proxy.body) {
            rb.linear_velocity = (va + vb + vc) / 3.0;
            rb.angular_velocity = DVec3::ZERO;
        }
        if let Ok(mut collider) = world.get::<&mut Collider>(proxy.body) {
            collider.shape = ColliderShape::Triangle {
                vertices: [pa - pos, pb - pos, pc - pos],
            };
        }
    }
}

/// Collect contact forces on node proxies that are in contact: a 1:1 mapping
/// from proxy to mesh vertex, with zero-magnitude forces filtered out.
pub(crate) fn collect_node_proxy_forces(
    physics: &PhysicsWorld,
    tire: &TireData,
) -> (Vec<i32>, Vec<f64>) {
    let mut indices = Vec::new();
    let mut forces = Vec::new();

    for proxy in &tire.proxies {
        let force = physics.contact_force(proxy.body);
        if force == DVec3::ZERO {
            continue;
        }
        indices.push(proxy.index as i32);
        forces.extend_from_slice(&[force.x, force.y, force.z]);
    }

    (indices, forces)
}

/// Collect contact forces on face proxies and redistribute them to mesh
/// vertices. The force on a triangle proxy acts at its centroid, whose
/// barycentric coordinates are (1/3, 1/3, 1/3), so each vertex of the face
/// is credited one third; a vertex shared by several faces accumulates every
/// contribution. The result is unordered, each vertex appearing at most once.
pub(crate) fn collect_face_proxy_forces(
    physics: &PhysicsWorld,
    tire: &TireData,
) -> (Vec<i32>, Vec<f64>) {
    let mut accumulated: HashMap<usize, DVec3> = HashMap::new();

    for (it, proxy) in tire.proxies.iter().enumerate() {
        let force = physics.contact_force(proxy.body);
        if force == DVec3::ZERO {
            continue;
        }

        let share = force / 3.0;
        for &vertex in &tire.triangles[it] {
            *accumulated.entry(vertex).or_insert(DVec3::ZERO) += share;
        }
    }

    let mut indices = Vec::with_capacity(accumulated.len());
    let mut forces = Vec::with_capacity(3 * accumulated.len());
    for (vertex, force) in accumulated {
        indices.push(vertex as i32);
        forces.extend_from_slice(&[force.x, force.y, force.z]);
    }

    (indices, forces)
}

/// Barycentric coordinates (a1, a2, a3) of point `p` with respect to the
/// triangle {v1, v2, v3}.
///
/// The denominator vanishes for a degenerate triangle; callers are expected
/// to pass non-degenerate geometry.
pub fn barycentric_coords(v1: DVec3, v2: DVec3, v3: DVec3, p: DVec3) -> DVec3 {
    let v12 = v2 - v1;
    let v13 = v3 - v1;
    let v1p = p - v1;

    let d_12_12 = v12.dot(v12);
    let d_12_13 = v12.dot(v13);
    let d_13_13 = v13.dot(v13);
    let d_1p_12 = v1p.dot(v12);
    let d_1p_13 = v1p.dot(v13);

    let denom = d_12_12 * d_13_13 - d_12_13 * d_12_13;

    let a2 = (d_13_13 * d_1p_12 - d_12_13 * d_1p_13) / denom;
    let a3 = (d_12_12 * d_1p_13 - d_12_13 * d_1p_12) / denom;
    let a1 = 1.0 - a2 - a3;

    DVec3::new(a1, a2, a3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::{ContactMethod, PhysicsConfig};

    fn test_physics() -> PhysicsWorld {
        PhysicsWorld::new(PhysicsConfig::new(ContactMethod::Smc))
    }

    fn face_tire(world: &mut hecs::World, triangles: Vec<[usize; 3]>, num_vertices: usize) -> TireData {
        let mut tire = TireData::new(
            num_vertices,
            triangles.len(),
            0,
            0,
            SurfaceMaterial::default_for(ContactMethod::Smc),
        );
        tire.triangles = triangles;
        create_face_proxies(world, &mut tire, 1.0, false);
        tire
    }

    #[test]
    fn test_barycentric_centroid() {
        let v1 = DVec3::new(0.0, 0.0, 0.0);
        let v2 = DVec3::new(3.0, 0.0, 1.0);
        let v3 = DVec3::new(-1.0, 2.0, 0.5);
        let centroid = (v1 + v2 + v3) / 3.0;

        let coords = barycentric_coords(v1, v2, v3, centroid);
        let third = DVec3::splat(1.0 / 3.0);
        assert!(
            (coords - third).length() < 1e-12,
            "centroid coords = {:?}",
            coords
        );
    }

    #[test]
    fn test_barycentric_vertices() {
        let v1 = DVec3::new(1.0, 1.0, 0.0);
        let v2 = DVec3::new(4.0, 1.0, 0.0);
        let v3 = DVec3::new(1.0, 5.0, 0.0);

        assert_eq!(barycentric_coords(v1, v2, v3, v1), DVec3::new(1.0, 0.0, 0.0));
        assert!((barycentric_coords(v1, v2, v3, v2) - DVec3::new(0.0, 1.0, 0.0)).length() < 1e-12);
        assert!((barycentric_coords(v1, v2, v3, v3) - DVec3::new(0.0, 0.0, 1.0)).length() < 1e-12);
    }

    #[test]
    fn test_face_force_split_into_thirds() {
        let mut world = hecs::World::new();
        let mut physics = test_physics();
        let tire = face_tire(&mut world, vec![[0, 1, 2]], 3);

        let f = DVec3::new(3.0, -6.0, 9.0);
        physics.inject_contact_force(tire.proxies[0].body, f);

        let (indices, forces) = collect_face_proxy_forces(&physics, &tire);
        assert_eq!(indices.len(), 3);
        assert_eq!(forces.len(), 9);

        let mut total = DVec3::ZERO;
        for (k, &index) in indices.iter().enumerate() {
            let fv = DVec3::new(forces[3 * k], forces[3 * k + 1], forces[3 * k + 2]);
            assert!(
                (fv - f / 3.0).length() < 1e-12,
                "vertex {} got {:?}, want {:?}",
                index,
                fv,
                f / 3.0
            );
            total += fv;
        }
        assert!((total - f).length() < 1e-12, "thirds must reassemble F");
    }

    #[test]
    fn test_shared_vertex_accumulates() {
        let mut world = hecs::World::new();
        let mut physics = test_physics();
        // Two triangles sharing vertices 1 and 2.
        let tire = face_tire(&mut world, vec![[0, 1, 2], [1, 2, 3]], 4);

        let f0 = DVec3::new(3.0, 0.0, 0.0);
        let f1 = DVec3::new(0.0, 0.0, 6.0);
        physics.inject_contact_force(tire.proxies[0].body, f0);
        physics.inject_contact_force(tire.proxies[1].body, f1);

        let (indices, forces) = collect_face_proxy_forces(&physics, &tire);
        assert_eq!(indices.len(), 4, "each vertex appears at most once");

        let lookup = |v: i32| -> DVec3 {
            let k = indices.iter().position(|&i| i == v).unwrap();
            DVec3::new(forces[3 * k], forces[3 * k + 1], forces[3 * k + 2])
        };

        assert!((lookup(0) - f0 / 3.0).length() < 1e-12);
        assert!((lookup(3) - f1 / 3.0).length() < 1e-12);
        // Shared vertices carry the sum of both thirds, not the last one.
        assert!((lookup(1) - (f0 + f1) / 3.0).length() < 1e-12);
        assert!((lookup(2) - (f0 + f1) / 3.0).length() < 1e-12);
    }

    #[test]
    fn test_zero_forces_never_reported() {
        let mut world = hecs::World::new();
        let mut physics = test_physics();

        // Face proxies: one loaded triangle, one untouched.
        let tire = face_tire(&mut world, vec![[0, 1, 2], [3, 4, 5]], 6);
        physics.inject_contact_force(tire.proxies[0].body, DVec3::new(0.0, 0.0, 1.0));

        let (indices, forces) = collect_face_proxy_forces(&physics, &tire);
        assert_eq!(indices.len(), 3);
        for k in 0..indices.len() {
            let fv = DVec3::new(forces[3 * k], forces[3 * k + 1], forces[3 * k + 2]);
            assert!(fv.length() > 0.0);
        }

        // Node proxies: only the touched vertex reports.
        let mut node_tire = TireData::new(
            4,
            0,
            0,
            0,
            SurfaceMaterial::default_for(ContactMethod::Smc),
        );
        create_node_proxies(&mut world, &mut node_tire, 1.0, 0.01, false);
        physics.inject_contact_force(node_tire.proxies[2].body, DVec3::new(0.5, 0.0, 0.0));

        let (indices, forces) = collect_node_proxy_forces(&physics, &node_tire);
        assert_eq!(indices, vec![2]);
        assert_eq!(forces, vec![0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_update_face_proxies_reconstructs() {
        let mut world = hecs::World::new();
        let mut tire = face_tire(&mut world, vec![[0, 1, 2]], 3);

        tire.vertex_states[0] = VertexState {
            position: DVec3::new(0.0, 0.0, 3.0),
            velocity: DVec3::new(1.0, 0.0, 0.0),
        };
        tire.vertex_states[1] = VertexState {
            position: DVec3::new(3.0, 0.0, 3.0),
            velocity: DVec3::new(2.0, 0.0, 0.0),
        };
        tire.vertex_states[2] = VertexState {
            position: DVec3::new(0.0, 3.0, 3.0),
            velocity: DVec3::new(3.0, 0.0, 0.0),
        };

        update_face_proxies(&mut world, &tire);

        let body = tire.proxies[0].body;
        let pose = *world.get::<&Pose>(body).unwrap();
        assert!((pose.position - DVec3::new(1.0, 1.0, 3.0)).length() < 1e-12);
        assert_eq!(pose.rotation, DQuat::IDENTITY);

        let rb = world.get::<&RigidBody>(body).unwrap();
        assert!((rb.linear_velocity - DVec3::new(2.0, 0.0, 0.0)).length() < 1e-12);
        assert_eq!(rb.angular_velocity, DVec3::ZERO);
        drop(rb);

        let collider = world.get::<&Collider>(body).unwrap();
        match &collider.shape {
            ColliderShape::Triangle { vertices } => {
                assert!((vertices[0] - DVec3::new(-1.0, -1.0, 0.0)).length() < 1e-12);
                assert!((vertices[1] - DVec3::new(2.0, -1.0, 0.0)).length() < 1e-12);
                assert!((vertices[2] - DVec3::new(-1.0, 2.0, 0.0)).length() < 1e-12);
            }
            other => panic!("face proxy shape must stay a triangle, got {:?}", other),
        }
    }

    #[test]
    fn test_update_node_proxies_sets_state() {
        let mut world = hecs::World::new();
        let mut tire = TireData::new(
            2,
            0,
            0,
            0,
            SurfaceMaterial::default_for(ContactMethod::Smc),
        );
        create_node_proxies(&mut world, &mut tire, 1.0, 0.01, false);

        tire.vertex_states[1] = VertexState {
            position: DVec3::new(0.5, -0.5, 2.0),
            velocity: DVec3::new(0.0, 4.0, 0.0),
        };

        update_node_proxies(&mut world, &tire);

        let body = tire.proxies[1].body;
        let pose = *world.get::<&Pose>(body).unwrap();
        assert_eq!(pose.position, DVec3::new(0.5, -0.5, 2.0));

        let rb = world.get::<&RigidBody>(body).unwrap();
        assert_eq!(rb.linear_velocity, DVec3::new(0.0, 4.0, 0.0));
    }
}

//! Regolith: terrain co-simulation node for distributed vehicle-terrain
//! dynamics.
//!
//! A co-simulated run partitions a vehicle-terrain simulation across one
//! process per logical rank: a vehicle rank, one rank per tire, and the
//! terrain rank implemented by this crate. Each step the terrain node
//! receives tire mesh state, mirrors it onto locally owned proxy bodies,
//! advances its rigid or granular terrain model, and sends per-vertex
//! contact forces back to the originating ranks.
//!
//! # Architecture
//!
//! The library is organized into two layers:
//!
//! 1. **physics** - rigid body simulation and collision detection backing
//!    the terrain model (bodies live in a `hecs` world)
//! 2. **cosim** - rank layout, blocking point-to-point transport, proxy
//!    bookkeeping, checkpointing, and the terrain node itself

pub mod cosim;
pub mod physics;

// Re-export commonly used types
pub use physics::{
    Aabb, BodyId, Collider, ColliderShape, CollisionFilter, ContactInfo, ContactManifold,
    ContactMethod, PhysicsConfig, PhysicsWorld, Pose, RigidBody, RigidBodyType, SurfaceMaterial,
};

pub use cosim::checkpoint::{
    Checkpoint, CheckpointError, ParticleRecord, CHECKPOINT_FILENAME,
};
pub use cosim::config::{TerrainNodeBuilder, TerrainType};
pub use cosim::node::{TerrainNode, GRANULAR_ID_BASE};
pub use cosim::proxy::{barycentric_coords, ProxyBody, TireData, VertexState, TIRE_FAMILY};
pub use cosim::transport::{router, Endpoint, Payload, Transport, TransportError};
pub use cosim::{tire_rank, Node, Rank, TERRAIN_RANK, VEHICLE_RANK};

// Re-export glam for convenience
pub use glam;

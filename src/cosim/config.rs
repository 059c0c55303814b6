//! Terrain node configuration.
//!
//! Configuration is a pure-data builder stage; [`TerrainNodeBuilder::build`]
//! performs all construction side effects (terrain bodies, granular packing,
//! settings dump) exactly once and returns the ready
//! [`TerrainNode`](super::node::TerrainNode).

use std::path::PathBuf;

use crate::physics::{ContactMethod, SurfaceMaterial};

use super::node::TerrainNode;
use super::transport::Transport;

/// Terrain representation, which also selects the proxy kind: rigid terrain
/// collides against vertex spheres, granular terrain against face triangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerrainType {
    Rigid,
    Granular,
}

/// Builder for a [`TerrainNode`]. All dimensions are stored as half-sizes.
#[derive(Debug, Clone)]
pub struct TerrainNodeBuilder {
    pub(crate) terrain_type: TerrainType,
    pub(crate) method: ContactMethod,
    pub(crate) num_tires: usize,

    // Container and platform geometry (half-sizes).
    pub(crate) hdim_x: f64,
    pub(crate) hdim_y: f64,
    pub(crate) hdim_z: f64,
    pub(crate) hthick: f64,
    pub(crate) hlen_x: f64,

    // Granular material.
    pub(crate) radius_g: f64,
    pub(crate) rho_g: f64,
    pub(crate) num_layers: usize,
    pub(crate) time_settling: f64,

    // Proxy bodies.
    pub(crate) fixed_proxies: bool,
    pub(crate) mass_pn: f64,
    pub(crate) radius_pn: f64,
    pub(crate) mass_pf: f64,

    pub(crate) material_terrain: SurfaceMaterial,
    pub(crate) step_size: f64,
    pub(crate) out_dir: PathBuf,
    pub(crate) use_checkpoint: bool,
    pub(crate) settling_output: bool,
}

impl TerrainNodeBuilder {
    /// Create a builder with the default model parameters.
    pub fn new(terrain_type: TerrainType, method: ContactMethod, num_tires: usize) -> Self {
        Self {
            terrain_type,
            method,
            num_tires,
            hdim_x: 1.0,
            hdim_y: 0.25,
            hdim_z: 0.5,
            hthick: 0.1,
            hlen_x: 0.0,
            radius_g: 0.01,
            rho_g: 2000.0,
            num_layers: 5,
            time_settling: 0.4,
            fixed_proxies: false,
            mass_pn: 1.0,
            radius_pn: 0.01,
            mass_pf: 1.0,
            material_terrain: SurfaceMaterial::default_for(method),
            step_size: 1e-4,
            out_dir: PathBuf::from("results"),
            use_checkpoint: false,
            settling_output: false,
        }
    }

    /// Set the full container dimensions (length, width, height) and wall
    /// thickness.
    pub fn container_dimensions(
        mut self,
        length: f64,
        width: f64,
        height: f64,
        thickness: f64,
    ) -> Self {
        self.hdim_x = length / 2.0;
        self.hdim_y = width / 2.0;
        self.hdim_z = height / 2.0;
        self.hthick = thickness / 2.0;
        self
    }

    /// Set the full length of the start platform behind the container.
    pub fn platform_length(mut self, length: f64) -> Self {
        self.hlen_x = length / 2.0;
        self
    }

    /// Set granular particle radius, density, and number of generated layers.
    pub fn granular_material(mut self, radius: f64, density: f64, num_layers: usize) -> Self {
        assert!(
            self.terrain_type == TerrainType::Granular,
            "granular material parameters apply only to granular terrain"
        );
        self.radius_g = radius;
        self.rho_g = density;
        self.num_layers = num_layers;
        self
    }

    /// Set the duration of the simulate-settle phase.
    pub fn settling_time(mut self, duration: f64) -> Self {
        assert!(
            self.terrain_type == TerrainType::Granular,
            "settling applies only to granular terrain"
        );
        self.time_settling = duration;
        self
    }

    /// Set node-proxy mass, radius, and fixed flag (rigid terrain).
    pub fn node_proxies(mut self, mass: f64, radius: f64, fixed: bool) -> Self {
        assert!(
            self.terrain_type == TerrainType::Rigid,
            "node proxies apply only to rigid terrain"
        );
        self.mass_pn = mass;
        self.radius_pn = radius;
        self.fixed_proxies = fixed;
        self
    }

    /// Set face-proxy mass and fixed flag (granular terrain).
    pub fn face_proxies(mut self, mass: f64, fixed: bool) -> Self {
        assert!(
            self.terrain_type == TerrainType::Granular,
            "face proxies apply only to granular terrain"
        );
        self.mass_pf = mass;
        self.fixed_proxies = fixed;
        self
    }

    /// Set the terrain contact material. Its method must match the node's.
    pub fn terrain_material(mut self, material: SurfaceMaterial) -> Self {
        assert!(
            material.method() == self.method,
            "terrain material must match the node's contact method"
        );
        self.material_terrain = material;
        self
    }

    /// Set the internal integration step size.
    pub fn step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    /// Set the output directory (checkpoint and per-node files live below it).
    pub fn out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = out_dir.into();
        self
    }

    /// Restore granular state from a checkpoint instead of simulating settling.
    pub fn use_checkpoint(mut self, use_checkpoint: bool) -> Self {
        self.use_checkpoint = use_checkpoint;
        self
    }

    /// Write particle snapshots while settling.
    pub fn settling_output(mut self, settling_output: bool) -> Self {
        self.settling_output = settling_output;
        self
    }

    /// Construct the terrain (platform, container, granular packing), write
    /// the settings dump, and return the node.
    pub fn build<T: Transport>(self, transport: T) -> anyhow::Result<TerrainNode<T>> {
        TerrainNode::build(self, transport)
    }
}

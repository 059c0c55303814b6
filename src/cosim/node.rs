//! The terrain rank of the co-simulation.
//!
//! The global reference frame has Z up, X towards the front of the vehicle,
//! and Y pointing to the left.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use glam::{DVec2, DVec3};
use tracing::{debug, error, info};

use crate::physics::{
    Aabb, BodyId, Collider, ColliderShape, ContactMethod, PhysicsConfig, PhysicsWorld, Pose,
    RigidBody, SurfaceMaterial,
};

use super::checkpoint::{self, CheckpointError, ParticleRecord, CHECKPOINT_FILENAME};
use super::config::{TerrainNodeBuilder, TerrainType};
use super::proxy::{self, TireData};
use super::sampler::poisson_disk_2d;
use super::transport::{Payload, Transport};
use super::{tire_rank, Node, VEHICLE_RANK};

const PLATFORM_ID: i64 = -2;
const CONTAINER_ID: i64 = -1;

/// First body identifier assigned to granular particles.
pub const GRANULAR_ID_BASE: i64 = 100_000;

/// Seed base for the per-layer particle sampler. Generation must be
/// reproducible so checkpoints can be restored by a freshly built node.
const LAYER_SEED: u64 = 0x7465_7272_6169_6e00;

/// Snapshot cadence during the simulate-settle phase.
const SETTLING_OUTPUT_FPS: f64 = 100.0;

/// The terrain node: owns the terrain model, the proxy bodies standing in
/// for remote tire meshes, and the step-synchronized exchange with the
/// vehicle and tire ranks.
pub struct TerrainNode<T: Transport> {
    cfg: TerrainNodeBuilder,
    transport: T,
    world: hecs::World,
    physics: PhysicsWorld,
    node_out_dir: PathBuf,
    platform: hecs::Entity,
    /// Granular particles, in creation order (checkpoint record order).
    particles: Vec<hecs::Entity>,
    num_particles: usize,
    tires: Vec<TireData>,
    init_height: f64,
    cum_sim_time: Duration,
}

impl<T: Transport> TerrainNode<T> {
    /// Construct the terrain: broadphase sizing, platform and container
    /// bodies, weld workarounds for fixed proxies, granular packing, and the
    /// settings dump. Invoked once, from [`TerrainNodeBuilder::build`].
    pub(crate) fn build(cfg: TerrainNodeBuilder, transport: T) -> anyhow::Result<Self> {
        let node_out_dir = cfg.out_dir.join("terrain");
        fs::create_dir_all(&node_out_dir)?;

        let mut physics_cfg = PhysicsConfig::new(cfg.method);
        if cfg.method == ContactMethod::Nsc {
            physics_cfg.collision_envelope = 0.001;
        }
        if cfg.terrain_type == TerrainType::Granular {
            physics_cfg.collision_envelope = 0.1 * cfg.radius_g;
            let factor = 2;
            let bins_x = (((cfg.hdim_x / cfg.radius_g).ceil() as u32) / factor).max(1);
            let bins_y = (((cfg.hdim_y / cfg.radius_g).ceil() as u32) / factor).max(1);
            physics_cfg.bins_per_axis = Some([bins_x, bins_y, 1]);
            info!("broad-phase bins: {} x {} x 1", bins_x, bins_y);
        }

        // Conservative bounding box around the container; bodies leaving it
        // are deactivated.
        let hlen = cfg.hlen_x + cfg.hthick;
        physics_cfg.active_aabb = Some(Aabb {
            min: DVec3::new(
                -cfg.hdim_x - cfg.hthick - 2.0 * hlen,
                -cfg.hdim_y - cfg.hthick,
                -cfg.hthick,
            ),
            max: DVec3::new(
                cfg.hdim_x + cfg.hthick,
                cfg.hdim_y + cfg.hthick,
                2.0 * cfg.hdim_z + 2.0,
            ),
        });

        let mut physics = PhysicsWorld::new(physics_cfg);
        let mut world = hecs::World::new();

        // Collision between two bodies fixed to ground is always ignored, so
        // when the proxies are fixed the platform (and, for rigid terrain,
        // the container) must be free bodies welded to the ground instead.
        let infrastructure_body = |welded: bool| {
            if welded {
                RigidBody::new_dynamic(1000.0, DVec3::splat(1000.0))
            } else {
                RigidBody::new_static()
            }
        };

        // Start platform: a buffer region behind the container. Its top face
        // is raised to the settled terrain height at initialization.
        let platform = world.spawn((
            Pose::IDENTITY,
            infrastructure_body(cfg.fixed_proxies),
            Collider::new(ColliderShape::Box {
                half_extents: DVec3::new(hlen, cfg.hdim_y, cfg.hdim_z + cfg.hthick),
            })
            .with_offset(DVec3::new(-hlen - cfg.hdim_x, 0.0, cfg.hdim_z - cfg.hthick)),
            cfg.material_terrain,
            BodyId(PLATFORM_ID),
        ));

        // Container: bottom plus front/left/right walls. The rear wall is
        // supplied by the platform.
        let weld_container = cfg.fixed_proxies && cfg.terrain_type == TerrainType::Rigid;
        let wall_boxes = [
            (
                DVec3::new(cfg.hdim_x, cfg.hdim_y, cfg.hthick),
                DVec3::new(0.0, 0.0, -cfg.hthick),
            ),
            (
                DVec3::new(cfg.hthick, cfg.hdim_y, cfg.hdim_z + cfg.hthick),
                DVec3::new(cfg.hdim_x + cfg.hthick, 0.0, cfg.hdim_z - cfg.hthick),
            ),
            (
                DVec3::new(cfg.hdim_x, cfg.hthick, cfg.hdim_z + cfg.hthick),
                DVec3::new(0.0, cfg.hdim_y + cfg.hthick, cfg.hdim_z - cfg.hthick),
            ),
            (
                DVec3::new(cfg.hdim_x, cfg.hthick, cfg.hdim_z + cfg.hthick),
                DVec3::new(0.0, -cfg.hdim_y - cfg.hthick, cfg.hdim_z - cfg.hthick),
            ),
        ];
        let mut walls = Vec::with_capacity(wall_boxes.len());
        for (half_extents, offset) in wall_boxes {
            walls.push(world.spawn((
                Pose::IDENTITY,
                infrastructure_body(weld_container),
                Collider::new(ColliderShape::Box { half_extents }).with_offset(offset),
                cfg.material_terrain,
                BodyId(CONTAINER_ID),
            )));
        }

        if cfg.fixed_proxies {
            physics.add_weld(&world, platform);
            if weld_container {
                for wall in &walls {
                    physics.add_weld(&world, *wall);
                }
            }
        }

        // Granular packing: horizontal layers of Poisson-disk sampled spheres.
        let mut particles = Vec::new();
        if cfg.terrain_type == TerrainType::Granular {
            let r = 1.01 * cfg.radius_g;
            let mass = cfg.rho_g * (4.0 / 3.0) * std::f64::consts::PI * cfg.radius_g.powi(3);
            let inertia = DVec3::splat(0.4 * mass * cfg.radius_g * cfg.radius_g);
            let half = DVec2::new(cfg.hdim_x - r, cfg.hdim_y - r);

            let mut center_z = 2.0 * r;
            for layer in 0..cfg.num_layers {
                let points =
                    poisson_disk_2d(half, 2.0 * r, LAYER_SEED.wrapping_add(layer as u64));
                for p in points {
                    let id = GRANULAR_ID_BASE + particles.len() as i64;
                    particles.push(world.spawn((
                        Pose::from_position(DVec3::new(p.x, p.y, center_z)),
                        RigidBody::new_dynamic(mass, inertia),
                        Collider::new(ColliderShape::Sphere {
                            radius: cfg.radius_g,
                        }),
                        cfg.material_terrain,
                        BodyId(id),
                    )));
                }
                center_z += 2.0 * r;
            }
            info!("generated particles: {}", particles.len());
        }

        let num_particles = particles.len();
        let node = Self {
            cfg,
            transport,
            world,
            physics,
            node_out_dir,
            platform,
            particles,
            num_particles,
            tires: Vec::new(),
            init_height: 0.0,
            cum_sim_time: Duration::ZERO,
        };
        node.write_settings()?;

        info!(
            "terrain node constructed: type = {:?} method = {:?} tires = {}",
            node.cfg.terrain_type, node.cfg.method, node.cfg.num_tires
        );
        Ok(node)
    }

    /// Height of the working terrain surface, valid after [`settle`](Self::settle)
    /// (granular) and sent to the vehicle rank at initialization.
    pub fn init_height(&self) -> f64 {
        self.init_height
    }

    pub fn num_particles(&self) -> usize {
        self.num_particles
    }

    pub fn tires(&self) -> &[TireData] {
        &self.tires
    }

    /// Simulated time advanced so far.
    pub fn simulation_time(&self) -> f64 {
        self.physics.time()
    }

    /// Wall-clock time spent inside the physics engine.
    pub fn cumulative_sim_time(&self) -> Duration {
        self.cum_sim_time
    }

    /// Bring the granular material to a quasi-static packed state, either by
    /// simulation or by restoring a checkpoint, then record the resulting
    /// terrain height (maximum particle height plus one particle radius, for
    /// vehicle placement clearance).
    pub fn settle(&mut self) -> anyhow::Result<()> {
        assert!(
            self.cfg.terrain_type == TerrainType::Granular,
            "settling applies only to granular terrain"
        );

        if self.cfg.use_checkpoint {
            self.restore_checkpoint()?;
        } else {
            self.simulate_settling()?;
        }

        let mut height: f64 = 0.0;
        for (_, (id, pose)) in self.world.query::<(&BodyId, &Pose)>().iter() {
            if id.0 > 0 && pose.position.z > height {
                height = pose.position.z;
            }
        }
        self.init_height = height + self.cfg.radius_g;
        info!("initial terrain height = {}", self.init_height);
        Ok(())
    }

    fn simulate_settling(&mut self) -> anyhow::Result<()> {
        let sim_steps = (self.cfg.time_settling / self.cfg.step_size).ceil() as usize;
        let output_steps = (1.0 / (SETTLING_OUTPUT_FPS * self.cfg.step_size))
            .ceil()
            .max(1.0) as usize;
        let mut output_frame = 0;

        let start = Instant::now();
        for step in 0..sim_steps {
            self.physics.step(&mut self.world, self.cfg.step_size);

            if self.cfg.settling_output && step % output_steps == 0 {
                output_frame += 1;
                let path = self
                    .node_out_dir
                    .join(format!("settling_{:04}.dat", output_frame));
                self.write_snapshot(&path)?;
            }
        }
        self.cum_sim_time += start.elapsed();
        info!(
            "settled {} steps in {:.3} s",
            sim_steps,
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Restore granular particle state from the run's checkpoint file. A
    /// particle-count or identifier mismatch is unrecoverable: the whole job
    /// is torn down through the transport before the error surfaces.
    fn restore_checkpoint(&mut self) -> anyhow::Result<()> {
        let path = self.cfg.out_dir.join(CHECKPOINT_FILENAME);
        let ckpt = checkpoint::read_checkpoint(&path)?;

        if ckpt.particles.len() != self.num_particles {
            error!("inconsistent number of particles in checkpoint file");
            self.transport.abort();
            return Err(CheckpointError::ParticleCountMismatch {
                expected: self.num_particles,
                found: ckpt.particles.len(),
            }
            .into());
        }

        for (index, (&entity, record)) in self.particles.iter().zip(&ckpt.particles).enumerate()
        {
            let expected = self
                .world
                .get::<&BodyId>(entity)
                .map(|id| id.0)
                .unwrap_or(i64::MIN);
            if expected != record.id {
                error!("checkpoint identifier mismatch at particle {}", index);
                self.transport.abort();
                return Err(CheckpointError::IdentifierMismatch {
                    index,
                    expected,
                    found: record.id,
                }
                .into());
            }

            {
                let mut pose = self.world.get::<&mut Pose>(entity)?;
                pose.position = record.position;
                pose.rotation = record.rotation;
            }
            let mut rb = self.world.get::<&mut RigidBody>(entity)?;
            rb.linear_velocity = record.linear_velocity;
            rb.angular_velocity =
                checkpoint::angular_velocity(record.rotation, record.rotation_rate);
        }

        info!(
            "read checkpoint <=== {} ({} particles)",
            path.display(),
            ckpt.particles.len()
        );
        Ok(())
    }

    /// Serialize the granular particle state to the run's checkpoint file.
    pub fn write_checkpoint(&self) -> anyhow::Result<()> {
        let mut records = Vec::with_capacity(self.particles.len());
        for &entity in &self.particles {
            let id = self.world.get::<&BodyId>(entity)?.0;
            if id < GRANULAR_ID_BASE {
                continue;
            }
            let pose = *self.world.get::<&Pose>(entity)?;
            let rb = self.world.get::<&RigidBody>(entity)?;
            records.push(ParticleRecord {
                id,
                position: pose.position,
                rotation: pose.rotation,
                linear_velocity: rb.linear_velocity,
                rotation_rate: checkpoint::rotation_rate(pose.rotation, rb.angular_velocity),
            });
        }

        let path = self.cfg.out_dir.join(CHECKPOINT_FILENAME);
        checkpoint::write_checkpoint(&path, self.physics.time(), &records)?;
        info!("write checkpoint ===> {}", path.display());
        Ok(())
    }

    fn write_snapshot(&self, path: &Path) -> anyhow::Result<()> {
        let mut rows = Vec::with_capacity(self.particles.len());
        for &entity in &self.particles {
            let id = self.world.get::<&BodyId>(entity)?.0;
            if id < GRANULAR_ID_BASE {
                continue;
            }
            let pose = self.world.get::<&Pose>(entity)?;
            let rb = self.world.get::<&RigidBody>(entity)?;
            rows.push((id, pose.position, rb.linear_velocity));
        }
        checkpoint::write_particle_snapshot(path, self.physics.time(), self.cfg.radius_g, &rows)?;
        Ok(())
    }

    fn write_settings(&self) -> anyhow::Result<()> {
        let mut out = BufWriter::new(File::create(self.node_out_dir.join("settings.dat"))?);
        let cfg = &self.cfg;

        writeln!(
            out,
            "Terrain type = {}",
            match cfg.terrain_type {
                TerrainType::Rigid => "RIGID",
                TerrainType::Granular => "GRANULAR",
            }
        )?;
        writeln!(out, "System settings")?;
        writeln!(out, "   Integration step size = {}", cfg.step_size)?;
        writeln!(
            out,
            "   Contact method = {}",
            match cfg.method {
                ContactMethod::Smc => "SMC",
                ContactMethod::Nsc => "NSC",
            }
        )?;
        writeln!(
            out,
            "   Collision envelope = {}",
            self.physics.config().collision_envelope
        )?;
        writeln!(out, "Container dimensions")?;
        writeln!(
            out,
            "   X = {}  Y = {}  Z = {}",
            2.0 * cfg.hdim_x,
            2.0 * cfg.hdim_y,
            2.0 * cfg.hdim_z
        )?;
        writeln!(out, "   wall thickness = {}", 2.0 * cfg.hthick)?;
        writeln!(out, "Terrain material properties")?;
        match cfg.material_terrain {
            SurfaceMaterial::Smc {
                friction,
                restitution,
                young_modulus,
                poisson_ratio,
                kn,
                gn,
                kt,
                gt,
            } => {
                writeln!(out, "   Coefficient of friction    = {}", friction)?;
                writeln!(out, "   Coefficient of restitution = {}", restitution)?;
                writeln!(out, "   Young modulus              = {}", young_modulus)?;
                writeln!(out, "   Poisson ratio              = {}", poisson_ratio)?;
                writeln!(out, "   Kn = {}", kn)?;
                writeln!(out, "   Gn = {}", gn)?;
                writeln!(out, "   Kt = {}", kt)?;
                writeln!(out, "   Gt = {}", gt)?;
            }
            SurfaceMaterial::Nsc {
                friction,
                restitution,
            } => {
                writeln!(out, "   Coefficient of friction    = {}", friction)?;
                writeln!(out, "   Coefficient of restitution = {}", restitution)?;
            }
        }
        writeln!(out, "Granular material properties")?;
        writeln!(out, "   particle radius  = {}", cfg.radius_g)?;
        writeln!(out, "   particle density = {}", cfg.rho_g)?;
        writeln!(out, "   number layers    = {}", cfg.num_layers)?;
        writeln!(out, "   number particles = {}", self.num_particles)?;
        writeln!(out, "Proxy body properties")?;
        writeln!(
            out,
            "   proxies fixed? {}",
            if cfg.fixed_proxies { "YES" } else { "NO" }
        )?;
        match cfg.terrain_type {
            TerrainType::Rigid => {
                writeln!(out, "   proxy radius = {}", cfg.radius_pn)?;
                writeln!(out, "   proxy mass = {}", cfg.mass_pn)?;
            }
            TerrainType::Granular => {
                writeln!(out, "   proxy mass = {}", cfg.mass_pf)?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

impl<T: Transport> Node for TerrainNode<T> {
    /// Startup sequence: reset simulated time, send the terrain height
    /// handshake to the vehicle rank, raise the platform's top face to the
    /// settled height, then service each tire rank in index order (topology
    /// handshake, material handshake, proxy creation).
    fn initialize(&mut self) -> anyhow::Result<()> {
        self.physics.set_time(0.0);

        let init_dim = [
            self.init_height,
            self.cfg.hdim_x + 2.0 * self.cfg.hlen_x,
        ];
        self.transport
            .send(VEHICLE_RANK, 0, Payload::F64(init_dim.to_vec()))?;
        info!(
            "sent initial terrain height = {} container half-length = {}",
            init_dim[0], init_dim[1]
        );

        // Adjust the platform box so its top face sits at init_height. The
        // bottom face stays where construction put it.
        {
            let mut collider = self.world.get::<&mut Collider>(self.platform)?;
            let collider = &mut *collider;
            if let ColliderShape::Box { half_extents } = &mut collider.shape {
                let zmin = collider.offset.z - half_extents.z;
                let height = self.init_height - zmin;
                half_extents.z = height / 2.0;
                collider.offset.z = zmin + height / 2.0;
            }
        }

        let mut start_vertex = 0;
        let mut start_triangle = 0;

        for which in 0..self.cfg.num_tires {
            // Tire contact surface specification.
            let counts = self
                .transport
                .recv(tire_rank(which), 0)?
                .into_u32(2)?;
            let (num_vertices, num_triangles) = (counts[0] as usize, counts[1] as usize);

            // Tire contact material properties; the proxies are created with
            // this material below.
            let props_vec = self.transport.recv(tire_rank(which), 0)?.into_f32(8)?;
            let mut props = [0.0f32; 8];
            props.copy_from_slice(&props_vec);
            let material = SurfaceMaterial::from_wire(self.cfg.method, &props);

            info!(
                "tire {}: vertices = {} triangles = {} friction = {}",
                which,
                num_vertices,
                num_triangles,
                material.friction()
            );

            let mut tire = TireData::new(
                num_vertices,
                num_triangles,
                start_vertex,
                start_triangle,
                material,
            );
            start_vertex += num_vertices;
            start_triangle += num_triangles;

            match self.cfg.terrain_type {
                TerrainType::Rigid => proxy::create_node_proxies(
                    &mut self.world,
                    &mut tire,
                    self.cfg.mass_pn,
                    self.cfg.radius_pn,
                    self.cfg.fixed_proxies,
                ),
                TerrainType::Granular => proxy::create_face_proxies(
                    &mut self.world,
                    &mut tire,
                    self.cfg.mass_pf,
                    self.cfg.fixed_proxies,
                ),
            }

            self.tires.push(tire);
        }

        Ok(())
    }

    /// Per-step exchange: receive every tire's mesh state and update all
    /// proxies first, recompute cumulative contact forces once for the whole
    /// system, then extract and send per-vertex forces back to each tire.
    /// No forces are reported at step 0; nothing has been computed against
    /// fully initialized proxy state yet.
    fn synchronize(&mut self, step_number: usize, _time: f64) -> anyhow::Result<()> {
        let tag = step_number as u32;

        for which in 0..self.cfg.num_tires {
            let (num_vertices, num_triangles) = {
                let tire = &self.tires[which];
                (tire.num_vertices, tire.num_triangles)
            };

            let vert_data = self
                .transport
                .recv(tire_rank(which), tag)?
                .into_f64(2 * 3 * num_vertices)?;
            let tri_data = self
                .transport
                .recv(tire_rank(which), tag)?
                .into_i32(3 * num_triangles)?;

            {
                let tire = &mut self.tires[which];
                for iv in 0..num_vertices {
                    let p = 3 * iv;
                    let v = p + 3 * num_vertices;
                    tire.vertex_states[iv].position =
                        DVec3::new(vert_data[p], vert_data[p + 1], vert_data[p + 2]);
                    tire.vertex_states[iv].velocity =
                        DVec3::new(vert_data[v], vert_data[v + 1], vert_data[v + 2]);
                }
                for it in 0..num_triangles {
                    tire.triangles[it] = [
                        tri_data[3 * it] as usize,
                        tri_data[3 * it + 1] as usize,
                        tri_data[3 * it + 2] as usize,
                    ];
                }
            }

            let tire = &self.tires[which];
            match self.cfg.terrain_type {
                TerrainType::Rigid => proxy::update_node_proxies(&mut self.world, tire),
                TerrainType::Granular => proxy::update_face_proxies(&mut self.world, tire),
            }
        }

        // One shared recomputation; force values reflect the simultaneous
        // placement of every tire for this step.
        self.physics.calculate_contact_forces();

        let mut reported = Vec::with_capacity(self.cfg.num_tires);
        for which in 0..self.cfg.num_tires {
            let (indices, forces) = if step_number > 0 {
                match self.cfg.terrain_type {
                    TerrainType::Rigid => {
                        proxy::collect_node_proxy_forces(&self.physics, &self.tires[which])
                    }
                    TerrainType::Granular => {
                        proxy::collect_face_proxy_forces(&self.physics, &self.tires[which])
                    }
                }
            } else {
                (Vec::new(), Vec::new())
            };

            reported.push(indices.len());
            self.transport
                .send(tire_rank(which), tag, Payload::I32(indices))?;
            self.transport
                .send(tire_rank(which), tag, Payload::F64(forces))?;
        }

        debug!(
            "step {}: contacts = {} reported vertices = {:?}",
            step_number,
            self.physics.contact_count(),
            reported
        );
        Ok(())
    }

    /// Advance the local physics over `step_size`, in sub-steps no larger
    /// than the node's internal step size.
    fn advance(&mut self, step_size: f64) -> anyhow::Result<()> {
        let start = Instant::now();
        let mut t = 0.0;
        while t < step_size {
            let h = self.cfg.step_size.min(step_size - t);
            self.physics.step(&mut self.world, h);
            t += h;
        }
        self.cum_sim_time += start.elapsed();
        Ok(())
    }

    /// Write the frame inspection file.
    fn output_data(&mut self, frame: usize) -> anyhow::Result<()> {
        let path = self.node_out_dir.join(format!("data_{:04}.dat", frame + 1));
        self.write_snapshot(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosim::transport::{router, Endpoint};
    use crate::cosim::TERRAIN_RANK;
    use std::thread::JoinHandle;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "regolith-node-{}-{}",
            std::process::id(),
            name
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn pack_vertex_states(positions: &[DVec3], velocities: &[DVec3]) -> Vec<f64> {
        let mut data = Vec::with_capacity(6 * positions.len());
        for p in positions {
            data.extend_from_slice(&[p.x, p.y, p.z]);
        }
        for v in velocities {
            data.extend_from_slice(&[v.x, v.y, v.z]);
        }
        data
    }

    fn spawn_vehicle(mut endpoint: Endpoint) -> JoinHandle<Vec<f64>> {
        std::thread::spawn(move || {
            endpoint
                .recv(TERRAIN_RANK, 0)
                .unwrap()
                .into_f64(2)
                .unwrap()
        })
    }

    /// Tire-rank counterparty: topology + material handshakes, then one
    /// mesh-state send and force receive per entry in `steps`.
    fn spawn_tire(
        mut endpoint: Endpoint,
        num_vertices: usize,
        num_triangles: usize,
        triangles: Vec<i32>,
        steps: Vec<Vec<f64>>,
    ) -> JoinHandle<Vec<(Vec<i32>, Vec<f64>)>> {
        std::thread::spawn(move || {
            endpoint
                .send(
                    TERRAIN_RANK,
                    0,
                    Payload::U32(vec![num_vertices as u32, num_triangles as u32]),
                )
                .unwrap();
            endpoint
                .send(
                    TERRAIN_RANK,
                    0,
                    Payload::F32(vec![0.8, 0.1, 2e5, 0.3, 2e5, 40.0, 2e5, 20.0]),
                )
                .unwrap();

            let mut replies = Vec::new();
            for (step, vert_data) in steps.into_iter().enumerate() {
                let tag = step as u32;
                endpoint
                    .send(TERRAIN_RANK, tag, Payload::F64(vert_data))
                    .unwrap();
                endpoint
                    .send(TERRAIN_RANK, tag, Payload::I32(triangles.clone()))
                    .unwrap();

                let payload = endpoint.recv(TERRAIN_RANK, tag).unwrap();
                let count = payload.len();
                let indices = payload.into_i32(count).unwrap();
                let payload = endpoint.recv(TERRAIN_RANK, tag).unwrap();
                assert_eq!(payload.len(), 3 * count, "force array must match indices");
                let forces = payload.into_f64(3 * count).unwrap();
                replies.push((indices, forces));
            }
            replies
        })
    }

    #[test]
    fn test_initialize_offsets_monotonic() {
        let mut endpoints = router(4).into_iter();
        let vehicle = endpoints.next().unwrap();
        let terrain = endpoints.next().unwrap();
        let tire0 = endpoints.next().unwrap();
        let tire1 = endpoints.next().unwrap();

        let vehicle_handle = spawn_vehicle(vehicle);
        let t0 = spawn_tire(tire0, 4, 2, vec![0, 1, 2, 1, 2, 3], Vec::new());
        let t1 = spawn_tire(tire1, 6, 3, vec![0, 1, 2, 1, 2, 3, 2, 3, 4], Vec::new());

        let mut node = TerrainNodeBuilder::new(TerrainType::Rigid, ContactMethod::Smc, 2)
            .container_dimensions(2.0, 0.5, 1.0, 0.2)
            .platform_length(0.5)
            .node_proxies(1.0, 0.01, false)
            .out_dir(scratch_dir("offsets"))
            .build(terrain)
            .unwrap();
        node.initialize().unwrap();

        let tires = node.tires();
        assert_eq!(tires[0].start_vertex, 0);
        assert_eq!(tires[0].start_triangle, 0);
        assert_eq!(
            tires[1].start_vertex,
            tires[0].start_vertex + tires[0].num_vertices
        );
        assert_eq!(
            tires[1].start_triangle,
            tires[0].start_triangle + tires[0].num_triangles
        );
        assert_eq!(tires[0].proxies.len(), 4);
        assert_eq!(tires[1].proxies.len(), 6);

        // Vehicle handshake: init height (zero, no settling) and the
        // container half-length extended by the platform.
        let handshake = vehicle_handle.join().unwrap();
        assert_eq!(handshake[0], 0.0);
        assert_eq!(handshake[1], 1.0 + 2.0 * 0.25);

        t0.join().unwrap();
        t1.join().unwrap();
    }

    #[test]
    fn test_step_zero_silent_then_forces_reported() {
        let mut endpoints = router(3).into_iter();
        let vehicle = endpoints.next().unwrap();
        let terrain = endpoints.next().unwrap();
        let tire0 = endpoints.next().unwrap();

        let positions = vec![DVec3::new(0.0, 0.0, 1.0), DVec3::new(0.1, 0.0, 1.0)];
        let velocities = vec![DVec3::new(1.0, 0.0, 0.0), DVec3::new(0.0, 1.0, 0.0)];
        let mesh = pack_vertex_states(&positions, &velocities);

        let vehicle_handle = spawn_vehicle(vehicle);
        let tire_handle = spawn_tire(
            tire0,
            2,
            1,
            vec![0, 1, 1],
            vec![mesh.clone(), mesh.clone()],
        );

        let mut node = TerrainNodeBuilder::new(TerrainType::Rigid, ContactMethod::Smc, 1)
            .node_proxies(1.0, 0.01, false)
            .out_dir(scratch_dir("step-zero"))
            .build(terrain)
            .unwrap();
        node.initialize().unwrap();

        // A nonzero contact force on proxy 0, visible to both steps.
        let loaded = node.tires()[0].proxies[0].body;
        node.physics
            .inject_step_record(loaded, DVec3::new(0.0, 0.0, 5.0), 1e-4);

        node.synchronize(0, 0.0).unwrap();
        node.synchronize(1, 1e-3).unwrap();

        // Proxy state tracks the received mesh.
        let body = node.tires()[0].proxies[1].body;
        let pose = *node.world.get::<&Pose>(body).unwrap();
        assert_eq!(pose.position, positions[1]);
        let rb = node.world.get::<&RigidBody>(body).unwrap();
        assert_eq!(rb.linear_velocity, velocities[1]);
        drop(rb);

        let replies = tire_handle.join().unwrap();

        // Step 0 always sends empty arrays, contact state notwithstanding.
        assert!(replies[0].0.is_empty());
        assert!(replies[0].1.is_empty());

        // Step 1 reports the loaded vertex only (zero forces are filtered).
        assert_eq!(replies[1].0, vec![0]);
        let f = &replies[1].1;
        assert_eq!(f.len(), 3);
        assert!((DVec3::new(f[0], f[1], f[2]) - DVec3::new(0.0, 0.0, 5.0)).length() < 1e-12);

        vehicle_handle.join().unwrap();
    }

    #[test]
    fn test_face_proxy_forces_conserved_and_accumulated() {
        let mut endpoints = router(3).into_iter();
        let vehicle = endpoints.next().unwrap();
        let terrain = endpoints.next().unwrap();
        let tire0 = endpoints.next().unwrap();

        let positions = vec![
            DVec3::new(0.0, 0.0, 0.5),
            DVec3::new(0.1, 0.0, 0.5),
            DVec3::new(0.0, 0.1, 0.5),
            DVec3::new(0.1, 0.1, 0.5),
        ];
        let velocities = vec![DVec3::ZERO; 4];
        let mesh = pack_vertex_states(&positions, &velocities);

        let vehicle_handle = spawn_vehicle(vehicle);
        let tire_handle = spawn_tire(
            tire0,
            4,
            2,
            vec![0, 1, 2, 1, 2, 3],
            vec![mesh.clone(), mesh.clone()],
        );

        let mut node = TerrainNodeBuilder::new(TerrainType::Granular, ContactMethod::Smc, 1)
            .container_dimensions(0.4, 0.2, 0.2, 0.05)
            .granular_material(0.02, 2000.0, 1)
            .out_dir(scratch_dir("face-forces"))
            .build(terrain)
            .unwrap();
        node.initialize().unwrap();
        assert_eq!(node.tires()[0].proxies.len(), 2);

        let f0 = DVec3::new(3.0, 0.0, 0.0);
        let f1 = DVec3::new(0.0, 0.0, 6.0);
        node.physics
            .inject_step_record(node.tires()[0].proxies[0].body, f0, 1e-4);
        node.physics
            .inject_step_record(node.tires()[0].proxies[1].body, f1, 1e-4);

        node.synchronize(0, 0.0).unwrap();

        // The face proxy was reconstructed at its triangle's centroid.
        let body = node.tires()[0].proxies[0].body;
        let pose = *node.world.get::<&Pose>(body).unwrap();
        let centroid = (positions[0] + positions[1] + positions[2]) / 3.0;
        assert!((pose.position - centroid).length() < 1e-12);

        node.synchronize(1, 1e-3).unwrap();

        let replies = tire_handle.join().unwrap();
        assert!(replies[0].0.is_empty());

        let (indices, forces) = &replies[1];
        assert_eq!(indices.len(), 4, "each vertex reported at most once");

        let lookup = |v: i32| -> DVec3 {
            let k = indices.iter().position(|&i| i == v).unwrap();
            DVec3::new(forces[3 * k], forces[3 * k + 1], forces[3 * k + 2])
        };
        assert!((lookup(0) - f0 / 3.0).length() < 1e-12);
        assert!((lookup(3) - f1 / 3.0).length() < 1e-12);
        assert!((lookup(1) - (f0 + f1) / 3.0).length() < 1e-12);
        assert!((lookup(2) - (f0 + f1) / 3.0).length() < 1e-12);

        // Redistribution conserves the total force.
        let total: DVec3 = (0..4).map(|v| lookup(v as i32)).sum();
        assert!((total - (f0 + f1)).length() < 1e-12);

        vehicle_handle.join().unwrap();
    }

    #[test]
    fn test_settle_height_and_platform_refit() {
        let mut endpoints = router(2).into_iter();
        let vehicle = endpoints.next().unwrap();
        let terrain = endpoints.next().unwrap();

        let mut node = TerrainNodeBuilder::new(TerrainType::Granular, ContactMethod::Smc, 0)
            .container_dimensions(0.6, 0.4, 0.4, 0.1)
            .granular_material(0.05, 2000.0, 2)
            .settling_time(0.05)
            .step_size(1e-3)
            .out_dir(scratch_dir("settle"))
            .build(terrain)
            .unwrap();

        assert!(node.num_particles() > 0, "layers must generate particles");

        node.settle().unwrap();

        // Two layers of radius-0.05 particles: loose lower bound from the
        // layer count.
        let radius = 0.05;
        let layers = 2.0;
        assert!(
            node.init_height() >= (layers - 1.0) * 2.0 * radius,
            "init height = {}",
            node.init_height()
        );
        assert!(node.simulation_time() > 0.0);

        let vehicle_handle = spawn_vehicle(vehicle);
        node.initialize().unwrap();

        let handshake = vehicle_handle.join().unwrap();
        assert_eq!(handshake[0], node.init_height());

        // The platform's top face now sits exactly at init height.
        let collider = node.world.get::<&Collider>(node.platform).unwrap();
        if let ColliderShape::Box { half_extents } = &collider.shape {
            let top = collider.offset.z + half_extents.z;
            assert!(
                (top - node.init_height()).abs() < 1e-12,
                "platform top = {}, init height = {}",
                top,
                node.init_height()
            );
        } else {
            panic!("platform must keep a box collider");
        }
        drop(collider);

        // Advance subdivides into internal sub-steps.
        let before = node.simulation_time();
        node.advance(0.01).unwrap();
        assert!((node.simulation_time() - before - 0.01).abs() < 1e-9);

        node.output_data(0).unwrap();
        assert!(node.node_out_dir.join("data_0001.dat").exists());
        assert!(node.node_out_dir.join("settings.dat").exists());
    }

    #[test]
    fn test_checkpoint_restore_matches_settled_state() {
        let out_dir = scratch_dir("ckpt-roundtrip");
        let builder = || {
            TerrainNodeBuilder::new(TerrainType::Granular, ContactMethod::Smc, 0)
                .container_dimensions(0.6, 0.4, 0.4, 0.1)
                .granular_material(0.05, 2000.0, 2)
                .settling_time(0.02)
                .step_size(1e-3)
                .out_dir(out_dir.clone())
        };

        let mut endpoints = router(2).into_iter();
        let _vehicle = endpoints.next().unwrap();
        let terrain = endpoints.next().unwrap();
        let mut first = builder().build(terrain).unwrap();
        first.settle().unwrap();
        first.write_checkpoint().unwrap();

        let mut endpoints = router(2).into_iter();
        let _vehicle = endpoints.next().unwrap();
        let terrain = endpoints.next().unwrap();
        let mut second = builder().use_checkpoint(true).build(terrain).unwrap();
        second.settle().unwrap();

        assert_eq!(first.num_particles(), second.num_particles());
        assert_eq!(first.init_height(), second.init_height());

        for (&a, &b) in first.particles.iter().zip(&second.particles) {
            let id_a = first.world.get::<&BodyId>(a).unwrap().0;
            let id_b = second.world.get::<&BodyId>(b).unwrap().0;
            assert_eq!(id_a, id_b);

            let pose_a = *first.world.get::<&Pose>(a).unwrap();
            let pose_b = *second.world.get::<&Pose>(b).unwrap();
            assert_eq!(pose_a.position, pose_b.position, "positions restore exactly");
            assert_eq!(pose_a.rotation, pose_b.rotation);

            let vel_a = first.world.get::<&RigidBody>(a).unwrap().linear_velocity;
            let vel_b = second.world.get::<&RigidBody>(b).unwrap().linear_velocity;
            assert_eq!(vel_a, vel_b);
        }
    }

    #[test]
    fn test_checkpoint_count_mismatch_is_fatal() {
        let out_dir = scratch_dir("ckpt-mismatch");
        let builder = |layers: usize| {
            TerrainNodeBuilder::new(TerrainType::Granular, ContactMethod::Smc, 0)
                .container_dimensions(0.6, 0.4, 0.4, 0.1)
                .granular_material(0.05, 2000.0, layers)
                .settling_time(0.01)
                .step_size(1e-3)
                .out_dir(out_dir.clone())
        };

        let mut endpoints = router(2).into_iter();
        let _vehicle = endpoints.next().unwrap();
        let terrain = endpoints.next().unwrap();
        let mut first = builder(2).build(terrain).unwrap();
        first.settle().unwrap();
        first.write_checkpoint().unwrap();

        let mut endpoints = router(2).into_iter();
        let mut vehicle = endpoints.next().unwrap();
        let terrain = endpoints.next().unwrap();
        let mut second = builder(1).use_checkpoint(true).build(terrain).unwrap();

        let err = second.settle().unwrap_err();
        assert!(
            err.to_string().contains("particles"),
            "unexpected error: {}",
            err
        );

        // The abort tore down the transport: the vehicle rank now observes a
        // disconnected peer instead of a handshake.
        assert!(vehicle.recv(TERRAIN_RANK, 0).is_err());
    }
}

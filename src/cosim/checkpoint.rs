//! Checkpoint and inspection-file record layouts.
//!
//! All files are plain text, one record per line, space separated. Values
//! are written with Rust's shortest round-trip `f64` formatting, so a
//! checkpoint restored on the same platform reproduces state bit for bit.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use glam::{DQuat, DVec3};
use thiserror::Error;

/// Name of the restart file within the run's output directory.
pub const CHECKPOINT_FILENAME: &str = "checkpoint.dat";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint holds {found} particles, expected {expected}")]
    ParticleCountMismatch { expected: usize, found: usize },
    #[error("particle {index} has identifier {found}, expected {expected}")]
    IdentifierMismatch {
        index: usize,
        expected: i64,
        found: i64,
    },
    #[error("malformed checkpoint record at line {line}")]
    Parse { line: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// State of one granular particle as stored in a checkpoint:
/// `identifier position(3) orientation(4) linear-velocity(3) rotation-rate(4)`.
#[derive(Debug, Clone, Copy)]
pub struct ParticleRecord {
    pub id: i64,
    pub position: DVec3,
    pub rotation: DQuat,
    pub linear_velocity: DVec3,
    /// Quaternion rate, stored scalar-first like the orientation.
    pub rotation_rate: DQuat,
}

/// Parsed checkpoint file.
#[derive(Debug)]
pub struct Checkpoint {
    pub time: f64,
    pub particles: Vec<ParticleRecord>,
}

/// Quaternion rate equivalent to a body-frame-free angular velocity:
/// `q_dot = 0.5 * omega_quat * q`.
pub fn rotation_rate(rotation: DQuat, omega: DVec3) -> DQuat {
    let omega_quat = DQuat::from_xyzw(omega.x, omega.y, omega.z, 0.0);
    omega_quat * rotation * 0.5
}

/// Angular velocity recovered from a quaternion rate (unit `rotation`):
/// `omega_quat = 2 * q_dot * q^-1`.
pub fn angular_velocity(rotation: DQuat, rate: DQuat) -> DVec3 {
    let omega_quat = rate * rotation.conjugate() * 2.0;
    DVec3::new(omega_quat.x, omega_quat.y, omega_quat.z)
}

/// Write a checkpoint: current time, particle count, then one record per
/// particle in body-creation order.
pub fn write_checkpoint(
    path: &Path,
    time: f64,
    particles: &[ParticleRecord],
) -> Result<(), CheckpointError> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", time)?;
    writeln!(out, "{}", particles.len())?;
    for p in particles {
        writeln!(
            out,
            "{} {} {} {} {} {} {} {} {} {} {} {} {} {} {}",
            p.id,
            p.position.x,
            p.position.y,
            p.position.z,
            p.rotation.w,
            p.rotation.x,
            p.rotation.y,
            p.rotation.z,
            p.linear_velocity.x,
            p.linear_velocity.y,
            p.linear_velocity.z,
            p.rotation_rate.w,
            p.rotation_rate.x,
            p.rotation_rate.y,
            p.rotation_rate.z,
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Read a checkpoint written by [`write_checkpoint`].
pub fn read_checkpoint(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();

    let mut line_no = 0usize;
    let mut next_line = |lines: &mut std::io::Lines<BufReader<File>>| -> Result<String, CheckpointError> {
        line_no += 1;
        match lines.next() {
            Some(Ok(line)) => Ok(line),
            Some(Err(e)) => Err(CheckpointError::Io(e)),
            None => Err(CheckpointError::Parse { line: line_no }),
        }
    };

    let time: f64 = next_line(&mut lines)?
        .trim()
        .parse()
        .map_err(|_| CheckpointError::Parse { line: 1 })?;
    let count: usize = next_line(&mut lines)?
        .trim()
        .parse()
        .map_err(|_| CheckpointError::Parse { line: 2 })?;

    let mut particles = Vec::with_capacity(count);
    for index in 0..count {
        let line = next_line(&mut lines)?;
        let parse_error = CheckpointError::Parse { line: index + 3 };

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 15 {
            return Err(parse_error);
        }
        let id: i64 = tokens[0].parse().map_err(|_| CheckpointError::Parse { line: index + 3 })?;
        let mut values = [0.0f64; 14];
        for (slot, token) in values.iter_mut().zip(&tokens[1..]) {
            *slot = token
                .parse()
                .map_err(|_| CheckpointError::Parse { line: index + 3 })?;
        }

        particles.push(ParticleRecord {
            id,
            position: DVec3::new(values[0], values[1], values[2]),
            rotation: DQuat::from_xyzw(values[4], values[5], values[6], values[3]),
            linear_velocity: DVec3::new(values[7], values[8], values[9]),
            rotation_rate: DQuat::from_xyzw(values[11], values[12], values[13], values[10]),
        });
    }

    Ok(Checkpoint { time, particles })
}

/// Write a settling/inspection snapshot: current time, then
/// `particle-count radius`, then `identifier position(3) velocity(3)` rows.
pub fn write_particle_snapshot(
    path: &Path,
    time: f64,
    radius: f64,
    rows: &[(i64, DVec3, DVec3)],
) -> Result<(), CheckpointError> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", time)?;
    writeln!(out, "{} {}", rows.len(), radius)?;
    for (id, pos, vel) in rows {
        writeln!(
            out,
            "{} {} {} {} {} {} {}",
            id, pos.x, pos.y, pos.z, vel.x, vel.y, vel.z
        )?;
    }
    out.flush()?;
    Ok(())
}

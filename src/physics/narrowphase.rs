//! Narrowphase collision detection: specialized pair tests.
//!
//! The terrain node only ever creates three collider kinds (spheres for
//! particles and node proxies, boxes for the platform and container walls,
//! triangles for face proxies), so the dispatch below covers every pair the
//! broadphase can produce. Unsupported combinations yield no contact.

use glam::{DMat3, DVec3};

use super::collider::{Collider, ColliderShape};
use super::contact::ContactInfo;
use super::rigid_body::Pose;

/// Sphere-sphere intersection test. Normal points from A to B.
pub fn sphere_sphere(
    center_a: DVec3,
    radius_a: f64,
    center_b: DVec3,
    radius_b: f64,
) -> Option<ContactInfo> {
    let diff = center_b - center_a;
    let dist_sq = diff.length_squared();
    let min_dist = radius_a + radius_b;

    if dist_sq >= min_dist * min_dist {
        return None;
    }

    let dist = dist_sq.sqrt();
    let normal = if dist > 1e-12 { diff / dist } else { DVec3::Z };

    let penetration = min_dist - dist;
    let point = center_a + normal * (radius_a - penetration * 0.5);

    Some(ContactInfo {
        normal,
        penetration,
        point,
    })
}

/// Sphere-box intersection test. Normal points from the box to the sphere.
pub fn sphere_box(
    sphere_center: DVec3,
    radius: f64,
    box_center: DVec3,
    half_extents: DVec3,
    box_rot: DMat3,
) -> Option<ContactInfo> {
    // Sphere center in the box frame.
    let local = box_rot.transpose() * (sphere_center - box_center);
    let clamped = local.clamp(-half_extents, half_extents);
    let closest_local = clamped;
    let delta = local - closest_local;
    let dist_sq = delta.length_squared();

    if dist_sq >= radius * radius {
        return None;
    }

    let (normal_local, penetration) = if dist_sq > 1e-24 {
        let dist = dist_sq.sqrt();
        (delta / dist, radius - dist)
    } else {
        // Center inside the box: push out along the axis of least depth.
        let depths = half_extents - local.abs();
        let (axis, depth) = if depths.x <= depths.y && depths.x <= depths.z {
            (DVec3::X * local.x.signum(), depths.x)
        } else if depths.y <= depths.z {
            (DVec3::Y * local.y.signum(), depths.y)
        } else {
            (DVec3::Z * local.z.signum(), depths.z)
        };
        (axis, depth + radius)
    };

    let normal = box_rot * normal_local;
    let point = box_center + box_rot * closest_local;

    Some(ContactInfo {
        normal,
        penetration,
        point,
    })
}

/// Sphere-triangle intersection test against a world-space triangle.
/// Normal points from the triangle to the sphere.
pub fn sphere_triangle(
    sphere_center: DVec3,
    radius: f64,
    tri: [DVec3; 3],
) -> Option<ContactInfo> {
    let closest = closest_point_on_triangle(sphere_center, tri[0], tri[1], tri[2]);
    let delta = sphere_center - closest;
    let dist_sq = delta.length_squared();

    if dist_sq >= radius * radius {
        return None;
    }

    let normal = if dist_sq > 1e-24 {
        delta / dist_sq.sqrt()
    } else {
        // Center on the triangle plane: fall back to the face normal.
        (tri[1] - tri[0]).cross(tri[2] - tri[0]).normalize_or_zero()
    };

    Some(ContactInfo {
        normal,
        penetration: radius - dist_sq.sqrt(),
        point: closest,
    })
}

/// Find the closest point on triangle {a, b, c} to point p.
pub fn closest_point_on_triangle(p: DVec3, a: DVec3, b: DVec3, c: DVec3) -> DVec3 {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = p - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

fn world_triangle(vertices: &[DVec3; 3], offset: DVec3, pose: &Pose) -> [DVec3; 3] {
    [
        pose.transform_point(offset + vertices[0]),
        pose.transform_point(offset + vertices[1]),
        pose.transform_point(offset + vertices[2]),
    ]
}

/// Detect collision between two colliders, dispatching to the specialized
/// test for the pair. The returned normal always points from A to B.
pub fn detect_collision(
    collider_a: &Collider,
    pose_a: &Pose,
    collider_b: &Collider,
    pose_b: &Pose,
) -> Option<ContactInfo> {
    let center_a = pose_a.transform_point(collider_a.offset);
    let center_b = pose_b.transform_point(collider_b.offset);

    match (&collider_a.shape, &collider_b.shape) {
        (ColliderShape::Sphere { radius: ra }, ColliderShape::Sphere { radius: rb }) => {
            sphere_sphere(center_a, *ra, center_b, *rb)
        }
        (ColliderShape::Sphere { radius }, ColliderShape::Box { half_extents }) => {
            // sphere_box reports box->sphere; flip to A->B.
            sphere_box(
                center_a,
                *radius,
                center_b,
                *half_extents,
                DMat3::from_quat(pose_b.rotation),
            )
            .map(flip)
        }
        (ColliderShape::Box { half_extents }, ColliderShape::Sphere { radius }) => sphere_box(
            center_b,
            *radius,
            center_a,
            *half_extents,
            DMat3::from_quat(pose_a.rotation),
        ),
        (ColliderShape::Sphere { radius }, ColliderShape::Triangle { vertices }) => {
            sphere_triangle(
                center_a,
                *radius,
                world_triangle(vertices, collider_b.offset, pose_b),
            )
            .map(flip)
        }
        (ColliderShape::Triangle { vertices }, ColliderShape::Sphere { radius }) => {
            sphere_triangle(
                center_b,
                *radius,
                world_triangle(vertices, collider_a.offset, pose_a),
            )
        }
        _ => None,
    }
}

fn flip(info: ContactInfo) -> ContactInfo {
    ContactInfo {
        normal: -info.normal,
        ..info
    }
}

//! Geometry primitives shared by playback and correction.
//!
//! Poses are `nalgebra` isometries expressed in the world (odometry) frame.
//! Timestamps are seconds on the teach timeline.

use nalgebra::{Isometry3, Point3, Quaternion, Translation3, UnitQuaternion, Vector3};

/// A rigid pose: position + orientation.
pub type Pose = Isometry3<f64>;

/// Build a pose from a position and an `(x, y, z, w)` quaternion.
///
/// The quaternion is normalized, so slightly denormalized records are accepted.
pub fn pose_from_parts(position: [f64; 3], orientation: [f64; 4]) -> Pose {
    let [qx, qy, qz, qw] = orientation;
    Isometry3::from_parts(
        Translation3::new(position[0], position[1], position[2]),
        UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz)),
    )
}

/// Planar pose helper: position on the ground plane and a heading in radians.
pub fn planar_pose(x: f64, y: f64, heading: f64) -> Pose {
    Isometry3::from_parts(
        Translation3::new(x, y, 0.0),
        UnitQuaternion::from_axis_angle(&Vector3::z_axis(), heading),
    )
}

/// Transform that maps coordinates expressed in the `from` frame into the `to` frame.
pub fn transform_between(from: &Pose, to: &Pose) -> Pose {
    to.inverse() * from
}

/// A velocity command.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Twist {
    pub linear: Vector3<f64>,
    pub angular: Vector3<f64>,
}

impl Twist {
    pub fn new(linear: Vector3<f64>, angular: Vector3<f64>) -> Self {
        Self { linear, angular }
    }

    /// Ground-robot command: forward speed and yaw rate.
    pub fn planar(forward: f64, yaw_rate: f64) -> Self {
        Self {
            linear: Vector3::new(forward, 0.0, 0.0),
            angular: Vector3::new(0.0, 0.0, yaw_rate),
        }
    }

    /// The neutral command sent whenever playback stops.
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.linear == Vector3::zeros() && self.angular == Vector3::zeros()
    }
}

/// A timestamped 3D point cloud.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    /// Acquisition time of the scan, in seconds.
    pub stamp: f64,
    pub points: Vec<Point3<f64>>,
}

impl PointCloud {
    pub fn new(stamp: f64, points: Vec<Point3<f64>>) -> Self {
        Self { stamp, points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Copy of this cloud with every point moved by `transform`.
    pub fn transformed(&self, transform: &Pose) -> PointCloud {
        PointCloud {
            stamp: self.stamp,
            points: self
                .points
                .iter()
                .map(|p| transform.transform_point(p))
                .collect(),
        }
    }
}

/// Control error extracted from a registration result.
///
/// `x` is along-track (positive = ahead of the reference), `y` is cross-track
/// (positive = left of the reference) and `heading` is the yaw offset in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseError {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl PoseError {
    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Self { x, y, heading }
    }

    /// Control error of the transform that aligns the live reading onto the reference.
    pub fn from_transform(transform: &Pose) -> Self {
        let t = transform.translation.vector;
        let (_, _, yaw) = transform.rotation.euler_angles();
        Self {
            x: t.x,
            y: t.y,
            heading: yaw,
        }
    }
}

/// Distance between two poses, used to pick the nearest anchor point.
pub trait PoseDistance: Send + Sync {
    fn distance(&self, a: &Pose, b: &Pose) -> f64;
}

impl<F> PoseDistance for F
where
    F: Fn(&Pose, &Pose) -> f64 + Send + Sync,
{
    fn distance(&self, a: &Pose, b: &Pose) -> f64 {
        self(a, b)
    }
}

/// Position-dominant distance: euclidean distance plus a weighted rotation angle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedDistance {
    /// Meters per radian of orientation difference.
    pub angular_weight: f64,
}

impl Default for WeightedDistance {
    fn default() -> Self {
        Self {
            angular_weight: 0.1,
        }
    }
}

impl PoseDistance for WeightedDistance {
    fn distance(&self, a: &Pose, b: &Pose) -> f64 {
        let linear = (a.translation.vector - b.translation.vector).norm();
        let angular = a.rotation.angle_to(&b.rotation);
        linear + self.angular_weight * angular
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_transform_between_maps_into_target_frame() {
        let robot = planar_pose(2.0, 0.0, 0.0);
        let anchor = planar_pose(1.0, 0.0, FRAC_PI_2);
        let t = transform_between(&robot, &anchor);

        // Robot origin sits 1m along the anchor's -y axis once the anchor faces +y.
        let p = t.transform_point(&Point3::origin());
        assert!((p.x - 0.0).abs() < 1e-9);
        assert!((p.y + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pose_error_from_transform() {
        let t = planar_pose(0.3, -0.2, 0.1);
        let e = PoseError::from_transform(&t);
        assert!((e.x - 0.3).abs() < 1e-9);
        assert!((e.y + 0.2).abs() < 1e-9);
        assert!((e.heading - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_distance_is_position_dominant() {
        let d = WeightedDistance::default();
        let origin = planar_pose(0.0, 0.0, 0.0);
        let moved = planar_pose(1.0, 0.0, 0.0);
        let turned = planar_pose(0.0, 0.0, 1.0);
        assert!((d.distance(&origin, &moved) - 1.0).abs() < 1e-9);
        assert!((d.distance(&origin, &turned) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_cloud_transform_keeps_stamp() {
        let cloud = PointCloud::new(4.5, vec![Point3::new(1.0, 0.0, 0.0)]);
        let moved = cloud.transformed(&planar_pose(0.0, 1.0, 0.0));
        assert_eq!(moved.stamp, 4.5);
        assert!((moved.points[0] - Point3::new(1.0, 1.0, 0.0)).norm() < 1e-9);
    }

    #[test]
    fn test_idle_twist() {
        assert!(Twist::idle().is_idle());
        assert!(!Twist::planar(0.5, 0.0).is_idle());
    }
}

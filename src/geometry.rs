use nalgebra::{Isometry3, Matrix3, Point3, Quaternion, Translation3, UnitQuaternion, Vector3};

/// Rigid transform `target_from_source`.
///
/// Composition follows the usual convention: `(a * b).transform_point(p)` applies `b`
/// first, so `cam_from_world = cam_from_rig * rig_from_world`.
pub type Pose = Isometry3<f64>;

/// Build a rotation from `(x, y, z, w)` quaternion components, normalising on the way.
pub fn quaternion_from_xyzw(x: f64, y: f64, z: f64, w: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z))
}

pub fn pose_from_parts(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Pose {
    Isometry3::from_parts(Translation3::from(translation), rotation)
}

/// `R_cam_from_world = R_cam_from_rig * R_rig_from_world` and
/// `t_cam_from_world = R_cam_from_rig * t_rig_from_world + t_cam_from_rig`.
pub fn compose(cam_from_rig: &Pose, rig_from_world: &Pose) -> Pose {
    cam_from_rig * rig_from_world
}

/// Camera center in world coordinates: `-(R^T * t)`.
pub fn camera_center(cam_from_world: &Pose) -> Point3<f64> {
    Point3::from(-(rotation_matrix(cam_from_world).transpose() * cam_from_world.translation.vector))
}

pub fn rotation_matrix(pose: &Pose) -> Matrix3<f64> {
    pose.rotation.to_rotation_matrix().into_inner()
}

/// Angle in radians of the relative rotation between two camera orientations.
pub fn rotation_distance(a: &Pose, b: &Pose) -> f64 {
    a.rotation.angle_to(&b.rotation)
}

/// Euclidean distance between the two camera centers.
pub fn center_distance(a: &Pose, b: &Pose) -> f64 {
    (camera_center(a) - camera_center(b)).norm()
}

use crate::scene::{CameraParams, SceneDescription, SceneObject};

/// Fixed optics used for every auto-placed camera. Repeated runs on
/// identical geometry must produce an identical camera, so nothing here is
/// randomized or configurable per job.
pub const FOCAL_LENGTH_MM: f64 = 50.0;
pub const SENSOR_WIDTH_MM: f64 = 36.0;
/// Safety margin applied on top of the exact framing distance.
pub const DISTANCE_MARGIN: f64 = 1.5;
/// Hard floor on camera distance.
pub const MIN_DISTANCE: f64 = 5.0;
/// Substitute extent for a degenerate (single-point) bounding box.
pub const MIN_SIZE: f64 = 1.0;
/// Downward tilt of the auto camera, radians (30 degrees).
pub const TILT_RAD: f64 = std::f64::consts::FRAC_PI_6;

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CameraTransform {
    pub location: [f64; 3],
    pub rotation_euler: [f64; 3],
    /// Center of the framed bounding box the camera looks at.
    pub target: [f64; 3],
    pub distance: f64,
}

impl CameraTransform {
    pub fn to_params(&self) -> CameraParams {
        CameraParams {
            location: self.location,
            rotation_euler: self.rotation_euler,
            focal_length_mm: FOCAL_LENGTH_MM,
            sensor_width_mm: SENSOR_WIDTH_MM,
        }
    }
}

/// Horizontal field of view of the fixed pinhole optics, radians.
pub fn field_of_view() -> f64 {
    2.0 * (SENSOR_WIDTH_MM / (2.0 * FOCAL_LENGTH_MM)).atan()
}

#[derive(Clone, Copy, Debug)]
struct Aabb {
    min: [f64; 3],
    max: [f64; 3],
}

impl Aabb {
    fn empty() -> Self {
        Self {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        }
    }

    fn is_empty(&self) -> bool {
        self.min[0] > self.max[0]
    }

    fn include(&mut self, p: [f64; 3]) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(p[axis]);
            self.max[axis] = self.max[axis].max(p[axis]);
        }
    }

    fn center(&self) -> [f64; 3] {
        [
            (self.min[0] + self.max[0]) / 2.0,
            (self.min[1] + self.max[1]) / 2.0,
            (self.min[2] + self.max[2]) / 2.0,
        ]
    }

    /// Maximum extent across the three axes.
    fn size(&self) -> f64 {
        (self.max[0] - self.min[0])
            .max(self.max[1] - self.min[1])
            .max(self.max[2] - self.min[2])
    }
}

fn transform_point(m: &[[f64; 4]; 4], p: [f64; 3]) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (row, slot) in out.iter_mut().enumerate() {
        *slot = m[row][0] * p[0] + m[row][1] * p[1] + m[row][2] * p[2] + m[row][3];
    }
    out
}

fn include_world_bounds(bbox: &mut Aabb, object: &SceneObject) {
    let (lo, hi) = (object.bounds_min, object.bounds_max);
    for corner in 0..8u8 {
        let local = [
            if corner & 1 == 0 { lo[0] } else { hi[0] },
            if corner & 2 == 0 { lo[1] } else { hi[1] },
            if corner & 4 == 0 { lo[2] } else { hi[2] },
        ];
        bbox.include(transform_point(&object.matrix_world, local));
    }
}

/// Derive a camera transform that frames all visible renderable geometry.
///
/// Accumulates a world-space bounding box over the eligible objects and
/// derives the standoff distance from the pinhole field-of-view formula
/// `distance = size / (2·tan(fov/2))`, with a safety margin and a hard
/// floor. An empty scene gets a fixed default transform; that is a
/// deliberate fallback, not an error.
pub fn place_camera(scene: &SceneDescription) -> CameraTransform {
    let mut bbox = Aabb::empty();
    for object in scene.visible_renderable_objects() {
        include_world_bounds(&mut bbox, object);
    }

    if bbox.is_empty() {
        return default_transform();
    }

    let center = bbox.center();
    let size = bbox.size().max(MIN_SIZE);
    let distance = (size / (2.0 * (field_of_view() / 2.0).tan()) * DISTANCE_MARGIN)
        .max(MIN_DISTANCE);

    // Behind (-Y) and above (+Z) the center at the fixed tilt.
    let location = [
        center[0],
        center[1] - distance * TILT_RAD.cos(),
        center[2] + distance * TILT_RAD.sin(),
    ];
    // Blender's camera looks down -Z at rest; pitch it up by (90° - tilt)
    // so it faces the target.
    let rotation_euler = [std::f64::consts::FRAC_PI_2 - TILT_RAD, 0.0, 0.0];

    CameraTransform {
        location,
        rotation_euler,
        target: center,
        distance,
    }
}

fn default_transform() -> CameraTransform {
    let distance = 12.0;
    CameraTransform {
        location: [0.0, -distance * TILT_RAD.cos(), distance * TILT_RAD.sin()],
        rotation_euler: [std::f64::consts::FRAC_PI_2 - TILT_RAD, 0.0, 0.0],
        target: [0.0, 0.0, 0.0],
        distance,
    }
}

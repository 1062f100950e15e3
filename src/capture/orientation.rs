//! Output orientation
//!
//! The clip rotation is derived from the camera sensor mounting, the lens
//! facing and the current device rotation. A session computes it once at
//! start; a change restarts the session.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Clockwise rotation a player applies to the video track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Normalize any angle (negative or > 360) to the nearest right angle.
    pub fn from_degrees(degrees: i32) -> Self {
        let normalized = degrees.rem_euclid(360);
        match ((normalized + 45) / 90) % 4 {
            0 => Rotation::Deg0,
            1 => Rotation::Deg90,
            2 => Rotation::Deg180,
            _ => Rotation::Deg270,
        }
    }

    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

/// Which way the camera lens faces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LensFacing {
    #[default]
    Back,
    Front,
}

/// Rotation needed to display sensor output upright.
///
/// Front lenses are mirrored, so the device rotation adds instead of
/// subtracting.
pub fn compute_rotation(sensor_degrees: i32, device_degrees: i32, facing: LensFacing) -> Rotation {
    let degrees = match facing {
        LensFacing::Back => sensor_degrees - device_degrees + 360,
        LensFacing::Front => sensor_degrees + device_degrees,
    };
    Rotation::from_degrees(degrees)
}

#[derive(Debug, Clone, Copy)]
struct OrientationInputs {
    sensor_degrees: i32,
    device_degrees: i32,
    facing: LensFacing,
}

/// Current orientation inputs. The session reads them once per start.
#[derive(Debug)]
pub struct OrientationState {
    inputs: RwLock<OrientationInputs>,
}

impl OrientationState {
    pub fn new(sensor_degrees: i32, device_degrees: i32, facing: LensFacing) -> Self {
        Self {
            inputs: RwLock::new(OrientationInputs {
                sensor_degrees,
                device_degrees,
                facing,
            }),
        }
    }

    pub fn rotation(&self) -> Rotation {
        let inputs = *self.inputs.read();
        compute_rotation(inputs.sensor_degrees, inputs.device_degrees, inputs.facing)
    }

    /// The rotation `device_degrees` would produce with the other inputs
    /// unchanged
    pub fn rotation_for_device(&self, device_degrees: i32) -> Rotation {
        let inputs = *self.inputs.read();
        compute_rotation(inputs.sensor_degrees, device_degrees, inputs.facing)
    }

    /// Record a new device rotation. Returns true if the output rotation
    /// changed as a result.
    pub fn set_device_rotation(&self, device_degrees: i32) -> bool {
        let mut inputs = self.inputs.write();
        let before = compute_rotation(inputs.sensor_degrees, inputs.device_degrees, inputs.facing);
        inputs.device_degrees = device_degrees;
        let after = compute_rotation(inputs.sensor_degrees, inputs.device_degrees, inputs.facing);
        before != after
    }

    pub fn set_facing(&self, facing: LensFacing) -> bool {
        let mut inputs = self.inputs.write();
        let before = compute_rotation(inputs.sensor_degrees, inputs.device_degrees, inputs.facing);
        inputs.facing = facing;
        let after = compute_rotation(inputs.sensor_degrees, inputs.device_degrees, inputs.facing);
        before != after
    }
}

impl Default for OrientationState {
    fn default() -> Self {
        Self::new(0, 0, LensFacing::Back)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_degrees_normalizes() {
        assert_eq!(Rotation::from_degrees(0), Rotation::Deg0);
        assert_eq!(Rotation::from_degrees(450), Rotation::Deg90);
        assert_eq!(Rotation::from_degrees(-90), Rotation::Deg270);
        assert_eq!(Rotation::from_degrees(185), Rotation::Deg180);
        assert_eq!(Rotation::from_degrees(359), Rotation::Deg0);
    }

    #[test]
    fn back_camera_portrait_phone() {
        // Typical phone: sensor mounted at 90, device upright
        assert_eq!(compute_rotation(90, 0, LensFacing::Back), Rotation::Deg90);
        // Device turned to landscape
        assert_eq!(compute_rotation(90, 90, LensFacing::Back), Rotation::Deg0);
        assert_eq!(compute_rotation(90, 270, LensFacing::Back), Rotation::Deg180);
    }

    #[test]
    fn front_camera_adds_device_rotation() {
        assert_eq!(compute_rotation(270, 0, LensFacing::Front), Rotation::Deg270);
        assert_eq!(compute_rotation(270, 90, LensFacing::Front), Rotation::Deg0);
    }

    #[test]
    fn state_reports_only_effective_changes() {
        let state = OrientationState::new(90, 0, LensFacing::Back);
        assert_eq!(state.rotation(), Rotation::Deg90);
        assert!(!state.set_device_rotation(10));
        assert!(state.set_device_rotation(90));
        assert_eq!(state.rotation(), Rotation::Deg0);
    }
}

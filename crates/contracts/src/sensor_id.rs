//! SensorId - Copyable sensor identifier
//!
//! Sensor ids double as sensor type ids: one physical (or mocked) sensor per type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sensor identifier.
///
/// A thin newtype over the integer type id so that sensor ids cannot be
/// confused with pids, uids or file descriptors at call sites.
///
/// # Examples
/// ```
/// use contracts::{sensor_type, SensorId};
///
/// let id = SensorId::new(1);
/// assert_eq!(id, sensor_type::ACCELEROMETER);
/// assert_eq!(id.get(), 1);
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(i32);

impl SensorId {
    /// Create a new SensorId from the raw type id.
    #[inline]
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    /// Get the raw type id.
    #[inline]
    pub const fn get(self) -> i32 {
        self.0
    }

    /// Negative ids are never valid sensors.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl From<i32> for SensorId {
    #[inline]
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl From<SensorId> for i32 {
    #[inline]
    fn from(id: SensorId) -> Self {
        id.0
    }
}

impl PartialEq<i32> for SensorId {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensorId({})", self.0)
    }
}

/// Well-known sensor type ids.
pub mod sensor_type {
    use super::SensorId;

    pub const ACCELEROMETER: SensorId = SensorId::new(1);
    pub const GYROSCOPE: SensorId = SensorId::new(2);
    pub const AMBIENT_LIGHT: SensorId = SensorId::new(5);
    pub const MAGNETIC_FIELD: SensorId = SensorId::new(6);
    pub const BAROMETER: SensorId = SensorId::new(8);
    pub const HALL: SensorId = SensorId::new(10);
    pub const PROXIMITY: SensorId = SensorId::new(12);
    pub const HUMIDITY: SensorId = SensorId::new(13);
    pub const COLOR: SensorId = SensorId::new(14);
    pub const SAR: SensorId = SensorId::new(15);
    pub const POSTURE: SensorId = SensorId::new(20);
    pub const ORIENTATION: SensorId = SensorId::new(256);
    pub const GRAVITY: SensorId = SensorId::new(257);
    pub const LINEAR_ACCELERATION: SensorId = SensorId::new(258);
    pub const ROTATION_VECTOR: SensorId = SensorId::new(259);
    pub const GYROSCOPE_UNCALIBRATED: SensorId = SensorId::new(263);
    pub const PEDOMETER_DETECTION: SensorId = SensorId::new(265);
    pub const PEDOMETER: SensorId = SensorId::new(266);
    pub const HEART_RATE: SensorId = SensorId::new(278);

    /// Sensors the compatible backend can stand in for via mock injection.
    pub const SUPPORTED_MOCK_SENSORS: [SensorId; 3] = [COLOR, SAR, POSTURE];

    /// Sensors that keep running while their owning process is frozen.
    pub const FREEZING_EXEMPT: [SensorId; 2] = [PEDOMETER_DETECTION, PEDOMETER];
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_equality() {
        let id = SensorId::new(12);
        assert_eq!(id, 12);
        assert_eq!(id, sensor_type::PROXIMITY);
        assert_ne!(id, sensor_type::COLOR);
    }

    #[test]
    fn test_validity() {
        assert!(SensorId::new(0).is_valid());
        assert!(!SensorId::new(-1).is_valid());
    }

    #[test]
    fn test_hashmap_key() {
        let mut map: HashMap<SensorId, i32> = HashMap::new();
        map.insert(sensor_type::ACCELEROMETER, 1);
        map.insert(sensor_type::GYROSCOPE, 2);

        assert_eq!(map.get(&SensorId::new(1)), Some(&1));
        assert_eq!(map.get(&SensorId::new(2)), Some(&2));
    }

    #[test]
    fn test_serde_transparent() {
        let id = SensorId::new(265);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "265");

        let parsed: SensorId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}

//! Servo families: register map, position resolution and byte order.

use serde::{Deserialize, Serialize};

use crate::joint::ServoId;

pub const REG_TORQUE_ENABLE: u8 = 40;
pub const REG_ACC: u8 = 41;
pub const REG_GOAL_POSITION: u8 = 42;
pub const REG_GOAL_SPEED: u8 = 46;
pub const REG_PRESENT_POSITION: u8 = 56;

/// Bytes written by one combined motion command, starting at [`REG_ACC`]:
/// acceleration, goal position, goal time, goal speed.
pub const MOTION_BLOCK_LEN: u8 = 7;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServoFamily {
    /// Feetech STS3215 and friends: 4096 steps per turn, little-endian.
    #[default]
    Sts,
    /// Feetech SCS series: 1024 steps over 300 degrees, big-endian.
    Scs,
}

impl ServoFamily {
    /// Position steps spanning [`ServoFamily::degree_range`].
    pub fn steps(&self) -> u16 {
        match self {
            ServoFamily::Sts => 4096,
            ServoFamily::Scs => 1024,
        }
    }

    pub fn degree_range(&self) -> f64 {
        match self {
            ServoFamily::Sts => 360.0,
            ServoFamily::Scs => 300.0,
        }
    }

    pub fn max_step(&self) -> u16 {
        self.steps() - 1
    }

    /// Bit carrying the direction in sign-magnitude speed words.
    pub fn speed_sign_bit(&self) -> u8 {
        match self {
            ServoFamily::Sts => 15,
            ServoFamily::Scs => 10,
        }
    }

    /// Whether one broadcast sync-write can update several servos.
    pub fn supports_sync_write(&self) -> bool {
        matches!(self, ServoFamily::Sts)
    }

    pub fn degrees_to_steps(&self, degrees: f64) -> u16 {
        if !degrees.is_finite() {
            return 0;
        }
        let steps = (degrees / self.degree_range() * self.steps() as f64).round();
        steps.clamp(0.0, self.max_step() as f64) as u16
    }

    pub fn steps_to_degrees(&self, steps: u16) -> f64 {
        steps.min(self.max_step()) as f64 * self.degree_range() / self.steps() as f64
    }

    pub fn encode_u16(&self, value: u16) -> [u8; 2] {
        match self {
            ServoFamily::Sts => value.to_le_bytes(),
            ServoFamily::Scs => value.to_be_bytes(),
        }
    }

    pub fn decode_u16(&self, bytes: [u8; 2]) -> u16 {
        match self {
            ServoFamily::Sts => u16::from_le_bytes(bytes),
            ServoFamily::Scs => u16::from_be_bytes(bytes),
        }
    }

    /// Sign-magnitude speed word; the magnitude saturates below the sign bit.
    pub fn encode_speed(&self, speed: f64) -> u16 {
        let sign = 1u16 << self.speed_sign_bit();
        let max = (sign - 1) as f64;
        let magnitude = if speed.is_finite() {
            speed.abs().round().min(max) as u16
        } else {
            0
        };
        if speed < 0.0 && magnitude != 0 {
            magnitude | sign
        } else {
            magnitude
        }
    }

    pub fn decode_speed(&self, raw: u16) -> f64 {
        let sign = 1u16 << self.speed_sign_bit();
        let magnitude = (raw & (sign - 1)) as f64;
        if raw & sign != 0 {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Payload for a combined motion write at [`REG_ACC`].
    pub fn motion_block(&self, position_steps: u16, speed: u16) -> Vec<u8> {
        let pos = self.encode_u16(position_steps);
        let spd = self.encode_u16(speed);
        vec![0, pos[0], pos[1], 0, 0, spd[0], spd[1]]
    }
}

/// One servo's target in a batched write.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SyncEntry {
    /// Goal position in degrees with a raw speed hint (0 = servo default).
    Position {
        servo_id: ServoId,
        degrees: f64,
        speed_hint: u16,
    },
    /// Wheel-mode speed.
    Speed { servo_id: ServoId, speed: f64 },
}

impl SyncEntry {
    pub fn servo_id(&self) -> ServoId {
        match self {
            SyncEntry::Position { servo_id, .. } | SyncEntry::Speed { servo_id, .. } => *servo_id,
        }
    }

    pub fn motion_block(&self, family: ServoFamily) -> Vec<u8> {
        match *self {
            SyncEntry::Position {
                degrees,
                speed_hint,
                ..
            } => family.motion_block(family.degrees_to_steps(degrees), speed_hint),
            SyncEntry::Speed { speed, .. } => family.motion_block(0, family.encode_speed(speed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sts_position_conversion() {
        let sts = ServoFamily::Sts;
        assert_eq!(sts.degrees_to_steps(180.0), 2048);
        assert_eq!(sts.degrees_to_steps(360.0), 4095);
        assert_eq!(sts.degrees_to_steps(-10.0), 0);
        assert_eq!(sts.steps_to_degrees(1024), 90.0);
        assert_eq!(sts.encode_u16(2048), [0x00, 0x08]);
    }

    #[test]
    fn test_scs_is_big_endian_over_300_degrees() {
        let scs = ServoFamily::Scs;
        assert_eq!(scs.degrees_to_steps(150.0), 512);
        assert_eq!(scs.encode_u16(512), [0x02, 0x00]);
        assert_eq!(scs.decode_u16([0x02, 0x00]), 512);
        assert!(!scs.supports_sync_write());
    }

    #[test]
    fn test_speed_sign_magnitude() {
        let sts = ServoFamily::Sts;
        assert_eq!(sts.encode_speed(100.0), 100);
        assert_eq!(sts.encode_speed(-100.0), 0x8064);
        assert_eq!(sts.decode_speed(0x8064), -100.0);
        assert_eq!(sts.encode_speed(-0.2), 0);
        assert_eq!(sts.encode_speed(1e9), 0x7FFF);
        assert_eq!(ServoFamily::Scs.encode_speed(-1.0), 0x0401);
    }

    #[test]
    fn test_motion_block_for_wheel_entry() {
        let entry = SyncEntry::Speed {
            servo_id: 13,
            speed: -50.0,
        };
        assert_eq!(entry.motion_block(ServoFamily::Sts), vec![0, 0, 0, 0, 0, 50, 0x80]);
        assert_eq!(entry.servo_id(), 13);
    }
}

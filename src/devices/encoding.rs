//! Axis value conversions.
//!
//! Inputs arrive in the native signed 16-bit range and are decoded to [-1.0, 1.0].
//! Virtual driver writes use the 0..=0x8000 domain, in one of two encodings picked per
//! downstream protocol. A process uses exactly one of them.

use serde::{Deserialize, Serialize};

const NATIVE_SPAN: f64 = 65535.0;
const NATIVE_OFFSET: f64 = 32768.0;
const DRIVER_FULL: f64 = 32768.0;
const DRIVER_OFFSET_SPAN: f64 = 32767.0;

/// Native joystick value to [-1.0, 1.0].
pub fn decode_native(raw: i16) -> f64 {
    2.0 * (f64::from(raw) + NATIVE_OFFSET) / NATIVE_SPAN - 1.0
}

/// [-1.0, 1.0] to the nearest native joystick value.
pub fn encode_native(value: f64) -> i16 {
    let value = sanitize(value);
    let raw = ((value + 1.0) * NATIVE_SPAN / 2.0 - NATIVE_OFFSET).round();
    raw.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AxisEncoding {
    /// `floor(0x8000 * (1 + v) / 2)`, 0x0000..=0x8000
    #[default]
    Symmetric,
    /// `floor(1 + 0x7FFF * (1 + v) / 2)`, 0x0001..=0x8000
    Offset,
}

impl AxisEncoding {
    pub fn encode(self, value: f64) -> u16 {
        let value = sanitize(value);
        let out = match self {
            AxisEncoding::Symmetric => (DRIVER_FULL * (1.0 + value) / 2.0).floor(),
            AxisEncoding::Offset => (1.0 + DRIVER_OFFSET_SPAN * (1.0 + value) / 2.0).floor(),
        };
        out.clamp(0.0, DRIVER_FULL) as u16
    }

    pub fn decode(self, out: u16) -> f64 {
        let out = f64::from(out);
        match self {
            AxisEncoding::Symmetric => 2.0 * out / DRIVER_FULL - 1.0,
            AxisEncoding::Offset => 2.0 * (out - 1.0) / DRIVER_OFFSET_SPAN - 1.0,
        }
    }

    /// Width of one quantization step in the [-1.0, 1.0] domain.
    pub fn step(self) -> f64 {
        match self {
            AxisEncoding::Symmetric => 2.0 / DRIVER_FULL,
            AxisEncoding::Offset => 2.0 / DRIVER_OFFSET_SPAN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_extremes_decode_to_unit_range() {
        assert!((decode_native(i16::MIN) + 1.0).abs() < 1e-12);
        assert!((decode_native(i16::MAX) - 1.0).abs() < 1e-12);
        assert!(decode_native(0).abs() < 1e-4);
        assert_eq!(encode_native(1.0), i16::MAX);
        assert_eq!(encode_native(-1.0), i16::MIN);
        assert_eq!(encode_native(f64::NAN), encode_native(0.0));
    }

    #[test]
    fn encodings_cover_their_documented_domain() {
        assert_eq!(AxisEncoding::Symmetric.encode(-1.0), 0x0000);
        assert_eq!(AxisEncoding::Symmetric.encode(1.0), 0x8000);
        assert_eq!(AxisEncoding::Symmetric.encode(0.0), 0x4000);
        assert_eq!(AxisEncoding::Offset.encode(-1.0), 0x0001);
        assert_eq!(AxisEncoding::Offset.encode(1.0), 0x8000);
        assert_eq!(AxisEncoding::Symmetric.encode(7.5), 0x8000);
    }

    #[test]
    fn round_trip_stays_within_one_step() {
        for encoding in [AxisEncoding::Symmetric, AxisEncoding::Offset] {
            for i in 0..=2000 {
                let v = -1.0 + f64::from(i) / 1000.0;
                let back = encoding.decode(encoding.encode(v));
                assert!(
                    (back - v).abs() <= encoding.step(),
                    "{:?}: {} came back as {}",
                    encoding,
                    v,
                    back
                );
            }
        }
    }

    #[test]
    fn native_round_trip_is_close() {
        for raw in [i16::MIN, -12345, -1, 0, 1, 4096, i16::MAX] {
            assert!((i32::from(encode_native(decode_native(raw))) - i32::from(raw)).abs() <= 1);
        }
    }
}

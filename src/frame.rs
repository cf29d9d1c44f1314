//! Binary telemetry frame codec.
//!
//! Wire layout of one frame:
//!
//! ```text
//! +------+-----------------------------------------+----------+
//! | 0xAA | time f32 LE | displacement f32 LE | force f32 LE | checksum |
//! +------+-----------------------------------------+----------+
//!    1                       12                           1
//! ```
//!
//! The checksum is the XOR of the start byte and the twelve payload bytes. A frame
//! whose three values are all exactly `-1.0` is the end-of-burst sentinel: the bench
//! sends it when it has nothing more to say for now, and it is never a sample.

use crate::errors::{DriverError, Result};

/// Reserved byte announcing a binary frame. Never a valid first byte of a text line.
pub const START_BYTE: u8 = 0xAA;

/// Three little-endian `f32` values.
pub const PAYLOAD_LEN: usize = 12;

/// Bytes following the start byte: payload plus checksum.
pub const FRAME_BODY_LEN: usize = PAYLOAD_LEN + 1;

/// Full frame on the wire, start byte included.
pub const FRAME_LEN: usize = 1 + FRAME_BODY_LEN;

/// Value carried in all three fields of the end-of-burst sentinel.
pub const SENTINEL_VALUE: f32 = -1.0;

/// One force/displacement measurement from the bench.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Seconds since the device started the current motion.
    pub time: f32,
    /// Millimetres.
    pub displacement: f32,
    /// Newtons.
    pub force: f32,
}

impl Sample {
    #[inline]
    pub fn new(time: f32, displacement: f32, force: f32) -> Self {
        Self {
            time,
            displacement,
            force,
        }
    }

    /// The `(-1, -1, -1)` triple marking the end of a burst.
    pub const END_OF_BURST: Sample = Sample {
        time: SENTINEL_VALUE,
        displacement: SENTINEL_VALUE,
        force: SENTINEL_VALUE,
    };

    pub fn is_end_of_burst(&self) -> bool {
        self.time == SENTINEL_VALUE
            && self.displacement == SENTINEL_VALUE
            && self.force == SENTINEL_VALUE
    }

    pub fn from_payload(payload: &[u8; PAYLOAD_LEN]) -> Self {
        let field = |i: usize| {
            f32::from_le_bytes([
                payload[i],
                payload[i + 1],
                payload[i + 2],
                payload[i + 3],
            ])
        };
        Self::new(field(0), field(4), field(8))
    }

    pub fn to_payload(&self) -> [u8; PAYLOAD_LEN] {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0..4].copy_from_slice(&self.time.to_le_bytes());
        payload[4..8].copy_from_slice(&self.displacement.to_le_bytes());
        payload[8..12].copy_from_slice(&self.force.to_le_bytes());
        payload
    }
}

/// Outcome of decoding one frame body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameDecode {
    Sample(Sample),
    /// Sentinel triple: stop reading for this tick.
    EndOfBurst,
    /// Corrupted frame, to be dropped without halting the stream.
    BadChecksum { received: u8, calculated: u8 },
}

/// XOR of the start byte with every payload byte.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(START_BYTE, |acc, &b| acc ^ b)
}

/// Check a payload against the checksum byte that followed it.
pub fn verify_checksum(payload: &[u8], received: u8) -> Result<()> {
    let calculated = checksum(payload);
    if calculated == received {
        Ok(())
    } else {
        Err(DriverError::Checksum {
            received,
            calculated,
        })
    }
}

/// Decode the 13 bytes read after a start byte.
pub fn decode_body(body: &[u8; FRAME_BODY_LEN]) -> FrameDecode {
    let mut payload = [0u8; PAYLOAD_LEN];
    payload.copy_from_slice(&body[..PAYLOAD_LEN]);
    let received = body[PAYLOAD_LEN];

    if let Err(DriverError::Checksum {
        received,
        calculated,
    }) = verify_checksum(&payload, received)
    {
        return FrameDecode::BadChecksum {
            received,
            calculated,
        };
    }

    let sample = Sample::from_payload(&payload);
    if sample.is_end_of_burst() {
        FrameDecode::EndOfBurst
    } else {
        FrameDecode::Sample(sample)
    }
}

/// Decode a complete frame, start byte included.
pub fn decode_frame(frame: &[u8]) -> Result<FrameDecode> {
    match frame.first() {
        Some(&START_BYTE) => {}
        Some(&other) => {
            return Err(DriverError::Protocol(format!(
                "frame starts with {other:#04X}, expected {START_BYTE:#04X}"
            )))
        }
        None => {
            return Err(DriverError::TruncatedFrame {
                expected: FRAME_BODY_LEN,
                got: 0,
            })
        }
    }
    let body = &frame[1..];
    if body.len() < FRAME_BODY_LEN {
        return Err(DriverError::TruncatedFrame {
            expected: FRAME_BODY_LEN,
            got: body.len(),
        });
    }
    let mut fixed = [0u8; FRAME_BODY_LEN];
    fixed.copy_from_slice(&body[..FRAME_BODY_LEN]);
    Ok(decode_body(&fixed))
}

/// Pack a sample into a wire frame.
pub fn encode_frame(sample: &Sample) -> [u8; FRAME_LEN] {
    let payload = sample.to_payload();
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = START_BYTE;
    frame[1..=PAYLOAD_LEN].copy_from_slice(&payload);
    frame[FRAME_LEN - 1] = checksum(&payload);
    frame
}

pub fn encode_end_of_burst() -> [u8; FRAME_LEN] {
    encode_frame(&Sample::END_OF_BURST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encodes_known_frame() {
        let frame = encode_frame(&Sample::new(0.0, 0.0, 0.0));
        assert_eq!(frame.len(), 14);
        assert_eq!(frame[0], START_BYTE);
        assert!(frame[1..13].iter().all(|&b| b == 0));
        // XOR over zeros leaves the start byte
        assert_eq!(frame[13], START_BYTE);
    }

    #[test]
    fn decodes_little_endian_fields() {
        let sample = Sample::new(0.1, 2.0, 5.0);
        let frame = encode_frame(&sample);
        assert_eq!(&frame[5..9], &2.0f32.to_le_bytes());
        assert_eq!(decode_frame(&frame).unwrap(), FrameDecode::Sample(sample));
    }

    #[test]
    fn sentinel_is_not_a_sample() {
        let frame = encode_end_of_burst();
        assert_eq!(decode_frame(&frame).unwrap(), FrameDecode::EndOfBurst);
    }

    #[test]
    fn partial_sentinel_is_a_sample() {
        let sample = Sample::new(-1.0, -1.0, 0.0);
        assert!(!sample.is_end_of_burst());
        assert_eq!(
            decode_frame(&encode_frame(&sample)).unwrap(),
            FrameDecode::Sample(sample)
        );
    }

    #[test]
    fn bad_checksum_reports_both_values() {
        let mut frame = encode_frame(&Sample::new(1.0, 2.0, 3.0));
        let good = frame[13];
        frame[13] ^= 0x01;
        assert_eq!(
            decode_frame(&frame).unwrap(),
            FrameDecode::BadChecksum {
                received: good ^ 0x01,
                calculated: good,
            }
        );
    }

    #[test]
    fn short_frame_is_truncated() {
        let frame = encode_frame(&Sample::new(1.0, 2.0, 3.0));
        let err = decode_frame(&frame[..9]).unwrap_err();
        assert!(matches!(
            err,
            DriverError::TruncatedFrame {
                expected: 13,
                got: 8
            }
        ));
    }

    #[test]
    fn wrong_start_byte_is_rejected() {
        let mut frame = encode_frame(&Sample::new(1.0, 2.0, 3.0));
        frame[0] = b'{';
        assert!(matches!(
            decode_frame(&frame),
            Err(DriverError::Protocol(_))
        ));
    }

    proptest! {
        #[test]
        fn payload_round_trips(payload in prop::array::uniform12(any::<u8>())) {
            let sample = Sample::from_payload(&payload);
            prop_assume!(!sample.is_end_of_burst());

            let frame = encode_frame(&sample);
            match decode_frame(&frame).unwrap() {
                FrameDecode::Sample(decoded) => prop_assert_eq!(decoded.to_payload(), payload),
                other => prop_assert!(false, "unexpected decode {:?}", other),
            }
        }

        #[test]
        fn single_bit_corruption_is_always_caught(
            payload in prop::array::uniform12(any::<u8>()),
            byte in 1usize..FRAME_LEN,
            bit in 0u8..8,
        ) {
            let mut frame = encode_frame(&Sample::from_payload(&payload));
            frame[byte] ^= 1 << bit;
            let decoded = decode_frame(&frame).unwrap();
            prop_assert!(
                matches!(decoded, FrameDecode::BadChecksum { .. }),
                "corruption at byte {} bit {} decoded as {:?}", byte, bit, decoded
            );
        }
    }
}

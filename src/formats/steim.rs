//! STEIM1/STEIM2 difference compression (SEED data encodings 10 and 11).
//!
//! Data are 64-byte frames of sixteen 32-bit words. Word 0 of each frame
//! holds sixteen 2-bit control nibbles; in the first frame words 1 and 2
//! hold the forward and reverse integration constants (first and last
//! sample of the record).

use bytes::{BufMut, BytesMut};

use crate::error::{DecodeError, EncodeError};

pub const FRAME_BYTES: usize = 64;
const WORDS: usize = 16;

fn sign_extend(v: u32, bits: u32) -> i32 {
    ((v << (32 - bits)) as i32) >> (32 - bits)
}

/// Splits a word into `count` signed fields of `bits` bits, high field first.
fn unpack(word: u32, count: u32, bits: u32, out: &mut Vec<i32>) {
    let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
    for i in 0..count {
        let shift = (count - 1 - i) * bits;
        out.push(sign_extend((word >> shift) & mask, bits));
    }
}

fn pack(diffs: &[i64], bits: u32) -> u32 {
    let count = diffs.len() as u32;
    let mask = (1u32 << bits) - 1;
    diffs.iter().enumerate().fold(0u32, |word, (i, d)| {
        let shift = (count - 1 - i as u32) * bits;
        word | (((*d as i32 as u32) & mask) << shift)
    })
}

fn fits(d: i64, bits: u32) -> bool {
    let half = 1i64 << (bits - 1);
    (-half..half).contains(&d)
}

fn read_word(frames: &[u8], index: usize, big_endian: bool) -> u32 {
    let b = [frames[index * 4], frames[index * 4 + 1], frames[index * 4 + 2], frames[index * 4 + 3]];
    if big_endian { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Steim1,
    Steim2,
}

fn decode(payload: &[u8], count: usize, big_endian: bool, flavor: Flavor) -> Result<Vec<i32>, DecodeError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let frames = payload.len() / FRAME_BYTES;
    let mut diffs: Vec<i32> = Vec::with_capacity(count + 8);
    let mut first = None;
    let mut last = 0i32;

    'frames: for f in 0..frames {
        let frame = &payload[f * FRAME_BYTES..(f + 1) * FRAME_BYTES];
        let control = read_word(frame, 0, big_endian);
        for j in 1..WORDS {
            let word = read_word(frame, j, big_endian);
            if f == 0 && j == 1 {
                first = Some(word as i32);
                continue;
            }
            if f == 0 && j == 2 {
                last = word as i32;
                continue;
            }
            let nibble = (control >> (30 - 2 * j as u32)) & 0b11;
            match (flavor, nibble) {
                (_, 0b00) => {}
                (_, 0b01) => unpack(word, 4, 8, &mut diffs),
                (Flavor::Steim1, 0b10) => unpack(word, 2, 16, &mut diffs),
                (Flavor::Steim1, _) => unpack(word, 1, 32, &mut diffs),
                (Flavor::Steim2, 0b10) => match word >> 30 {
                    0b01 => unpack(word, 1, 30, &mut diffs),
                    0b10 => unpack(word, 2, 15, &mut diffs),
                    0b11 => unpack(word, 3, 10, &mut diffs),
                    _ => return Err(DecodeError::Corrupt(format!("frame {f} word {j}: bad STEIM2 sub-code"))),
                },
                (Flavor::Steim2, _) => match word >> 30 {
                    0b00 => unpack(word, 5, 6, &mut diffs),
                    0b01 => unpack(word, 6, 5, &mut diffs),
                    0b10 => unpack(word, 7, 4, &mut diffs),
                    _ => return Err(DecodeError::Corrupt(format!("frame {f} word {j}: bad STEIM2 sub-code"))),
                },
            }
            if diffs.len() >= count {
                break 'frames;
            }
        }
    }

    let Some(x0) = first else {
        return Err(DecodeError::Corrupt("no STEIM frames".into()));
    };
    if diffs.len() < count {
        return Err(DecodeError::Corrupt(format!(
            "STEIM data holds {} of {} samples",
            diffs.len(),
            count
        )));
    }

    let mut samples = Vec::with_capacity(count);
    samples.push(x0);
    for d in &diffs[1..count] {
        let prev = samples[samples.len() - 1];
        samples.push(i32::wrapping_add(prev, *d));
    }
    if samples[count - 1] != last {
        return Err(DecodeError::Corrupt(format!(
            "STEIM reverse constant {last} does not match last sample {}",
            samples[count - 1]
        )));
    }
    Ok(samples)
}

pub fn decode_steim1(payload: &[u8], count: usize, big_endian: bool) -> Result<Vec<i32>, DecodeError> {
    decode(payload, count, big_endian, Flavor::Steim1)
}

pub fn decode_steim2(payload: &[u8], count: usize, big_endian: bool) -> Result<Vec<i32>, DecodeError> {
    decode(payload, count, big_endian, Flavor::Steim2)
}

/// Output of [`encode_steim2`] for one record.
#[derive(Debug)]
pub struct Steim2Block {
    pub bytes:   Vec<u8>,
    /// Samples consumed from the front of the input.
    pub samples: usize,
    pub frames:  usize,
}

// (count, bits, nibble, dnib) from densest to widest
const STEIM2_PACKINGS: [(usize, u32, u32, Option<u32>); 7] = [
    (7, 4, 0b11, Some(0b10)),
    (6, 5, 0b11, Some(0b01)),
    (5, 6, 0b11, Some(0b00)),
    (4, 8, 0b01, None),
    (3, 10, 0b10, Some(0b11)),
    (2, 15, 0b10, Some(0b10)),
    (1, 30, 0b10, Some(0b01)),
];

/// Compresses as many leading `samples` as fit in `max_frames` frames.
/// The first difference of every record is written as zero.
pub fn encode_steim2(samples: &[i32], max_frames: usize) -> Result<Steim2Block, EncodeError> {
    let n = samples.len();
    let diff = |i: usize| if i == 0 { 0 } else { i64::from(samples[i]) - i64::from(samples[i - 1]) };

    let mut frames: Vec<[u32; WORDS]> = Vec::new();
    let mut idx = 0;

    while idx < n && frames.len() < max_frames {
        let mut words = [0u32; WORDS];
        let mut control = 0u32;
        let first_word = if frames.is_empty() {
            words[1] = samples[0] as u32;
            3
        } else {
            1
        };

        for w in first_word..WORDS {
            if idx >= n {
                break;
            }
            let mut chosen = None;
            for &(count, bits, nibble, dnib) in &STEIM2_PACKINGS {
                if idx + count <= n && (idx..idx + count).all(|i| fits(diff(i), bits)) {
                    chosen = Some((count, bits, nibble, dnib));
                    break;
                }
            }
            let Some((count, bits, nibble, dnib)) = chosen else {
                return Err(EncodeError::DifferenceOverflow(diff(idx)));
            };
            let diffs: Vec<i64> = (idx..idx + count).map(diff).collect();
            let mut word = pack(&diffs, bits);
            if let Some(d) = dnib {
                word |= d << 30;
            }
            words[w] = word;
            control |= nibble << (30 - 2 * w as u32);
            idx += count;
        }
        words[0] = control;
        frames.push(words);
    }

    if let Some(first) = frames.first_mut() {
        first[2] = samples[idx.saturating_sub(1)] as u32;
    }

    let mut bytes = BytesMut::with_capacity(frames.len() * FRAME_BYTES);
    for frame in &frames {
        for word in frame {
            bytes.put_u32(*word);
        }
    }
    Ok(Steim2Block { bytes: bytes.to_vec(), samples: idx, frames: frames.len() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steim2_round_trips_mixed_difference_widths() {
        let mut samples = vec![0i32, 1, -1, 3, 7, 15, -8, 120, -100, 500, -500, 16_000, -16_000];
        samples.extend([1 << 20, -(1 << 20), 300_000_000, 300_000_001]);
        samples.extend((0..500).map(|i| (i * 37 % 23) - 11));

        let block = encode_steim2(&samples, 63).unwrap();
        assert_eq!(block.samples, samples.len());
        let decoded = decode_steim2(&block.bytes, samples.len(), true).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn steim2_stops_at_frame_budget() {
        let samples: Vec<i32> = (0..10_000).map(|i| (i % 1000) * 1000).collect();
        let block = encode_steim2(&samples, 2).unwrap();
        assert_eq!(block.frames, 2);
        assert!(block.samples < samples.len());
        let decoded = decode_steim2(&block.bytes, block.samples, true).unwrap();
        assert_eq!(decoded.as_slice(), &samples[..block.samples]);
    }

    #[test]
    fn steim2_rejects_differences_beyond_30_bits() {
        let err = encode_steim2(&[i32::MIN, i32::MAX], 1).unwrap_err();
        assert!(matches!(err, EncodeError::DifferenceOverflow(_)));
    }

    #[test]
    fn steim1_decodes_hand_built_frame() {
        // x0 = 10, diffs (ignored d0 = 0), +1, -2 as bytes, then +70000 as one word
        let mut words = [0u32; WORDS];
        words[0] = (0b01 << (30 - 6)) | (0b11 << (30 - 8));
        words[1] = 10;
        words[2] = (10 + 1 - 2 + 3 + 70_000) as u32;
        words[3] = u32::from_be_bytes([0, 1, (-2i8) as u8, 3]);
        words[4] = 70_000;
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        let decoded = decode_steim1(&bytes, 5, true).unwrap();
        assert_eq!(decoded, vec![10, 11, 9, 12, 70_012]);
    }
}

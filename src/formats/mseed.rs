//! miniSEED 2.4 records.
//!
//! Reading accepts INT16, INT32, FLOAT32, FLOAT64, STEIM1 and STEIM2 data in
//! either header byte order, with blockettes 100, 1000 and 1001. Records of
//! one channel that continue each other are joined into a single fragment.
//!
//! Writing produces fixed-length big-endian records with blockettes 1000
//! and 1001, plus blockette 100 when the rate has no exact
//! factor/multiplier form. Output depends only on the input series, so
//! rewriting the same day yields the same bytes.

use std::{fs, io::Write, path::Path};

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use super::{steim, ContainerWriter, Encoding, FragmentReader};
use crate::{
    error::{DecodeError, EncodeError},
    fragment::{seconds_between, Fragment, Identity},
};

const FIXED_HEADER: usize = 48;
pub const DEFAULT_RECORD_LENGTH: usize = 4096;

const ENC_INT16: u8 = 1;
const ENC_INT32: u8 = 3;
const ENC_FLOAT32: u8 = 4;
const ENC_FLOAT64: u8 = 5;
const ENC_STEIM1: u8 = 10;
const ENC_STEIM2: u8 = 11;

/// miniSEED reader and writer.
#[derive(Debug, Clone, Copy)]
pub struct MiniSeed {
    /// Length of written records; a power of two between 256 and 65536.
    pub record_length: usize,
}

impl Default for MiniSeed {
    fn default() -> Self {
        Self { record_length: DEFAULT_RECORD_LENGTH }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Reading
// ─────────────────────────────────────────────────────────────────────

struct Header<'a> {
    buf: &'a [u8],
    big: bool,
}

impl Header<'_> {
    fn u8(&self, at: usize) -> u8 {
        self.buf[at]
    }

    fn u16(&self, at: usize) -> u16 {
        let b = [self.buf[at], self.buf[at + 1]];
        if self.big { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) }
    }

    fn i16(&self, at: usize) -> i16 {
        self.u16(at) as i16
    }

    fn i32(&self, at: usize) -> i32 {
        let b = [self.buf[at], self.buf[at + 1], self.buf[at + 2], self.buf[at + 3]];
        if self.big { i32::from_be_bytes(b) } else { i32::from_le_bytes(b) }
    }

    fn f32(&self, at: usize) -> f32 {
        f32::from_bits(self.i32(at) as u32)
    }

    fn text(&self, range: std::ops::Range<usize>) -> String {
        String::from_utf8_lossy(&self.buf[range]).trim().to_string()
    }
}

fn plausible_btime(buf: &[u8], big: bool) -> bool {
    let h = Header { buf, big };
    (1900..=2100).contains(&h.u16(20)) && (1..=366).contains(&h.u16(22)) && h.u8(24) < 24
}

/// Rate from the fixed-header factor and multiplier.
pub fn rate_from_factor(factor: i16, multiplier: i16) -> f64 {
    let (f, m) = (f64::from(factor), f64::from(multiplier));
    match (factor, multiplier) {
        (0, _) | (_, 0) => 0.0,
        (f_, m_) if f_ > 0 && m_ > 0 => f * m,
        (f_, _) if f_ > 0 => -f / m,
        (_, m_) if m_ > 0 => -m / f,
        _ => 1.0 / (f * m),
    }
}

/// Factor/multiplier pair giving exactly `rate`, if one exists.
pub fn factor_for_rate(rate: f64) -> Option<(i16, i16)> {
    let max = f64::from(i16::MAX);
    if rate >= 1.0 && rate.fract() == 0.0 && rate <= max {
        return Some((rate as i16, 1));
    }
    if rate > 0.0 && rate < 1.0 {
        let period = 1.0 / rate;
        if (period - period.round()).abs() < 1e-9 && period.round() <= max {
            return Some((-(period.round() as i16), 1));
        }
    }
    for divisor in [10.0, 100.0, 1000.0, 10000.0] {
        let factor = rate * divisor;
        if (factor - factor.round()).abs() < 1e-9 && factor.round() >= 1.0 && factor.round() <= max {
            return Some((factor.round() as i16, -(divisor as i16)));
        }
    }
    None
}

struct Record {
    identity: Identity,
    start:    DateTime<Utc>,
    rate:     f64,
    samples:  Vec<f64>,
    length:   usize,
}

fn parse_record(buf: &[u8]) -> Result<Record, DecodeError> {
    if buf.len() < FIXED_HEADER {
        return Err(DecodeError::Truncated { offset: 0, needed: FIXED_HEADER, len: buf.len() });
    }
    if !buf[..6].iter().all(|b| b.is_ascii_digit() || *b == b' ' || *b == 0) || !b"DRQM".contains(&buf[6]) {
        return Err(DecodeError::BadHeader("not a miniSEED data record".into()));
    }
    let big = if plausible_btime(buf, true) {
        true
    } else if plausible_btime(buf, false) {
        false
    } else {
        return Err(DecodeError::BadHeader("implausible record start time".into()));
    };
    let h = Header { buf, big };

    let identity = Identity::new(h.text(18..20), h.text(8..13), h.text(13..15), h.text(15..18));
    let count = h.u16(30) as usize;
    let activity = h.u8(36);
    let blockettes = h.u8(39);
    let correction = h.i32(40);
    let data_offset = h.u16(44) as usize;

    let mut encoding = None;
    let mut data_big = true;
    let mut length = None;
    let mut micros = 0i64;
    let mut exact_rate = None;

    let mut pos = h.u16(46) as usize;
    for _ in 0..blockettes {
        if pos < FIXED_HEADER || pos + 8 > buf.len() {
            break;
        }
        match h.u16(pos) {
            1000 => {
                encoding = Some(h.u8(pos + 4));
                data_big = h.u8(pos + 5) == 1;
                let exp = h.u8(pos + 6);
                if !(7..=16).contains(&exp) {
                    return Err(DecodeError::BadHeader(format!("record length exponent {exp}")));
                }
                length = Some(1usize << exp);
            }
            1001 => micros = i64::from(h.u8(pos + 5) as i8),
            100 if pos + 8 <= buf.len() => exact_rate = Some(f64::from(h.f32(pos + 4))),
            _ => {}
        }
        let next = h.u16(pos + 2) as usize;
        if next <= pos {
            break;
        }
        pos = next;
    }

    let length = length.ok_or_else(|| DecodeError::BadHeader("missing blockette 1000".into()))?;
    if buf.len() < length {
        return Err(DecodeError::Truncated { offset: 0, needed: length, len: buf.len() });
    }
    if data_offset > length || (count > 0 && data_offset < FIXED_HEADER) {
        return Err(DecodeError::BadHeader(format!("data offset {data_offset}")));
    }

    let date = NaiveDate::from_yo_opt(i32::from(h.u16(20)), u32::from(h.u16(22)))
        .and_then(|d| d.and_hms_opt(u32::from(h.u8(24)), u32::from(h.u8(25)), 0))
        .ok_or_else(|| DecodeError::BadHeader("invalid record start time".into()))?;
    let mut start = Utc.from_utc_datetime(&date)
        + Duration::seconds(i64::from(h.u8(26)))
        + Duration::microseconds(i64::from(h.u16(28)) * 100 + micros);
    if activity & 0x02 == 0 {
        start += Duration::microseconds(i64::from(correction) * 100);
    }

    let rate = exact_rate.unwrap_or_else(|| rate_from_factor(h.i16(32), h.i16(34)));
    let payload = &buf[data_offset.min(length)..length];
    let samples = match encoding {
        Some(code) if count > 0 => decode_payload(code, payload, count, data_big)?,
        _ => Vec::new(),
    };

    Ok(Record { identity, start, rate, samples, length })
}

fn decode_payload(code: u8, payload: &[u8], count: usize, big: bool) -> Result<Vec<f64>, DecodeError> {
    let width = match code {
        ENC_INT16 => 2,
        ENC_INT32 | ENC_FLOAT32 => 4,
        ENC_FLOAT64 => 8,
        ENC_STEIM1 => {
            return Ok(steim::decode_steim1(payload, count, big)?.into_iter().map(f64::from).collect());
        }
        ENC_STEIM2 => {
            return Ok(steim::decode_steim2(payload, count, big)?.into_iter().map(f64::from).collect());
        }
        other => return Err(DecodeError::UnsupportedEncoding(other)),
    };
    if payload.len() < count * width {
        return Err(DecodeError::Truncated { offset: 0, needed: count * width, len: payload.len() });
    }

    let mut data = payload;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let v = match (code, big) {
            (ENC_INT16, true)    => f64::from(data.get_i16()),
            (ENC_INT16, false)   => f64::from(data.get_i16_le()),
            (ENC_INT32, true)    => f64::from(data.get_i32()),
            (ENC_INT32, false)   => f64::from(data.get_i32_le()),
            (ENC_FLOAT32, true)  => f64::from(data.get_f32()),
            (ENC_FLOAT32, false) => f64::from(data.get_f32_le()),
            (_, true)            => data.get_f64(),
            (_, false)           => data.get_f64_le(),
        };
        out.push(v);
    }
    Ok(out)
}

impl MiniSeed {
    /// Decodes a whole file image into fragments, one per continuous run
    /// of each channel, in order of first appearance.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Fragment>, DecodeError> {
        let mut fragments: Vec<Fragment> = Vec::new();
        let mut offset = 0;

        while offset + FIXED_HEADER <= bytes.len() {
            let record = parse_record(&bytes[offset..]).map_err(|e| match e {
                DecodeError::Truncated { needed, len, .. } => DecodeError::Truncated { offset, needed, len },
                other => other,
            })?;
            offset += record.length;
            if record.samples.is_empty() || !(record.rate.is_finite() && record.rate > 0.0) {
                continue;
            }

            let continues = fragments.iter_mut().rev().find(|f| f.identity == record.identity);
            match continues {
                Some(f)
                    if f.sampling_rate == record.rate
                        && (seconds_between(f.next_sample_time(), record.start) * record.rate).abs() < 0.5 =>
                {
                    f.samples.extend(record.samples);
                }
                _ => fragments.push(Fragment::new(record.identity, record.start, record.rate, record.samples)),
            }
        }

        if fragments.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(fragments)
    }
}

impl FragmentReader for MiniSeed {
    fn read(&self, path: &Path) -> Result<Vec<Fragment>, DecodeError> {
        self.decode(&fs::read(path)?)
    }
}

// ─────────────────────────────────────────────────────────────────────
// Writing
// ─────────────────────────────────────────────────────────────────────

fn put_padded(buf: &mut BytesMut, text: &str, width: usize) {
    let mut field = vec![b' '; width];
    for (slot, b) in field.iter_mut().zip(text.bytes()) {
        *slot = b;
    }
    buf.put_slice(&field);
}

fn to_integers(samples: &[f64]) -> Result<Vec<i32>, EncodeError> {
    samples
        .iter()
        .enumerate()
        .map(|(index, &value)| {
            if value.is_finite() && value.fract() == 0.0 && value >= f64::from(i32::MIN) && value <= f64::from(i32::MAX) {
                Ok(value as i32)
            } else {
                Err(EncodeError::NotIntegral { index, value })
            }
        })
        .collect()
}

enum Payload<'a> {
    Floats(&'a [f64]),
    Integers(&'a [i32]),
}

impl MiniSeed {
    fn record_exponent(&self) -> Result<u8, EncodeError> {
        let len = self.record_length;
        if len.is_power_of_two() && (256..=65536).contains(&len) {
            Ok(len.trailing_zeros() as u8)
        } else {
            Err(EncodeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("record length {len} is not a power of two in 256..=65536"),
            )))
        }
    }

    /// Builds one record from the front of `payload`; returns it with the
    /// number of samples it holds.
    fn encode_record(
        &self,
        sequence: u32,
        identity: &Identity,
        start: DateTime<Utc>,
        rate: f64,
        payload: Payload<'_>,
        encoding: Encoding,
    ) -> Result<(BytesMut, usize), EncodeError> {
        let exponent = self.record_exponent()?;
        let factor = factor_for_rate(rate);
        let data_offset = if factor.is_some() { 64 } else { 128 };
        let capacity = self.record_length - data_offset;

        let mut data = BytesMut::with_capacity(capacity);
        let (code, used, frames) = match (payload, encoding) {
            (Payload::Floats(s), Encoding::Float64) => {
                let n = s.len().min(capacity / 8);
                s[..n].iter().for_each(|v| data.put_f64(*v));
                (ENC_FLOAT64, n, 0)
            }
            (Payload::Floats(s), _) => {
                let n = s.len().min(capacity / 4);
                s[..n].iter().for_each(|v| data.put_f32(*v as f32));
                (ENC_FLOAT32, n, 0)
            }
            (Payload::Integers(s), Encoding::Steim2) => {
                let block = steim::encode_steim2(s, capacity / steim::FRAME_BYTES)?;
                data.put_slice(&block.bytes);
                (ENC_STEIM2, block.samples, block.frames)
            }
            (Payload::Integers(s), _) => {
                let n = s.len().min(capacity / 4);
                s[..n].iter().for_each(|v| data.put_i32(*v));
                (ENC_INT32, n, 0)
            }
        };
        let used = used.min(usize::from(u16::MAX));

        let day = start.date_naive();
        let nanos = u64::from(start.nanosecond().min(999_999_999));
        let fract = (nanos / 100_000) as u16;
        let micros = ((nanos % 100_000) / 1000) as i8;

        let mut rec = BytesMut::with_capacity(self.record_length);
        rec.put_slice(format!("{:06}", sequence % 1_000_000).as_bytes());
        rec.put_u8(b'D');
        rec.put_u8(b' ');
        put_padded(&mut rec, &identity.station, 5);
        put_padded(&mut rec, &identity.location, 2);
        put_padded(&mut rec, &identity.channel, 3);
        put_padded(&mut rec, &identity.network, 2);
        rec.put_u16(day.year() as u16);
        rec.put_u16(day.ordinal() as u16);
        rec.put_u8(start.hour() as u8);
        rec.put_u8(start.minute() as u8);
        rec.put_u8(start.second() as u8);
        rec.put_u8(0);
        rec.put_u16(fract);
        rec.put_u16(used as u16);
        let (f, m) = factor.unwrap_or((0, 0));
        rec.put_i16(f);
        rec.put_i16(m);
        rec.put_u8(0); // activity
        rec.put_u8(0); // io and clock
        rec.put_u8(0); // data quality
        rec.put_u8(if factor.is_some() { 2 } else { 3 });
        rec.put_i32(0); // time correction
        rec.put_u16(data_offset as u16);
        rec.put_u16(FIXED_HEADER as u16);

        // blockette 1000
        rec.put_u16(1000);
        rec.put_u16(56);
        rec.put_u8(code);
        rec.put_u8(1);
        rec.put_u8(exponent);
        rec.put_u8(0);

        // blockette 1001
        rec.put_u16(1001);
        rec.put_u16(if factor.is_some() { 0 } else { 64 });
        rec.put_u8(0);
        rec.put_i8(micros);
        rec.put_u8(0);
        rec.put_u8(frames.min(255) as u8);

        if factor.is_none() {
            rec.put_u16(100);
            rec.put_u16(0);
            rec.put_f32(rate as f32);
            rec.put_slice(&[0u8; 4]);
        }

        rec.resize(data_offset, 0);
        rec.put_slice(&data);
        rec.resize(self.record_length, 0);
        Ok((rec, used))
    }
}

impl ContainerWriter for MiniSeed {
    fn write(&self, out: &mut dyn Write, segments: &[Fragment], encoding: Encoding) -> Result<(), EncodeError> {
        let mut sequence = 1u32;
        for segment in segments.iter().filter(|s| !s.is_empty()) {
            let rate = segment.sampling_rate;
            if !(rate.is_finite() && rate > 0.0) {
                return Err(EncodeError::InvalidRate(rate));
            }
            let integers = if encoding.is_integer() { to_integers(&segment.samples)? } else { Vec::new() };

            let mut pos = 0;
            while pos < segment.sample_count() {
                let payload = if encoding.is_integer() {
                    Payload::Integers(&integers[pos..])
                } else {
                    Payload::Floats(&segment.samples[pos..])
                };
                let (record, used) =
                    self.encode_record(sequence, &segment.identity, segment.time_of(pos), rate, payload, encoding)?;
                if used == 0 {
                    return Err(EncodeError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "record too short to hold a sample",
                    )));
                }
                out.write_all(&record)?;
                pos += used;
                sequence = if sequence >= 999_999 { 1 } else { sequence + 1 };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(rate: f64, samples: Vec<f64>) -> Fragment {
        let start = Utc.with_ymd_and_hms(2012, 4, 4, 10, 20, 30).unwrap() + Duration::microseconds(123_456);
        Fragment::new(Identity::new("NR", "PIR", "", "EHZ"), start, rate, samples)
    }

    fn encode(fragments: &[Fragment], encoding: Encoding) -> Vec<u8> {
        let mut out = Vec::new();
        MiniSeed { record_length: 512 }.write(&mut out, fragments, encoding).unwrap();
        out
    }

    #[test]
    fn factor_multiplier_forms() {
        assert_eq!(factor_for_rate(100.0), Some((100, 1)));
        assert_eq!(factor_for_rate(0.1), Some((-10, 1)));
        assert_eq!(factor_for_rate(2.5), Some((25, -10)));
        assert_eq!(factor_for_rate(99.9997), None);
        assert_eq!(rate_from_factor(100, 1), 100.0);
        assert_eq!(rate_from_factor(-10, 1), 0.1);
        assert_eq!(rate_from_factor(25, -10), 2.5);
        assert_eq!(rate_from_factor(-2, -5), 0.1);
    }

    #[test]
    fn steim2_records_decode_to_one_fragment() {
        let samples: Vec<f64> = (0..3000).map(|i| ((i * 7919) % 2001 - 1000) as f64).collect();
        let bytes = encode(&[fragment(100.0, samples.clone())], Encoding::Steim2);
        assert_eq!(bytes.len() % 512, 0);
        assert!(bytes.len() > 512);

        let decoded = MiniSeed::default().decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].samples, samples);
        assert_eq!(decoded[0].identity.to_string(), "NR.PIR..EHZ");
        assert_eq!(decoded[0].start, fragment(100.0, vec![]).start);
    }

    #[test]
    fn float32_keeps_nan_and_odd_rates() {
        let samples = vec![1.5, f64::NAN, -2.25, 8.0];
        let bytes = encode(&[fragment(99.9997, samples)], Encoding::Float32);
        let decoded = MiniSeed::default().decode(&bytes).unwrap();
        assert!((decoded[0].sampling_rate - 99.9997).abs() < 1e-3);
        assert_eq!(decoded[0].samples[0], 1.5);
        assert!(decoded[0].samples[1].is_nan());
    }

    #[test]
    fn separate_segments_stay_separate() {
        let first = fragment(10.0, vec![1.0; 20]);
        let mut second = fragment(10.0, vec![2.0; 20]);
        second.start += Duration::seconds(60);
        let decoded = MiniSeed::default().decode(&encode(&[first, second], Encoding::Int32)).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].samples, vec![2.0; 20]);
    }

    #[test]
    fn integer_encodings_reject_fractional_samples() {
        let mut out = Vec::new();
        let err = MiniSeed::default()
            .write(&mut out, &[fragment(100.0, vec![1.0, 2.5])], Encoding::Steim2)
            .unwrap_err();
        assert!(matches!(err, EncodeError::NotIntegral { index: 1, .. }));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(MiniSeed::default().decode(&[0x41u8; 600]), Err(DecodeError::BadHeader(_))));
        assert!(matches!(MiniSeed::default().decode(&[]), Err(DecodeError::Empty)));
    }
}

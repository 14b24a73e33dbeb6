//! Binary SAC time series.
//!
//! Header is 70 floats, 40 ints and 24 eight-byte strings (632 bytes),
//! then `npts` 32-bit floats. Byte order is taken from `nvhdr`.

use std::{fs, path::Path};

use bytes::Buf;
use chrono::{Duration, NaiveDate, TimeZone, Utc};

use super::FragmentReader;
use crate::{
    error::DecodeError,
    fragment::{Fragment, Identity},
};

const HEADER_LEN: usize = 632;
const UNDEFINED: i32 = -12345;
const UNDEFINED_F: f32 = -12345.0;
const ITIME: i32 = 1;

// ─────────────────────────────────────────────────────────────────────
// Header offsets (bytes)
// ─────────────────────────────────────────────────────────────────────
const DELTA:  usize = 0;
const B:      usize = 20;
const NZYEAR: usize = 280;
const NZJDAY: usize = 284;
const NZHOUR: usize = 288;
const NZMIN:  usize = 292;
const NZSEC:  usize = 296;
const NZMSEC: usize = 300;
const NVHDR:  usize = 304;
const NPTS:   usize = 316;
const IFTYPE: usize = 340;
const LEVEN:  usize = 420;
const KSTNM:  usize = 440;
const KHOLE:  usize = 464;
const KCMPNM: usize = 600;
const KNETWK: usize = 608;

#[derive(Debug, Clone, Copy, Default)]
pub struct Sac;

fn word(buf: &[u8], at: usize, big: bool) -> [u8; 4] {
    let b = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
    if big { b } else { [b[3], b[2], b[1], b[0]] }
}

fn int(buf: &[u8], at: usize, big: bool) -> i32 {
    i32::from_be_bytes(word(buf, at, big))
}

fn float(buf: &[u8], at: usize, big: bool) -> f32 {
    f32::from_be_bytes(word(buf, at, big))
}

fn text(buf: &[u8], at: usize) -> String {
    let s = String::from_utf8_lossy(&buf[at..at + 8]);
    let s = s.trim_matches(|c: char| c == ' ' || c == '\0');
    if s == "-12345" { String::new() } else { s.to_string() }
}

fn defined(v: i32, field: &str) -> Result<i32, DecodeError> {
    if v == UNDEFINED {
        Err(DecodeError::BadHeader(format!("{field} is undefined")))
    } else {
        Ok(v)
    }
}

impl Sac {
    pub fn decode(&self, buf: &[u8]) -> Result<Fragment, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated { offset: 0, needed: HEADER_LEN, len: buf.len() });
        }
        let big = match (int(buf, NVHDR, true), int(buf, NVHDR, false)) {
            (6 | 7, _) => true,
            (_, 6 | 7) => false,
            _ => return Err(DecodeError::BadHeader("no SAC header version".into())),
        };

        let iftype = int(buf, IFTYPE, big);
        if iftype != ITIME && iftype != UNDEFINED {
            return Err(DecodeError::BadHeader(format!("file type {iftype} is not a time series")));
        }
        if int(buf, LEVEN, big) == 0 {
            return Err(DecodeError::BadHeader("unevenly sampled data".into()));
        }
        let delta = float(buf, DELTA, big);
        if !(delta.is_finite() && delta > 0.0) || delta == UNDEFINED_F {
            return Err(DecodeError::BadHeader(format!("invalid sample interval {delta}")));
        }
        let npts = defined(int(buf, NPTS, big), "npts")?;
        let npts = usize::try_from(npts).map_err(|_| DecodeError::BadHeader(format!("npts {npts}")))?;
        if npts == 0 {
            return Err(DecodeError::Empty);
        }
        let needed = HEADER_LEN + npts * 4;
        if buf.len() < needed {
            return Err(DecodeError::Truncated { offset: HEADER_LEN, needed, len: buf.len() });
        }

        let year = defined(int(buf, NZYEAR, big), "nzyear")?;
        let jday = defined(int(buf, NZJDAY, big), "nzjday")?;
        let [hour, min, sec, msec] =
            [NZHOUR, NZMIN, NZSEC, NZMSEC].map(|at| int(buf, at, big)).map(|v| if v == UNDEFINED { 0 } else { v });
        let reference = NaiveDate::from_yo_opt(year, jday as u32)
            .and_then(|d| d.and_hms_milli_opt(hour as u32, min as u32, sec as u32, msec as u32))
            .ok_or_else(|| DecodeError::BadHeader(format!("invalid reference time {year}.{jday:03}")))?;
        let b = float(buf, B, big);
        let offset = if b == UNDEFINED_F { 0.0 } else { f64::from(b) };
        let start = Utc.from_utc_datetime(&reference) + Duration::nanoseconds((offset * 1e9).round() as i64);

        let identity = Identity::new(text(buf, KNETWK), text(buf, KSTNM), text(buf, KHOLE), text(buf, KCMPNM));

        let mut data = &buf[HEADER_LEN..needed];
        let samples = (0..npts)
            .map(|_| f64::from(if big { data.get_f32() } else { data.get_f32_le() }))
            .collect();

        Ok(Fragment::new(identity, start, 1.0 / f64::from(delta), samples))
    }
}

impl FragmentReader for Sac {
    fn read(&self, path: &Path) -> Result<Vec<Fragment>, DecodeError> {
        Ok(vec![self.decode(&fs::read(path)?)?])
    }
}

/// Builds a minimal SAC file image; used by tests across the crate.
#[cfg(test)]
pub(crate) fn build(identity: &Identity, start: chrono::DateTime<Utc>, delta: f32, samples: &[f32], big: bool) -> Vec<u8> {
    use chrono::{Datelike, Timelike};

    let mut buf = vec![0u8; HEADER_LEN];
    let mut put = |at: usize, bytes: [u8; 4]| buf[at..at + 4].copy_from_slice(&bytes);
    let enc_i = |v: i32| if big { v.to_be_bytes() } else { v.to_le_bytes() };
    let enc_f = |v: f32| if big { v.to_be_bytes() } else { v.to_le_bytes() };

    put(DELTA, enc_f(delta));
    put(B, enc_f(0.0));
    put(NZYEAR, enc_i(start.year()));
    put(NZJDAY, enc_i(start.ordinal() as i32));
    put(NZHOUR, enc_i(start.hour() as i32));
    put(NZMIN, enc_i(start.minute() as i32));
    put(NZSEC, enc_i(start.second() as i32));
    put(NZMSEC, enc_i((start.nanosecond() / 1_000_000) as i32));
    put(NVHDR, enc_i(6));
    put(NPTS, enc_i(samples.len() as i32));
    put(IFTYPE, enc_i(ITIME));
    put(LEVEN, enc_i(1));
    for (at, value) in [
        (KSTNM, &identity.station),
        (KHOLE, &identity.location),
        (KCMPNM, &identity.channel),
        (KNETWK, &identity.network),
    ] {
        let mut field = [b' '; 8];
        field[..value.len().min(8)].copy_from_slice(&value.as_bytes()[..value.len().min(8)]);
        buf[at..at + 8].copy_from_slice(&field);
    }
    for s in samples {
        buf.extend_from_slice(&enc_f(*s));
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> Identity {
        Identity::new("", "PIR1", "", "Z")
    }

    #[test]
    fn reads_both_byte_orders() {
        let start = Utc.with_ymd_and_hms(2004, 1, 4, 3, 2, 1).unwrap() + Duration::milliseconds(250);
        for big in [true, false] {
            let bytes = build(&id(), start, 0.01, &[1.0, -2.0, 3.5], big);
            let f = Sac.decode(&bytes).unwrap();
            assert_eq!(f.start, start);
            assert!((f.sampling_rate - 100.0).abs() < 1e-3);
            assert_eq!(f.samples, vec![1.0, -2.0, 3.5]);
            assert_eq!(f.identity.station, "PIR1");
            assert_eq!(f.identity.channel, "Z");
            assert_eq!(f.identity.network, "");
        }
    }

    #[test]
    fn short_data_section_is_truncated() {
        let mut bytes = build(&id(), Utc::now(), 0.01, &[1.0; 10], true);
        bytes.truncate(HEADER_LEN + 8);
        assert!(matches!(Sac.decode(&bytes), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn missing_version_is_bad_header() {
        assert!(matches!(Sac.decode(&[0u8; HEADER_LEN]), Err(DecodeError::BadHeader(_))));
    }
}

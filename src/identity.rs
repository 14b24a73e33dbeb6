//! Canonical channel identities for legacy station/channel naming.
//!
//! The legacy recorders encoded component and gain in the station code
//! (`PIRZ`, `PIRN`, `PIRE`, `BISL`, `BISH`, ...). Whether a 4-character
//! code is really a 3-character station plus a suffix can only be decided by
//! looking at the other station codes recorded in the same source batch.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::fragment::Identity;

/// Raw station codes observed together in one source batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiblingSet {
    codes: BTreeSet<String>,
}

impl SiblingSet {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { codes: codes.into_iter().map(Into::into).collect() }
    }

    /// Number of distinct codes beginning with `root`.
    pub fn count_with_root(&self, root: &str) -> usize {
        self.codes.iter().filter(|c| c.starts_with(root)).count()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Naming scheme of the legacy instruments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityRules {
    /// Network code written into every identity; `None` keeps the source's.
    pub network:         Option<String>,
    /// Station code of the timing channel, which carries no seismic signal.
    pub timing_station:  String,
    pub band_instrument: String,
    pub low_gain_prefix: String,
    pub low_gain_marker: char,
    pub high_gain_marker: char,
}

impl Default for IdentityRules {
    fn default() -> Self {
        Self {
            network:          None,
            timing_station:   "IRIG".to_string(),
            band_instrument:  "EH".to_string(),
            low_gain_prefix:  "EL".to_string(),
            low_gain_marker:  'L',
            high_gain_marker: 'H',
        }
    }
}

const ORIENTATIONS: [char; 3] = ['Z', 'N', 'E'];

fn is_orientation(c: char) -> bool {
    ORIENTATIONS.contains(&c)
}

fn has_orientation_code(channel: &str) -> bool {
    channel.chars().count() == 3 && channel.chars().last().is_some_and(is_orientation)
}

impl IdentityRules {
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Maps a raw identity to its canonical form, or `None` for the timing
    /// channel. The rules run in a fixed order and later rules may replace
    /// the channel chosen by earlier ones.
    pub fn normalize(&self, raw: &Identity, siblings: &SiblingSet) -> Option<Identity> {
        let raw_station = raw.station.trim();
        if raw_station == self.timing_station {
            return None;
        }

        let root3: String = raw_station.chars().take(3).collect();
        let multi = siblings.count_with_root(&root3) > 1;
        let last = raw_station.chars().last();
        let is_four = raw_station.chars().count() == 4;

        let mut station = raw_station.to_string();
        let mut channel = raw.channel.trim().to_string();

        match last {
            Some(c) if is_orientation(c) && multi => {
                channel = format!("{}{}", self.band_instrument, c);
                station = root3.clone();
            }
            _ if !has_orientation_code(&channel) => {
                channel = format!("{}Z", self.band_instrument);
            }
            _ => {}
        }

        if is_four && multi {
            if last == Some(self.low_gain_marker) {
                let orientation = channel.chars().last().unwrap_or('Z');
                channel = format!("{}{}", self.low_gain_prefix, orientation);
                station = root3;
            } else if last == Some(self.high_gain_marker) {
                station = root3;
            }
        }

        Some(Identity {
            network:  self.network.clone().unwrap_or_else(|| raw.network.trim().to_string()),
            station,
            location: raw.location.trim().to_string(),
            channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(station: &str, channel: &str) -> Identity {
        Identity::new("XX", station, "", channel)
    }

    #[test]
    fn timing_channel_is_dropped() {
        let rules = IdentityRules::default();
        let siblings = SiblingSet::new(["IRIG", "PIRZ"]);
        assert_eq!(rules.normalize(&raw("IRIG", "EHZ"), &siblings), None);
    }

    #[test]
    fn lone_orientation_suffix_is_not_split() {
        // no other code shares the BEZ root
        let rules = IdentityRules::default();
        let siblings = SiblingSet::new(["BEZE", "PIRZ"]);
        let id = rules.normalize(&raw("BEZE", ""), &siblings).unwrap();
        assert_eq!((id.station.as_str(), id.channel.as_str()), ("BEZE", "EHZ"));
    }

    #[test]
    fn low_gain_keeps_resolved_orientation() {
        let rules = IdentityRules::default();
        let siblings = SiblingSet::new(["OLLH", "OLLL"]);
        let low = rules.normalize(&raw("OLLL", "SHN"), &siblings).unwrap();
        assert_eq!((low.station.as_str(), low.channel.as_str()), ("OLL", "ELN"));
        let high = rules.normalize(&raw("OLLH", "foo"), &siblings).unwrap();
        assert_eq!((high.station.as_str(), high.channel.as_str()), ("OLL", "EHZ"));
    }

    #[test]
    fn network_override_and_location_trim() {
        let rules = IdentityRules::default().with_network("NR");
        let id = rules
            .normalize(&Identity::new("", "RUBZ", " ", "EHZ"), &SiblingSet::new(["RUBZ"]))
            .unwrap();
        assert_eq!(id.to_string(), "NR.RUBZ..EHZ");
    }
}

//! Static lookup from (settlement, precinct) to coordinates.
//!
//! The index merges several upstream geocoding providers; when the same
//! key arrives from more than one, the higher-confidence source wins.
//! Read-only for the rest of the system.

use color_eyre::eyre::{Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::info;

use crate::names::NameCanonicalizer;

/// Provenance of a coordinate, best first. Keys only ever upgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordSource {
    HighConfidenceVenue,
    Venue,
    Settlement,
    NotFound,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct Coord {
    pub lat: f64,
    pub lon: f64,
    pub source: CoordSource,
}

/// One station entry of the upstream coordinates artifact.
#[derive(Deserialize)]
struct StationEntry {
    settlement: String,
    #[serde(default)]
    ballot: String,
    lat: Option<f64>,
    #[serde(alias = "lng")]
    lon: Option<f64>,
    source: CoordSource,
}

#[derive(Deserialize)]
struct CoordinatesFile {
    stations: HashMap<String, StationEntry>,
}

pub struct CoordinateIndex {
    stations: HashMap<(String, String), Coord>,
    settlements: HashMap<String, Coord>,
}

impl CoordinateIndex {
    /// Load the station-coordinates artifact produced by the geocoding
    /// collaborators.
    pub fn from_path(path: &Path, canon: &NameCanonicalizer) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("coordinates file {} could not be opened", path.display()))?;
        let parsed: CoordinatesFile = serde_json::from_reader(BufReader::new(file))
            .context("coordinates file could not be parsed")?;

        let mut index = CoordinateIndex {
            stations: HashMap::new(),
            settlements: HashMap::new(),
        };
        for entry in parsed.stations.into_values() {
            let (Some(lat), Some(lon)) = (entry.lat, entry.lon) else {
                continue;
            };
            if entry.source == CoordSource::NotFound {
                continue;
            }
            let coord = Coord {
                lat,
                lon,
                source: entry.source,
            };
            let settlement = canon.canon(&entry.settlement);
            index.insert(settlement, entry.ballot, coord);
        }
        info!(
            "Loaded {} station and {} settlement coordinates",
            index.stations.len(),
            index.settlements.len()
        );
        Ok(index)
    }

    /// Merge one provider entry, keeping the higher-priority source on
    /// collision.
    pub fn insert(&mut self, settlement: String, ballot: String, coord: Coord) {
        if !ballot.is_empty() {
            let key = (settlement.clone(), ballot);
            match self.stations.get(&key) {
                Some(existing) if existing.source <= coord.source => {}
                _ => {
                    self.stations.insert(key, coord);
                }
            }
        }
        match self.settlements.get(&settlement) {
            Some(existing) if existing.source <= coord.source => {}
            _ => {
                self.settlements.insert(settlement, coord);
            }
        }
    }

    /// Coordinate of one precinct: station-level when known, else the
    /// settlement-level coordinate shared by all its precincts.
    pub fn lookup(&self, settlement_canonical: &str, precinct_number: &str) -> Option<Coord> {
        self.stations
            .get(&(settlement_canonical.to_string(), precinct_number.to_string()))
            .or_else(|| self.settlements.get(settlement_canonical))
            .copied()
    }

    /// Settlement-granularity coordinate.
    pub fn settlement(&self, settlement_canonical: &str) -> Option<Coord> {
        self.settlements.get(settlement_canonical).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(lat: f64, source: CoordSource) -> Coord {
        Coord {
            lat,
            lon: 35.0,
            source,
        }
    }

    #[test]
    fn priority_merge_prefers_better_sources() {
        let mut index = CoordinateIndex {
            stations: HashMap::new(),
            settlements: HashMap::new(),
        };
        index.insert("חיפה".into(), "1".into(), coord(32.0, CoordSource::Settlement));
        index.insert("חיפה".into(), "1".into(), coord(32.8, CoordSource::Venue));
        // A worse source must not displace a better one.
        index.insert("חיפה".into(), "1".into(), coord(31.0, CoordSource::Settlement));

        let got = index.lookup("חיפה", "1").unwrap();
        assert_eq!(got.lat, 32.8);
        assert_eq!(got.source, CoordSource::Venue);

        index.insert(
            "חיפה".into(),
            "1".into(),
            coord(32.81, CoordSource::HighConfidenceVenue),
        );
        assert_eq!(index.lookup("חיפה", "1").unwrap().lat, 32.81);
    }

    #[test]
    fn settlement_fallback_covers_unknown_precincts() {
        let mut index = CoordinateIndex {
            stations: HashMap::new(),
            settlements: HashMap::new(),
        };
        index.insert("עכו".into(), "7".into(), coord(32.9, CoordSource::Venue));
        // Precinct 99 has no station entry; it shares the settlement
        // coordinate.
        let got = index.lookup("עכו", "99").unwrap();
        assert_eq!(got.lat, 32.9);
        assert!(index.lookup("נהריה", "1").is_none());
    }

    #[test]
    fn loads_the_station_artifact() {
        let json = r#"{
            "stations": {
                "חיפה|1": {"settlement": "חיפה", "ballot": "1", "lat": 32.8, "lng": 35.0, "source": "venue"},
                "חיפה|2": {"settlement": "חיפה", "ballot": "2", "lat": null, "lng": null, "source": "not_found"},
                "מעלות-תרשיחא|1": {"settlement": "מעלות-תרשיחא", "ballot": "1", "lat": 33.0, "lng": 35.3, "source": "settlement"}
            }
        }"#;
        let dir = std::env::temp_dir().join("kalpi-geo-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("coords.json");
        std::fs::write(&path, json).unwrap();

        let canon = NameCanonicalizer::default();
        let index = CoordinateIndex::from_path(&path, &canon).unwrap();
        assert!(index.lookup("חיפה", "1").is_some());
        assert!(index.lookup("חיפה", "2").is_some(), "settlement fallback");
        // The hyphenated publisher form is reachable through its
        // canonical name.
        assert!(index.settlement("מעלות תרשיחא").is_some());
    }
}

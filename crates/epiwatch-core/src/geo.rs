//! Geographic bucketing and bucket identity.
//!
//! Signals are aggregated on a square latitude/longitude grid. A bucket is a
//! (grid cell, disease signature) pair, rendered as `r{row}c{col}:{disease}`,
//! e.g. `r-5c146:cholera`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0088;

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// True when both coordinates are finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Great-circle distance in kilometres (haversine).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = (other.lat - self.lat).to_radians();
        let dlng = (other.lng - self.lng).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }
}

// ── Grid cells ──

/// A discretized grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GeoCell {
    pub row: i32,
    pub col: i32,
}

impl fmt::Display for GeoCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}c{}", self.row, self.col)
    }
}

impl FromStr for GeoCell {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('r')
            .ok_or_else(|| format!("cell '{s}' must start with 'r'"))?;
        let (row, col) = rest
            .split_once('c')
            .ok_or_else(|| format!("cell '{s}' is missing the 'c' separator"))?;
        let row = row
            .parse()
            .map_err(|_| format!("cell '{s}' has a non-numeric row"))?;
        let col = col
            .parse()
            .map_err(|_| format!("cell '{s}' has a non-numeric column"))?;
        Ok(Self { row, col })
    }
}

/// Square grid over latitude/longitude with a fixed cell size in degrees.
#[derive(Debug, Clone, Copy)]
pub struct GeoGrid {
    cell_deg: f64,
}

impl GeoGrid {
    pub fn new(cell_deg: f64) -> Self {
        Self { cell_deg }
    }

    pub fn cell_deg(&self) -> f64 {
        self.cell_deg
    }

    pub fn cell_for(&self, point: &GeoPoint) -> GeoCell {
        GeoCell {
            row: (point.lat / self.cell_deg).floor() as i32,
            col: (point.lng / self.cell_deg).floor() as i32,
        }
    }

    /// Centre point of a cell.
    pub fn center(&self, cell: &GeoCell) -> GeoPoint {
        GeoPoint {
            lat: (cell.row as f64 + 0.5) * self.cell_deg,
            lng: (cell.col as f64 + 0.5) * self.cell_deg,
        }
    }
}

// ── Disease signatures ──

/// Normalized disease key: trimmed, lower-cased, inner whitespace as `_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiseaseSignature(String);

impl DiseaseSignature {
    /// Normalize a candidate name. Returns `None` when nothing is left.
    pub fn new(name: &str) -> Option<Self> {
        let joined = name
            .split(|c: char| c.is_whitespace() || c == ':')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_")
            .to_lowercase();
        if joined.is_empty() {
            None
        } else {
            Some(Self(joined))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiseaseSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Bucket ids ──

/// Identity of one (geo-bucket, disease-signature) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BucketId {
    pub cell: GeoCell,
    pub disease: DiseaseSignature,
}

impl BucketId {
    pub fn new(cell: GeoCell, disease: DiseaseSignature) -> Self {
        Self { cell, disease }
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cell, self.disease)
    }
}

impl FromStr for BucketId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cell, disease) = s
            .split_once(':')
            .ok_or_else(|| format!("bucket id '{s}' must look like r<row>c<col>:<disease>"))?;
        let cell = cell.parse()?;
        let disease = DiseaseSignature::new(disease)
            .ok_or_else(|| format!("bucket id '{s}' has an empty disease"))?;
        Ok(Self { cell, disease })
    }
}

impl TryFrom<String> for BucketId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BucketId> for String {
    fn from(id: BucketId) -> Self {
        id.to_string()
    }
}

// ── Jurisdictions ──

/// A bounding box mapped to a jurisdiction identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JurisdictionRegion {
    pub id: String,
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl JurisdictionRegion {
    fn contains(&self, point: &GeoPoint) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lng..=self.max_lng).contains(&point.lng)
    }
}

/// Resolves a location to the jurisdiction whose rules govern it.
///
/// Regions are checked in declaration order; the first containing box wins.
#[derive(Debug, Clone)]
pub struct JurisdictionMap {
    regions: Vec<JurisdictionRegion>,
    fallback: String,
}

impl JurisdictionMap {
    pub fn new(regions: Vec<JurisdictionRegion>, fallback: impl Into<String>) -> Self {
        Self {
            regions,
            fallback: fallback.into(),
        }
    }

    pub fn resolve(&self, point: &GeoPoint) -> &str {
        self.regions
            .iter()
            .find(|r| r.contains(point))
            .map(|r| r.id.as_str())
            .unwrap_or(&self.fallback)
    }
}

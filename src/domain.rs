use serde::{Deserialize, Serialize};

/// One physical station, aggregating every operator permission found for it
/// across all files of the latest publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Point {
    pub longitude: f64,
    pub latitude: f64,
    pub details: PointDetails,
    pub permissions: Vec<PointPermission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointDetails {
    pub city: String,
    pub location: String,
    pub station_id: String,
    pub teryt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointPermission {
    pub operator_name: String,
    pub decision_number: String,
    pub decision_type: String,
    /// Unix epoch seconds.
    pub expiry_date: i64,
    pub technology: String,
}

/// Optional attribute restrictions; an absent field means no restriction on
/// that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointFilter {
    pub technologies: Option<Vec<String>>,
    pub operator_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Point {
    /// Appends only those permissions whose (technology, operatorName) pair is
    /// not already present; the first-seen copy wins.
    pub fn merge_permissions(&mut self, incoming: Vec<PointPermission>) {
        for perm in incoming {
            let duplicate = self.permissions.iter().any(|existing| {
                existing.technology == perm.technology
                    && existing.operator_name == perm.operator_name
            });
            if !duplicate {
                self.permissions.push(perm);
            }
        }
    }
}

/// Coordinates are stored rounded to 7 fractional digits (~1 cm) so that
/// near-duplicate encodings of the same position compare equal.
pub fn round_to_7_decimals(value: f64) -> f64 {
    let factor = 10f64.powi(7);
    (value * factor).round() / factor
}

use regex::Regex;

use crate::domain::{Point, PointDetails, PointPermission, round_to_7_decimals};
use crate::error::StationError;

/// Validates a 10-field spreadsheet row and maps it into a [`Point`] carrying
/// one permission tagged with `technology`.
///
/// Field order: operatorName, decisionNumber, decisionType, expiryEpochSeconds,
/// longitudeDMS, latitudeDMS, city, location, stationId, teryt.
pub fn parse(fields: &[String], technology: &str) -> Result<Point, StationError> {
    if fields.len() != 10 {
        return Err(StationError::InvalidFieldCount(fields.len()));
    }
    if technology.is_empty() {
        return Err(StationError::EmptyTechnology);
    }
    if fields.iter().any(|field| field.is_empty()) {
        return Err(StationError::EmptyField);
    }

    let expiry_date: i64 = fields[3]
        .parse()
        .map_err(|_| StationError::InvalidExpiryDate(fields[3].clone()))?;
    let longitude = convert_coordinate(&fields[4])
        .ok_or_else(|| StationError::InvalidCoordinate(fields[4].clone()))?;
    let latitude = convert_coordinate(&fields[5])
        .ok_or_else(|| StationError::InvalidCoordinate(fields[5].clone()))?;

    let details = PointDetails {
        city: fields[6].clone(),
        location: fields[7].clone(),
        station_id: fields[8].clone(),
        teryt: fields[9].clone(),
    };
    let permission = PointPermission {
        operator_name: fields[0].clone(),
        decision_number: fields[1].clone(),
        decision_type: fields[2].clone(),
        expiry_date,
        technology: technology.to_string(),
    };

    Ok(Point {
        longitude: round_to_7_decimals(longitude),
        latitude: round_to_7_decimals(latitude),
        details,
        permissions: vec![permission],
    })
}

/// Converts a DMS coordinate like `17E02'13"` to decimal degrees; W and S
/// hemispheres negate the result.
fn convert_coordinate(coordinate: &str) -> Option<f64> {
    let pattern = Regex::new(r#"(\d{1,2})([ENWS])(\d{2})'(\d{2})""#).unwrap();
    let captures = pattern.captures(coordinate)?;

    let degrees: f64 = captures[1].parse().ok()?;
    let hemisphere = &captures[2];
    let minutes: f64 = captures[3].parse().ok()?;
    let seconds: f64 = captures[4].parse().ok()?;

    let decimal = degrees + minutes / 60.0 + seconds / 3600.0;
    if hemisphere == "W" || hemisphere == "S" {
        Some(-decimal)
    } else {
        Some(decimal)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn valid_fields() -> Vec<String> {
        [
            "Orange Polska S.A.",
            "DRR.WRROK.6171.123.2023",
            "P",
            "1767225600",
            "17E02'13\"",
            "51N06'25\"",
            "Wrocław",
            "ul. Legnicka 21",
            "STA001",
            "0264034",
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }

    #[test]
    fn parses_valid_row() {
        let point = parse(&valid_fields(), "LTE").unwrap();
        assert_eq!(point.details.station_id, "STA001");
        assert_eq!(point.permissions.len(), 1);
        assert_eq!(point.permissions[0].technology, "LTE");
        assert_eq!(point.permissions[0].expiry_date, 1_767_225_600);
        assert!((point.longitude - 17.0369444).abs() < 1e-7);
        assert!((point.latitude - 51.1069444).abs() < 1e-7);
    }

    #[test]
    fn east_coordinate_decimal_degrees() {
        let value = convert_coordinate("17E02'13\"").unwrap();
        assert!((value - (17.0 + 2.0 / 60.0 + 13.0 / 3600.0)).abs() < 1e-12);
    }

    #[test]
    fn west_coordinate_is_negative() {
        let value = convert_coordinate("52W10'00\"").unwrap();
        assert!(value < 0.0);
        assert!((value + (52.0 + 10.0 / 60.0)).abs() < 1e-12);
    }

    #[test]
    fn south_coordinate_is_negative() {
        let value = convert_coordinate("33S15'30\"").unwrap();
        assert!(value < 0.0);
    }

    #[test]
    fn malformed_coordinate_fails() {
        assert_eq!(convert_coordinate("17.0369444"), None);
        assert_eq!(convert_coordinate("17E2'13\""), None);
        assert_eq!(convert_coordinate(""), None);
    }

    #[test]
    fn wrong_field_count_fails() {
        let mut fields = valid_fields();
        fields.pop();
        assert_matches!(
            parse(&fields, "LTE").unwrap_err(),
            StationError::InvalidFieldCount(9)
        );
    }

    #[test]
    fn empty_technology_fails() {
        assert_matches!(
            parse(&valid_fields(), "").unwrap_err(),
            StationError::EmptyTechnology
        );
    }

    #[test]
    fn empty_field_fails() {
        let mut fields = valid_fields();
        fields[6] = String::new();
        assert_matches!(parse(&fields, "LTE").unwrap_err(), StationError::EmptyField);
    }

    #[test]
    fn non_integer_expiry_fails() {
        let mut fields = valid_fields();
        fields[3] = "soon".to_string();
        assert_matches!(
            parse(&fields, "LTE").unwrap_err(),
            StationError::InvalidExpiryDate(_)
        );
    }

    #[test]
    fn round_trip_reconstructs_fields() {
        let fields = valid_fields();
        let point = parse(&fields, "GSM").unwrap();

        // Invert the coordinate conversion and compare against the source DMS.
        let lon = point.longitude.abs();
        let lon_deg = lon.floor();
        let lon_min = ((lon - lon_deg) * 60.0).floor();
        let lon_sec = ((lon - lon_deg) * 3600.0 - lon_min * 60.0).round();
        assert_eq!(
            format!("{:.0}E{:02.0}'{:02.0}\"", lon_deg, lon_min, lon_sec),
            fields[4]
        );

        let perm = &point.permissions[0];
        assert_eq!(perm.operator_name, fields[0]);
        assert_eq!(perm.decision_number, fields[1]);
        assert_eq!(perm.decision_type, fields[2]);
        assert_eq!(perm.expiry_date.to_string(), fields[3]);
        assert_eq!(point.details.city, fields[6]);
        assert_eq!(point.details.location, fields[7]);
        assert_eq!(point.details.station_id, fields[8]);
        assert_eq!(point.details.teryt, fields[9]);
    }
}

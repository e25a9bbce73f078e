use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};

use crate::domain::{Location, Point, PointDetails, PointFilter, PointPermission};
use crate::error::StationError;

/// Flat-Earth degrees-per-meter factor; one degree of latitude ≈ 111 km. The
/// same factor is applied to longitude, a known approximation accepted at
/// query radii of a few kilometers.
const METERS_PER_DEGREE: f64 = 111_000.0;

const SCHEMA: &str = "
CREATE VIRTUAL TABLE IF NOT EXISTS points USING rtree(
    id,
    min_lat,
    max_lat,
    min_lon,
    max_lon
);

CREATE TABLE IF NOT EXISTS point_details (
    id         INTEGER PRIMARY KEY,
    city       TEXT,
    location   TEXT,
    station_id TEXT,
    teryt      TEXT
);

CREATE TABLE IF NOT EXISTS permissions (
    id              INTEGER PRIMARY KEY,
    point_id        INTEGER NOT NULL REFERENCES point_details(id) ON DELETE CASCADE,
    operator_name   TEXT NOT NULL,
    decision_number TEXT NOT NULL,
    decision_type   TEXT,
    expiry_date     INTEGER,
    technology      TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_point_station ON point_details(station_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_perm_unique ON permissions(point_id, technology, operator_name);
CREATE INDEX IF NOT EXISTS idx_perm_tech ON permissions(technology);
CREATE INDEX IF NOT EXISTS idx_perm_oper ON permissions(operator_name);
";

/// SQLite-backed spatial store: an R*Tree of degenerate bounding boxes plus
/// relational detail and permission tables. One writer at a time, enforced by
/// the connection lock.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StationError> {
        let conn = Connection::open(path).map_err(db_err)?;
        let _: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(db_err)?;
        conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .map_err(db_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StationError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StationError> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Idempotent upsert: details insert-or-skip on stationId (first write
    /// wins), then the degenerate bounding box and the permissions, each
    /// ignoring conflicts. One transaction per batch.
    pub fn save(&self, points: &[Point]) -> Result<(), StationError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().map_err(db_err)?;
        for point in points {
            write_point(&tx, point)?;
        }
        tx.commit().map_err(db_err)
    }

    pub fn delete_all(&self) -> Result<(), StationError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "DELETE FROM permissions;
             DELETE FROM point_details;
             DELETE FROM points;",
        )
        .map_err(db_err)
    }

    /// Points whose bounding box lies within the box spanned by
    /// `radius_meters` around `near`, optionally restricted by attribute.
    pub fn find_points(
        &self,
        near: Location,
        radius_meters: f64,
        filter: &PointFilter,
    ) -> Result<Vec<Point>, StationError> {
        let delta = radius_meters / METERS_PER_DEGREE;
        let mut conditions = vec![
            "points.min_lat >= ?".to_string(),
            "points.max_lat <= ?".to_string(),
            "points.min_lon >= ?".to_string(),
            "points.max_lon <= ?".to_string(),
        ];
        let mut args = vec![
            Value::from(near.latitude - delta),
            Value::from(near.latitude + delta),
            Value::from(near.longitude - delta),
            Value::from(near.longitude + delta),
        ];
        push_filter_conditions(filter, &mut conditions, &mut args);

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        collect_points(&conn, &conditions, args)
    }

    pub fn get_all_points(&self, filter: Option<&PointFilter>) -> Result<Vec<Point>, StationError> {
        let mut conditions = Vec::new();
        let mut args = Vec::new();
        if let Some(filter) = filter {
            push_filter_conditions(filter, &mut conditions, &mut args);
        }

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        collect_points(&conn, &conditions, args)
    }

    pub fn get_all_technologies(&self) -> Result<Vec<String>, StationError> {
        self.distinct_permission_column("technology")
    }

    pub fn get_all_operator_names(&self) -> Result<Vec<String>, StationError> {
        self.distinct_permission_column("operator_name")
    }

    fn distinct_permission_column(&self, column: &str) -> Result<Vec<String>, StationError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!(
            "SELECT DISTINCT {column} FROM permissions WHERE {column} IS NOT NULL
             ORDER BY {column} COLLATE NOCASE ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(db_err)?;
        Ok(rows)
    }
}

fn write_point(tx: &rusqlite::Transaction<'_>, point: &Point) -> Result<(), StationError> {
    tx.execute(
        "INSERT INTO point_details (station_id, city, location, teryt)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(station_id) DO NOTHING",
        params![
            point.details.station_id,
            point.details.city,
            point.details.location,
            point.details.teryt,
        ],
    )
    .map_err(db_err)?;

    let point_id: i64 = tx
        .query_row(
            "SELECT id FROM point_details WHERE station_id = ?1",
            params![point.details.station_id],
            |row| row.get(0),
        )
        .map_err(db_err)?;

    tx.execute(
        "INSERT OR IGNORE INTO points (id, min_lat, max_lat, min_lon, max_lon)
         VALUES (?1, ?2, ?2, ?3, ?3)",
        params![point_id, point.latitude, point.longitude],
    )
    .map_err(db_err)?;

    for perm in &point.permissions {
        tx.execute(
            "INSERT OR IGNORE INTO permissions
                 (point_id, operator_name, decision_number, decision_type, expiry_date, technology)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                point_id,
                perm.operator_name,
                perm.decision_number,
                perm.decision_type,
                perm.expiry_date,
                perm.technology,
            ],
        )
        .map_err(db_err)?;
    }
    Ok(())
}

fn push_filter_conditions(
    filter: &PointFilter,
    conditions: &mut Vec<String>,
    args: &mut Vec<Value>,
) {
    if let Some(technologies) = &filter.technologies {
        if !technologies.is_empty() {
            conditions.push(format!(
                "permissions.technology IN ({})",
                placeholders(technologies.len())
            ));
            args.extend(technologies.iter().cloned().map(Value::from));
        }
    }
    if let Some(operator_names) = &filter.operator_names {
        if !operator_names.is_empty() {
            conditions.push(format!(
                "permissions.operator_name IN ({})",
                placeholders(operator_names.len())
            ));
            args.extend(operator_names.iter().cloned().map(Value::from));
        }
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Joins index, details and permissions; groups rows by point id so that each
/// point carries the full list of its joined permission rows in row order.
fn collect_points(
    conn: &Connection,
    conditions: &[String],
    args: Vec<Value>,
) -> Result<Vec<Point>, StationError> {
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT
             points.id,
             point_details.city, point_details.location,
             point_details.station_id, point_details.teryt,
             permissions.operator_name, permissions.decision_number,
             permissions.decision_type, permissions.expiry_date, permissions.technology,
             points.min_lat, points.min_lon
         FROM points
         JOIN point_details ON points.id = point_details.id
         JOIN permissions ON permissions.point_id = point_details.id
         {where_clause}"
    );

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(args), |row| {
            let point_id: i64 = row.get(0)?;
            let details = PointDetails {
                city: row.get(1)?,
                location: row.get(2)?,
                station_id: row.get(3)?,
                teryt: row.get(4)?,
            };
            let permission = PointPermission {
                operator_name: row.get(5)?,
                decision_number: row.get(6)?,
                decision_type: row.get(7)?,
                expiry_date: row.get(8)?,
                technology: row.get(9)?,
            };
            let latitude: f64 = row.get(10)?;
            let longitude: f64 = row.get(11)?;
            Ok((point_id, details, permission, latitude, longitude))
        })
        .map_err(db_err)?;

    let mut grouped: HashMap<i64, Point> = HashMap::new();
    for row in rows {
        let (point_id, details, permission, latitude, longitude) = row.map_err(db_err)?;
        grouped
            .entry(point_id)
            .or_insert_with(|| Point {
                longitude,
                latitude,
                details,
                permissions: Vec::new(),
            })
            .permissions
            .push(permission);
    }
    Ok(grouped.into_values().collect())
}

fn db_err(err: rusqlite::Error) -> StationError {
    StationError::Database(err.to_string())
}

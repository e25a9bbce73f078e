use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use regex::Regex;

use crate::error::StationError;
use crate::xlsx;

const DATE_FOLDER_FORMAT: &str = "%Y-%m-%d";

/// The lettered column holding the permit expiry as a spreadsheet date serial.
const SERIAL_DATE_COLUMN: &str = "D";

/// Persists downloaded spreadsheet files under date-keyed folders and streams
/// their rows back out.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: Utf8PathBuf,
}

impl FileStorage {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn save(
        &self,
        file_data: &[u8],
        date: NaiveDate,
        file_name: &str,
    ) -> Result<(), StationError> {
        if !file_name.ends_with(".xlsx") {
            return Err(StationError::InvalidFileName(file_name.to_string()));
        }

        let folder = self.folder(date);
        fs::create_dir_all(folder.as_std_path())
            .map_err(|err| StationError::Filesystem(err.to_string()))?;

        let path = folder.join(simplify_file_name(file_name));
        write_bytes_atomic(&path, file_data)
    }

    /// Dates with a local folder, ascending.
    pub fn list_available_dates(&self) -> Result<Vec<NaiveDate>, StationError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(self.root.as_std_path())
            .map_err(|err| StationError::Filesystem(err.to_string()))?;

        let mut dates = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StationError::Filesystem(err.to_string()))?;
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if let Ok(date) = NaiveDate::parse_from_str(name, DATE_FOLDER_FORMAT) {
                    dates.push(date);
                }
            }
        }
        dates.sort();
        Ok(dates)
    }

    pub fn list_files(&self, date: NaiveDate) -> Result<Vec<Utf8PathBuf>, StationError> {
        let folder = self.folder(date);
        if !folder.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(folder.as_std_path())
            .map_err(|err| StationError::Filesystem(err.to_string()))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StationError::Filesystem(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|_| StationError::Filesystem("non-utf8 file path".to_string()))?;
            if path.extension() == Some("xlsx") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Streams the data rows of a stored file to `on_row`, skipping the header
    /// row. Each row arrives as its cell values in column order, with the
    /// serial-date column already converted to an epoch-seconds string.
    pub fn read_rows(
        &self,
        file_name: &str,
        date: NaiveDate,
        on_row: &mut dyn FnMut(Vec<String>) -> Result<(), StationError>,
    ) -> Result<(), StationError> {
        let path = self.folder(date).join(file_name);
        if !path.as_std_path().exists() {
            return Err(StationError::FileNotFound(path));
        }

        let shared = xlsx::shared_strings(path.as_std_path())?;
        let sheets = xlsx::worksheet_paths(path.as_std_path())?;
        let worksheet = sheets
            .values()
            .next()
            .ok_or(StationError::WorksheetNotFound)?;

        let rows = xlsx::RowIter::open(path.as_std_path(), worksheet, shared)?;
        for row in rows.skip(1) {
            let fields: Vec<String> = row
                .values
                .into_iter()
                .map(|(column, value)| {
                    if column == SERIAL_DATE_COLUMN {
                        transform_serial_date(&value)
                    } else {
                        value
                    }
                })
                .collect();
            on_row(fields)?;
        }
        Ok(())
    }

    pub fn delete_folder(&self, date: NaiveDate) -> Result<(), StationError> {
        let folder = self.folder(date);
        if folder.as_std_path().exists() {
            fs::remove_dir_all(folder.as_std_path())
                .map_err(|err| StationError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn delete_all(&self) -> Result<(), StationError> {
        for date in self.list_available_dates()? {
            self.delete_folder(date)?;
        }
        Ok(())
    }

    fn folder(&self, date: NaiveDate) -> Utf8PathBuf {
        self.root.join(date.format(DATE_FOLDER_FORMAT).to_string())
    }
}

fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), StationError> {
    let parent = path
        .parent()
        .ok_or_else(|| StationError::Filesystem("invalid destination path".to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix("uke-stations-file")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| StationError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), content).map_err(|err| StationError::Filesystem(err.to_string()))?;
    if path.as_std_path().exists() {
        fs::remove_file(path.as_std_path())
            .map_err(|err| StationError::Filesystem(err.to_string()))?;
    }
    temp.persist(path.as_std_path())
        .map_err(|err| StationError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Upstream file names carry a `_-_stan_na_YYYY-MM-DD` suffix that changes
/// with every publication; stored names drop it.
fn simplify_file_name(full_name: &str) -> String {
    let pattern = Regex::new(r"_-_stan_na_\d{4}-\d{2}-\d{2}").unwrap();
    pattern.replace_all(full_name, "").into_owned()
}

fn transform_serial_date(value: &str) -> String {
    match value.parse::<f64>().ok().and_then(excel_serial_to_unix) {
        Some(timestamp) => timestamp.to_string(),
        None => String::new(),
    }
}

/// Converts an Excel date serial to unix epoch seconds (UTC). Serials of 60
/// and above are reduced by one day to compensate for the fictitious
/// 1900-02-29 the serial scheme counts.
pub fn excel_serial_to_unix(serial: f64) -> Option<i64> {
    let whole_days = serial.trunc() as i64;
    let fraction = serial - whole_days as f64;
    let corrected_days = if whole_days >= 60 {
        whole_days - 1
    } else {
        whole_days
    };

    let origin = NaiveDate::from_ymd_opt(1899, 12, 31)?
        .and_hms_opt(0, 0, 0)?
        .and_utc()
        .timestamp();
    Some(origin + corrected_days * 86_400 + (fraction * 86_400.0) as i64)
}

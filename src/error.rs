use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum StationError {
    #[error("index page request failed: {0}")]
    IndexHttp(String),

    #[error("index page returned status {status}: {message}")]
    IndexStatus { status: u16, message: String },

    #[error("file download failed: {0}")]
    DownloadHttp(String),

    #[error("no publication date found in index page")]
    MissingPublicationDate,

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("file not found: {0}")]
    FileNotFound(Utf8PathBuf),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("spreadsheet archive error: {0}")]
    Archive(String),

    #[error("missing archive part: {0}")]
    MissingArchivePart(String),

    #[error("workbook contains no worksheet")]
    WorksheetNotFound,

    #[error("expected 10 row fields, got {0}")]
    InvalidFieldCount(usize),

    #[error("technology cannot be empty")]
    EmptyTechnology,

    #[error("row fields cannot be empty")]
    EmptyField,

    #[error("invalid expiry date: {0}")]
    InvalidExpiryDate(String),

    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("database error: {0}")]
    Database(String),
}

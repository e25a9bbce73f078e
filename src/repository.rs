use std::sync::Mutex;

use camino::Utf8Path;
use chrono::NaiveDate;

use crate::accumulator::{DEFAULT_FLUSH_SIZE, PointAccumulator};
use crate::db::Database;
use crate::domain::{Location, Point, PointFilter};
use crate::downloader::PublicationClient;
use crate::error::StationError;
use crate::limiter::{ConcurrencyLimiter, Task};
use crate::storage::FileStorage;

/// Publication files processed concurrently per group.
const FILE_GROUP_SIZE: usize = 3;
/// Upper bound on concurrent database flushes.
const FLUSH_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub fraction: f64,
    pub message: String,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Sink for callers that do not care about progress.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Ties the remote publication source, the local spreadsheet store and the
/// spatial database together behind one query-and-refresh surface.
pub struct PointsRepository<C: PublicationClient> {
    client: C,
    storage: FileStorage,
    db: Database,
    page_url: String,
}

impl<C: PublicationClient> PointsRepository<C> {
    pub fn new(client: C, storage: FileStorage, db: Database, page_url: String) -> Self {
        Self {
            client,
            storage,
            db,
            page_url,
        }
    }

    /// True when the remote publication date is newer than every locally
    /// stored date. No local data counts as out of date.
    pub fn is_new_version_available(&self) -> Result<bool, StationError> {
        let remote = self.client.fetch_current_data_date(&self.page_url)?;
        let local = self.storage.list_available_dates()?;
        Ok(match local.last() {
            Some(latest) => remote > *latest,
            None => true,
        })
    }

    pub fn get_remote_date(&self) -> Result<NaiveDate, StationError> {
        self.client.fetch_current_data_date(&self.page_url)
    }

    pub fn get_local_dates(&self) -> Result<Vec<NaiveDate>, StationError> {
        self.storage.list_available_dates()
    }

    pub fn get_points(
        &self,
        near: Location,
        radius_meters: f64,
        filter: &PointFilter,
    ) -> Result<Vec<Point>, StationError> {
        self.db.find_points(near, radius_meters, filter)
    }

    pub fn get_all_points(&self, filter: Option<&PointFilter>) -> Result<Vec<Point>, StationError> {
        self.db.get_all_points(filter)
    }

    pub fn get_technologies(&self) -> Result<Vec<String>, StationError> {
        self.db.get_all_technologies()
    }

    pub fn get_operator_names(&self) -> Result<Vec<String>, StationError> {
        self.db.get_all_operator_names()
    }

    pub fn delete_all_local_data(&self) -> Result<(), StationError> {
        self.db.delete_all()?;
        self.storage.delete_all()
    }

    /// Downloads the current publication, replaces the database contents with
    /// the rows of the latest stored one, and reports progress as a fraction
    /// of the whole run. Files that cannot be stored or read are skipped with
    /// a warning; database failures abort.
    pub fn refresh(&self, sink: &dyn ProgressSink) -> Result<Option<NaiveDate>, StationError> {
        sink.event(ProgressEvent {
            fraction: 0.0,
            message: "phase=Download; fetching publication files".to_string(),
        });

        self.client.download_files(&self.page_url, &mut |date, data, name| {
            if let Err(err) = self.storage.save(data, date, name) {
                tracing::warn!(name, error = %err, "skipping file that could not be stored");
            }
        })?;

        // The parse date comes from the store, not this run's downloads, so a
        // run where every download was skipped re-ingests the latest local
        // publication.
        let Some(date) = self.storage.list_available_dates()?.last().copied() else {
            sink.event(ProgressEvent {
                fraction: 1.0,
                message: "phase=Done; no publication data available".to_string(),
            });
            return Ok(None);
        };

        sink.event(ProgressEvent {
            fraction: 0.3,
            message: "phase=Store; clearing previous data".to_string(),
        });
        self.db.delete_all()?;

        sink.event(ProgressEvent {
            fraction: 0.4,
            message: "phase=Parse; reading spreadsheets".to_string(),
        });
        let files = self.storage.list_files(date)?;

        let limiter = ConcurrencyLimiter::new(FLUSH_CONCURRENCY);
        let flush = |batch: Vec<Point>| -> Result<(), StationError> {
            let task: Task<'_, StationError> = Box::new(move || self.db.save(&batch));
            limiter.run(vec![task])
        };
        let accumulator = PointAccumulator::new(DEFAULT_FLUSH_SIZE, &flush);

        let group_count = files.chunks(FILE_GROUP_SIZE).len().max(1);
        for (index, group) in files.chunks(FILE_GROUP_SIZE).enumerate() {
            self.process_group(group, date, &accumulator)?;
            let fraction = 0.40 + 0.55 * (index + 1) as f64 / group_count as f64;
            sink.event(ProgressEvent {
                fraction,
                message: format!("phase=Parse; processed {} of {group_count} groups", index + 1),
            });
        }
        accumulator.finish()?;

        sink.event(ProgressEvent {
            fraction: 1.0,
            message: "phase=Done; data refreshed".to_string(),
        });
        Ok(Some(date))
    }

    fn process_group(
        &self,
        group: &[camino::Utf8PathBuf],
        date: NaiveDate,
        accumulator: &PointAccumulator<'_>,
    ) -> Result<(), StationError> {
        let fatal: Mutex<Option<StationError>> = Mutex::new(None);
        std::thread::scope(|scope| {
            for file in group {
                let fatal = &fatal;
                scope.spawn(move || {
                    if let Err(err) = self.process_file(file, date, accumulator) {
                        if matches!(err, StationError::Database(_)) {
                            let mut slot = fatal.lock().unwrap_or_else(|e| e.into_inner());
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                        } else {
                            tracing::warn!(file = %file, error = %err, "skipping unreadable file");
                        }
                    }
                });
            }
        });
        match fatal.into_inner().unwrap_or_else(|e| e.into_inner()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// One spreadsheet end to end. The technology name is the file stem;
    /// rows that fail validation are dropped individually.
    fn process_file(
        &self,
        file: &Utf8Path,
        date: NaiveDate,
        accumulator: &PointAccumulator<'_>,
    ) -> Result<(), StationError> {
        let file_name = file
            .file_name()
            .ok_or_else(|| StationError::InvalidFileName(file.to_string()))?;
        let technology = file
            .file_stem()
            .ok_or_else(|| StationError::InvalidFileName(file.to_string()))?;

        self.storage.read_rows(file_name, date, &mut |fields| {
            match crate::mapper::parse(&fields, technology) {
                Ok(point) => accumulator.add(point),
                Err(err) => {
                    tracing::debug!(technology, error = %err, "dropping invalid row");
                    Ok(())
                }
            }
        })
    }
}

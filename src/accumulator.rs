use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::Point;
use crate::error::StationError;

pub type FlushHandler<'a> = &'a (dyn Fn(Vec<Point>) -> Result<(), StationError> + Sync);

pub const DEFAULT_FLUSH_SIZE: usize = 5_000;

/// Deduplicating buffer between the parser workers and the spatial store.
///
/// All mutation goes through one internal lock, so concurrent producers see a
/// single logical writer: permission merge, the threshold check and the flush
/// itself happen inside the same critical section.
pub struct PointAccumulator<'a> {
    buffer: Mutex<HashMap<String, Point>>,
    flush_size: usize,
    flush_handler: FlushHandler<'a>,
}

impl<'a> PointAccumulator<'a> {
    pub fn new(flush_size: usize, flush_handler: FlushHandler<'a>) -> Self {
        Self {
            buffer: Mutex::new(HashMap::new()),
            flush_size: flush_size.max(1),
            flush_handler,
        }
    }

    /// Merges `point` into the buffer; a point with a known stationId only
    /// contributes permissions with unseen (technology, operatorName) pairs.
    /// Flushes synchronously once the buffer holds `flush_size` station ids.
    pub fn add(&self, point: Point) -> Result<(), StationError> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());

        match buffer.get_mut(&point.details.station_id) {
            Some(existing) => existing.merge_permissions(point.permissions),
            None => {
                buffer.insert(point.details.station_id.clone(), point);
            }
        }

        if buffer.len() >= self.flush_size {
            self.flush_locked(&mut buffer)?;
        }
        Ok(())
    }

    /// Flushes any remainder.
    pub fn finish(&self) -> Result<(), StationError> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        self.flush_locked(&mut buffer)
    }

    fn flush_locked(&self, buffer: &mut HashMap<String, Point>) -> Result<(), StationError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let batch: Vec<Point> = std::mem::take(buffer).into_values().collect();
        (self.flush_handler)(batch)
    }
}

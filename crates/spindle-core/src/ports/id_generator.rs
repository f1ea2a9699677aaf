//! IdGenerator port - job id generation.
//!
//! `UlidGenerator` takes its timestamp from a `Clock`, so tests running on a
//! `ManualClock` get ids stamped with simulated time.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use ulid::{Generator, Ulid};

use crate::domain::JobId;
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_job_id(&self) -> JobId;
}

/// Monotonic ULID generator.
///
/// Ids generated within the same millisecond increment the random part
/// instead of drawing a fresh one, so issue order equals sort order.
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
    inner: Mutex<Generator>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Generator::new()),
        }
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_job_id(&self) -> JobId {
        let now = self.clock.now();
        let mut generator = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ulid = match generator.generate_from_datetime(SystemTime::from(now)) {
            Ok(ulid) => ulid,
            // random part overflowed within one millisecond; fall back to a fresh draw
            Err(_) => Ulid::from_parts(now.timestamp_millis() as u64, rand::random()),
        };
        JobId::from(ulid)
    }
}

//! Collaborators injected into the backend at construction.
//!
//! The engine owns no time source, entropy source, or cipher of its own;
//! hosts and tests supply all three, which keeps every code path
//! reproducible under pinned collaborators.

use std::{
    cell::Cell,
    rc::Rc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{error::AttributionError, pds::config::AggregationService, time::Timestamp};

/// Source of the current instant. The backend never reads the wall clock
/// directly.
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time in milliseconds since the Unix epoch.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Timestamp::from_millis(millis)
    }
}

/// A clock advanced explicitly by the host. Browsers serialize calls per
/// profile and pass the instant they consider current. Clones share the
/// same instant, so the host keeps a handle after handing one to the
/// backend.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<i64>>,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Rc::new(Cell::new(now.as_millis())),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.set(now.as_millis());
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get().saturating_add(by.as_millis() as i64));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.now.get())
    }
}

/// Source of uniform draws from the half-open unit interval.
pub trait UnitRng {
    fn random(&mut self) -> f64;
}

/// Validates a draw before use; values outside `[0, 1)` indicate a broken
/// collaborator and are fatal.
pub fn draw_unit(rng: &mut dyn UnitRng) -> Result<f64, AttributionError> {
    let draw = rng.random();
    if !(0.0..1.0).contains(&draw) {
        return Err(AttributionError::InvalidState(format!(
            "rng draw {draw} outside [0, 1)"
        )));
    }
    Ok(draw)
}

/// Default entropy source, backed by `StdRng`.
#[derive(Debug)]
pub struct EntropyRng(StdRng);

impl EntropyRng {
    pub fn new() -> Self {
        Self(StdRng::from_entropy())
    }

    /// Reproducible stream for simulations and tests.
    pub fn from_seed(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl Default for EntropyRng {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitRng for EntropyRng {
    fn random(&mut self) -> f64 {
        self.0.gen()
    }
}

/// Replays a fixed tape of draws, cycling when exhausted. Pins epoch
/// origins and allocator decisions in tests.
#[derive(Debug)]
pub struct ScriptedRng {
    tape: Vec<f64>,
    next: usize,
}

impl ScriptedRng {
    pub fn new(tape: Vec<f64>) -> Self {
        Self { tape, next: 0 }
    }
}

impl UnitRng for ScriptedRng {
    fn random(&mut self) -> f64 {
        if self.tape.is_empty() {
            return 0.0;
        }
        let draw = self.tape[self.next % self.tape.len()];
        self.next += 1;
        draw
    }
}

/// Wraps a finished histogram into the opaque report bytes delivered to an
/// aggregation service.
pub trait ReportEncryptor {
    fn seal(
        &self,
        service: &AggregationService,
        histogram: &[u32],
    ) -> Result<Vec<u8>, AttributionError>;
}

/// Little-endian plaintext encoding. Debug and test use only; pairs with
/// the backend's unencrypted-histogram toggle.
#[derive(Debug, Default)]
pub struct PassthroughEncryptor;

impl ReportEncryptor for PassthroughEncryptor {
    fn seal(
        &self,
        _service: &AggregationService,
        histogram: &[u32],
    ) -> Result<Vec<u8>, AttributionError> {
        Ok(histogram.iter().flat_map(|v| v.to_le_bytes()).collect())
    }
}

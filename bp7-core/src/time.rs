//! Time management. Two units are in play: monotonic time, a (boot era,
//! milliseconds since boot) pair that is only ordered within an era, and DTN
//! time, milliseconds since 2000-01-01T00:00:00Z. A correlation factor
//! captured while the host clock is valid converts between them; factors for
//! past eras survive reboots in persisted ring buffers.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Milliseconds between the Unix epoch and the DTN epoch.
pub const DTN_EPOCH_UNIX_MS: i64 = 946_684_800_000;

/// Slots in each persisted ring buffer, keyed by boot era.
pub const TIME_RING_SLOTS: usize = 32;

const TIME_FILE_MAGIC: u32 = 0x4250_5444; // "BPTD"

/// Monotonic time: total-orderable only within one boot era.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonotonicTime {
    pub boot_era: u32,
    pub ms: i64,
}

/// Host clock access. Mirrors the proxy callbacks the embedding host
/// provides: a monotonic millisecond counter and a wall clock that may or
/// may not currently be valid.
pub trait MonotonicSource: Send + Sync {
    /// Milliseconds since boot.
    fn monotonic_ms(&self) -> i64;
    /// Host wall-clock milliseconds since the Unix epoch.
    fn host_time_ms(&self) -> i64;
    /// Whether the host clock is currently trustworthy.
    fn host_clock_valid(&self) -> bool;
}

/// Host clock backed by the operating system.
pub struct SystemMonotonic {
    start: Instant,
}

impl SystemMonotonic {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemMonotonic {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicSource for SystemMonotonic {
    fn monotonic_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    fn host_time_ms(&self) -> i64 {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(_) => 0,
        }
    }

    fn host_clock_valid(&self) -> bool {
        // a host clock sitting before the DTN epoch is unset
        self.host_time_ms() > DTN_EPOCH_UNIX_MS
    }
}

/// A manual clock for deterministic tests.
pub struct ManualMonotonic {
    state: parking_lot::Mutex<(i64, i64, bool)>,
}

impl ManualMonotonic {
    pub fn new(monotonic_ms: i64, host_time_ms: i64, valid: bool) -> Self {
        Self {
            state: parking_lot::Mutex::new((monotonic_ms, host_time_ms, valid)),
        }
    }

    pub fn advance(&self, ms: i64) {
        let mut s = self.state.lock();
        s.0 += ms;
        s.1 += ms;
    }

    pub fn set_valid(&self, valid: bool) {
        self.state.lock().2 = valid;
    }

    pub fn set_host_time(&self, host_time_ms: i64) {
        self.state.lock().1 = host_time_ms;
    }
}

impl MonotonicSource for ManualMonotonic {
    fn monotonic_ms(&self) -> i64 {
        self.state.lock().0
    }

    fn host_time_ms(&self) -> i64 {
        self.state.lock().1
    }

    fn host_clock_valid(&self) -> bool {
        self.state.lock().2
    }
}

#[derive(Debug, Clone, Copy)]
struct TimeData {
    curr_boot_era: u32,
    cf_ring: [i64; TIME_RING_SLOTS],
    dtn_time_ring: [u64; TIME_RING_SLOTS],
}

impl Default for TimeData {
    fn default() -> Self {
        Self {
            curr_boot_era: 0,
            cf_ring: [0; TIME_RING_SLOTS],
            dtn_time_ring: [0; TIME_RING_SLOTS],
        }
    }
}

impl TimeData {
    const ENCODED_SIZE: usize = 4 + 4 + TIME_RING_SLOTS * 8 * 2;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_SIZE);
        buf.extend_from_slice(&TIME_FILE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.curr_boot_era.to_le_bytes());
        for cf in &self.cf_ring {
            buf.extend_from_slice(&cf.to_le_bytes());
        }
        for dtn in &self.dtn_time_ring {
            buf.extend_from_slice(&dtn.to_le_bytes());
        }
        buf
    }

    fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "time data file truncated",
            ));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != TIME_FILE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "time data file magic mismatch",
            ));
        }
        let mut data = TimeData {
            curr_boot_era: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            ..Default::default()
        };
        let mut pos = 8;
        for cf in &mut data.cf_ring {
            *cf = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
        }
        for dtn in &mut data.dtn_time_ring {
            *dtn = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
        }
        Ok(data)
    }
}

/// Monotonic-to-DTN conversion with persisted boot-era history.
pub struct TimeKeeper {
    source: Arc<dyn MonotonicSource>,
    epoch_offset: i64,
    current_cf: i64,
    data: TimeData,
    path: Option<PathBuf>,
}

impl TimeKeeper {
    /// Loads persisted time data (if a path is given and the file exists),
    /// advances the boot era, and runs the first maintenance pass.
    pub fn init(source: Arc<dyn MonotonicSource>, path: Option<&Path>) -> io::Result<TimeKeeper> {
        let data = match path {
            Some(p) if p.exists() => {
                let mut buf = Vec::new();
                fs::File::open(p)?.read_to_end(&mut buf)?;
                match TimeData::from_bytes(&buf) {
                    Ok(d) => d,
                    Err(err) => {
                        warn!(?err, "discarding unreadable time data file");
                        TimeData::default()
                    }
                }
            }
            _ => TimeData::default(),
        };
        let mut keeper = TimeKeeper {
            source,
            epoch_offset: -DTN_EPOCH_UNIX_MS,
            current_cf: 0,
            data,
            path: path.map(Path::to_path_buf),
        };
        keeper.data.curr_boot_era += 1;
        keeper.maintenance()?;
        Ok(keeper)
    }

    pub fn boot_era(&self) -> u32 {
        self.data.curr_boot_era
    }

    pub fn now_monotonic(&self) -> MonotonicTime {
        MonotonicTime {
            boot_era: self.data.curr_boot_era,
            ms: self.source.monotonic_ms(),
        }
    }

    /// Correlation factor valid right now, or 0 when the host clock is not.
    pub fn calculate_correlation_factor(&self) -> i64 {
        if !self.source.host_clock_valid() {
            return 0;
        }
        self.source.host_time_ms() - self.source.monotonic_ms() + self.epoch_offset
    }

    pub fn current_correlation_factor(&self) -> i64 {
        self.current_cf
    }

    /// Recomputes the correlation factor and, when a valid one was captured,
    /// records it in the rings and persists them. Returns whether a valid
    /// factor was captured.
    pub fn maintenance(&mut self) -> io::Result<bool> {
        let cf = self.calculate_correlation_factor();
        let valid = cf != 0;
        if valid {
            let slot = self.data.curr_boot_era as usize % TIME_RING_SLOTS;
            self.data.cf_ring[slot] = cf;
            self.data.dtn_time_ring[slot] = (self.source.monotonic_ms() + cf) as u64;
            self.persist()?;
        }
        self.current_cf = cf;
        Ok(valid)
    }

    fn persist(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = self.data.to_bytes();
        let mut tmp = path.clone();
        tmp.set_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(era = self.data.curr_boot_era, "time data persisted");
        Ok(())
    }

    fn cf_for_era(&self, era: u32) -> i64 {
        if era == self.data.curr_boot_era {
            self.current_cf
        } else {
            self.data.cf_ring[era as usize % TIME_RING_SLOTS]
        }
    }

    /// Converts a monotonic time to DTN milliseconds; 0 when no valid
    /// correlation is known for its era.
    pub fn dtn_time(&self, t: MonotonicTime) -> u64 {
        let cf = self.cf_for_era(t.boot_era);
        if cf == 0 {
            return 0;
        }
        (t.ms + cf).max(0) as u64
    }

    pub fn current_dtn_time(&self) -> u64 {
        if self.current_cf == 0 {
            return 0;
        }
        (self.source.monotonic_ms() + self.current_cf).max(0) as u64
    }

    /// Millisecond delta `t1 - t2`; `None` when the eras differ and either
    /// side cannot be resolved to DTN time.
    pub fn time_delta(&self, t1: MonotonicTime, t2: MonotonicTime) -> Option<i64> {
        if t1.boot_era == t2.boot_era {
            return Some(t1.ms - t2.ms);
        }
        let d1 = self.dtn_time(t1);
        let d2 = self.dtn_time(t2);
        if d1 == 0 || d2 == 0 {
            return None;
        }
        Some(d1 as i64 - d2 as i64)
    }

    /// Timeline the cache runs on: DTN time when correlated, bare monotonic
    /// milliseconds as a fallback so timers still advance.
    pub fn cache_time(&self) -> u64 {
        let dtn = self.current_dtn_time();
        if dtn != 0 {
            dtn
        } else {
            self.source.monotonic_ms().max(0) as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual(valid: bool) -> Arc<ManualMonotonic> {
        // host time: some wall clock well past the DTN epoch
        Arc::new(ManualMonotonic::new(5_000, DTN_EPOCH_UNIX_MS + 1_000_000, valid))
    }

    #[test]
    fn init_increments_boot_era() {
        let keeper = TimeKeeper::init(manual(true), None).unwrap();
        assert_eq!(keeper.boot_era(), 1);
    }

    #[test]
    fn dtn_time_uses_current_cf() {
        let clock = manual(true);
        let keeper = TimeKeeper::init(clock.clone(), None).unwrap();
        let now = keeper.now_monotonic();
        // host is 1,000,000 ms past the DTN epoch at monotonic 5,000
        assert_eq!(keeper.dtn_time(now), 1_000_000);
        clock.advance(500);
        let later = keeper.now_monotonic();
        assert_eq!(keeper.dtn_time(later), 1_000_500);
    }

    #[test]
    fn invalid_host_clock_yields_zero() {
        let keeper = TimeKeeper::init(manual(false), None).unwrap();
        assert_eq!(keeper.current_correlation_factor(), 0);
        assert_eq!(keeper.current_dtn_time(), 0);
        let t = keeper.now_monotonic();
        assert_eq!(keeper.dtn_time(t), 0);
        // cache timers fall back to raw monotonic
        assert_eq!(keeper.cache_time(), 5_000);
    }

    #[test]
    fn unknown_past_era_yields_zero() {
        let keeper = TimeKeeper::init(manual(true), None).unwrap();
        let past = MonotonicTime {
            boot_era: 0,
            ms: 123,
        };
        assert_eq!(keeper.dtn_time(past), 0);
    }

    #[test]
    fn persisted_rings_survive_reinit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time.dat");

        let clock = manual(true);
        {
            let keeper = TimeKeeper::init(clock.clone(), Some(&path)).unwrap();
            assert_eq!(keeper.boot_era(), 1);
            assert!(path.exists());
        }

        // "reboot": new keeper reads the file, era advances, and the old
        // era's correlation factor still resolves
        let keeper2 = TimeKeeper::init(manual(true), Some(&path)).unwrap();
        assert_eq!(keeper2.boot_era(), 2);
        let old_era_time = MonotonicTime {
            boot_era: 1,
            ms: 5_000,
        };
        assert_eq!(keeper2.dtn_time(old_era_time), 1_000_000);
    }

    #[test]
    fn time_delta_same_era_is_plain_subtraction() {
        let keeper = TimeKeeper::init(manual(false), None).unwrap();
        let a = MonotonicTime {
            boot_era: 1,
            ms: 900,
        };
        let b = MonotonicTime {
            boot_era: 1,
            ms: 400,
        };
        assert_eq!(keeper.time_delta(a, b), Some(500));
        // cross-era with no correlation data is unresolvable
        let c = MonotonicTime {
            boot_era: 0,
            ms: 100,
        };
        assert_eq!(keeper.time_delta(a, c), None);
    }

    #[test]
    fn corrupt_time_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time.dat");
        fs::write(&path, b"not a time file").unwrap();
        let keeper = TimeKeeper::init(manual(true), Some(&path)).unwrap();
        assert_eq!(keeper.boot_era(), 1);
    }
}

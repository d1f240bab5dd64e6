//! Coverage oracles that score an iteration's novelty.
//!
//! All guiders share one contract: [`Guider::check`] reports how many new
//! coverage points (model states, trace hashes, or source lines) one
//! iteration contributed. `num_new > 0` is what triggers mutation in the
//! fuzzer. Guider state grows monotonically within a run and is reset
//! between comparison runs.
//!
//! Transport failures are never fatal: they are logged, counted, and the
//! iteration is treated as covering nothing new.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::PathBuf;

use log::warn;
use serde::Serialize;

use crate::event::{trace_hash, EventTrace};
use crate::schedule::Schedule;
use crate::tlc::{TlcClient, REQUEST_TIMEOUT};

/// A coverage oracle.
pub trait Guider {
    /// Score one executed iteration. Returns `(num_new, novelty_ratio)`
    /// where `novelty_ratio = num_new / max(coverage, 1)` against the
    /// oracle's accumulated coverage corpus.
    fn check(&mut self, trace: &Schedule, events: &EventTrace) -> (usize, f64);

    /// Total coverage points accumulated so far.
    fn coverage(&self) -> usize;

    /// Forget all accumulated coverage (between comparison runs).
    fn reset(&mut self);
}

#[derive(Serialize)]
struct TraceRecord<'a> {
    trace: &'a Schedule,
    event_trace: &'a EventTrace,
    coverage: usize,
}

/// Writes every iteration's `(trace, event trace, coverage)` as JSON under
/// a traces directory, one `fuzz_{i}.json` per iteration.
struct TraceRecorder {
    dir: PathBuf,
    iteration: usize,
}

impl TraceRecorder {
    fn new(dir: PathBuf) -> Self {
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("failed to create trace dir {}: {}", dir.display(), e);
        }
        Self { dir, iteration: 0 }
    }

    fn record(&mut self, trace: &Schedule, events: &EventTrace, coverage: usize) {
        let path = self.dir.join(format!("fuzz_{}.json", self.iteration));
        self.iteration += 1;
        let record = TraceRecord {
            trace,
            event_trace: events,
            coverage,
        };
        let result = File::create(&path)
            .map_err(serde_json::Error::io)
            .and_then(|file| serde_json::to_writer_pretty(file, &record));
        if let Err(e) = result {
            warn!("failed to record trace {}: {}", path.display(), e);
        }
    }

    fn reset(&mut self) {
        self.iteration = 0;
    }
}

/// Scores an iteration by the TLC model states its event trace reaches.
pub struct TlcStateGuider {
    client: TlcClient,
    seen: BTreeSet<String>,
    failures: u64,
    recorder: Option<TraceRecorder>,
}

impl TlcStateGuider {
    /// `addr` is the TLC server `host:port`; pass a directory to also
    /// record every iteration's trace.
    pub fn new(addr: &str, record_dir: Option<PathBuf>) -> Self {
        Self {
            client: TlcClient::new(addr),
            seen: BTreeSet::new(),
            failures: 0,
            recorder: record_dir.map(TraceRecorder::new),
        }
    }

    /// TLC round trips that failed (network, status, malformed body).
    pub fn failures(&self) -> u64 {
        self.failures
    }
}

impl Guider for TlcStateGuider {
    fn check(&mut self, trace: &Schedule, events: &EventTrace) -> (usize, f64) {
        let num_new = match self.client.send_trace(events) {
            Ok(states) => states
                .into_iter()
                .filter(|s| self.seen.insert(s.key.clone()))
                .count(),
            Err(e) => {
                warn!("tlc check failed: {}", e);
                self.failures += 1;
                0
            }
        };
        if let Some(recorder) = &mut self.recorder {
            recorder.record(trace, events, self.seen.len());
        }
        (num_new, num_new as f64 / self.seen.len().max(1) as f64)
    }

    fn coverage(&self) -> usize {
        self.seen.len()
    }

    fn reset(&mut self) {
        self.seen.clear();
        self.failures = 0;
        if let Some(recorder) = &mut self.recorder {
            recorder.reset();
        }
    }
}

/// Scores an iteration by whether its canonical event trace is new,
/// while still feeding the shared TLC state set.
pub struct TraceCoverageGuider {
    tlc: TlcStateGuider,
    hashes: BTreeSet<String>,
}

impl TraceCoverageGuider {
    pub fn new(addr: &str, record_dir: Option<PathBuf>) -> Self {
        Self {
            tlc: TlcStateGuider::new(addr, record_dir),
            hashes: BTreeSet::new(),
        }
    }
}

impl Guider for TraceCoverageGuider {
    fn check(&mut self, trace: &Schedule, events: &EventTrace) -> (usize, f64) {
        // Keep the TLC state corpus warm; novelty here is the trace hash.
        let _ = self.tlc.check(trace, events);
        let num_new = usize::from(self.hashes.insert(trace_hash(events)));
        (num_new, num_new as f64 / self.hashes.len().max(1) as f64)
    }

    fn coverage(&self) -> usize {
        self.hashes.len()
    }

    fn reset(&mut self) {
        self.tlc.reset();
        self.hashes.clear();
    }
}

/// Scores an iteration by the source lines the system under test reports
/// as executed. Counters on the SUT side are cumulative; the guider keeps
/// the union and diffs client-side.
pub struct LineCoverageGuider {
    agent: ureq::Agent,
    url: String,
    seen: BTreeSet<String>,
    failures: u64,
    recorder: Option<TraceRecorder>,
}

impl LineCoverageGuider {
    /// `addr` is the SUT coverage endpoint `host:port`.
    pub fn new(addr: &str, record_dir: Option<PathBuf>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            agent,
            url: format!("http://{addr}/coverage"),
            seen: BTreeSet::new(),
            failures: 0,
            recorder: record_dir.map(TraceRecorder::new),
        }
    }

    fn fetch_lines(&self) -> Result<Vec<String>, Box<dyn std::error::Error>> {
        let response = self.agent.get(&self.url).call()?;
        Ok(response.into_json::<Vec<String>>()?)
    }
}

impl Guider for LineCoverageGuider {
    fn check(&mut self, trace: &Schedule, events: &EventTrace) -> (usize, f64) {
        let num_new = match self.fetch_lines() {
            Ok(lines) => lines
                .into_iter()
                .filter(|line| self.seen.insert(line.clone()))
                .count(),
            Err(e) => {
                warn!("coverage fetch failed: {}", e);
                self.failures += 1;
                0
            }
        };
        if let Some(recorder) = &mut self.recorder {
            recorder.record(trace, events, self.seen.len());
        }
        (num_new, num_new as f64 / self.seen.len().max(1) as f64)
    }

    fn coverage(&self) -> usize {
        self.seen.len()
    }

    fn reset(&mut self) {
        self.seen.clear();
        self.failures = 0;
        if let Some(recorder) = &mut self.recorder {
            recorder.reset();
        }
    }
}

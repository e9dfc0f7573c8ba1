//! The `stats` module collects client-observed latencies into a histogram
//! and summarizes throughput and tail percentiles at the end of a run.

use {
    crate::{
        result::Result,
        wire::{OpKind, OpResult},
    },
    log::info,
    serde_derive::Serialize,
    std::{
        collections::BTreeMap,
        fs::File,
        io::Write,
        path::Path,
        sync::Mutex,
        time::Instant,
    },
};

#[derive(Default)]
struct Inner {
    /// latency in microseconds -> completions at that latency
    latencies: BTreeMap<u64, u64>,
    issued: u64,
    completed: u64,
    gets: u64,
    puts: u64,
    dels: u64,
    not_found: u64,
    started_at: Option<Instant>,
    elapsed_us: u64,
    recording: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct Summary {
    pub duration_us: u64,
    pub issued: u64,
    pub completed: u64,
    pub throughput: u64,
    pub average_latency_us: u64,
    pub median_latency_us: u64,
    pub p90_latency_us: u64,
    pub p99_latency_us: u64,
}

#[derive(Default)]
pub struct LatencyStats {
    inner: Mutex<Inner>,
}

impl LatencyStats {
    pub fn new() -> Self {
        LatencyStats::default()
    }

    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.started_at = Some(Instant::now());
        inner.recording = true;
    }

    pub fn done(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(started_at) = inner.started_at {
            inner.elapsed_us = started_at.elapsed().as_micros() as u64;
        }
        inner.recording = false;
    }

    pub fn report_issue(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.recording {
            inner.issued += 1;
        }
    }

    pub fn report_op(&self, op: OpKind, latency_us: u64, result: OpResult) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.recording {
            return;
        }
        inner.completed += 1;
        *inner.latencies.entry(latency_us).or_insert(0) += 1;
        match op {
            OpKind::Get => inner.gets += 1,
            OpKind::Put | OpKind::PutFwd => inner.puts += 1,
            OpKind::Del => inner.dels += 1,
        }
        if result == OpResult::NotFound {
            inner.not_found += 1;
        }
    }

    /// Latency at `ptile` of completions seen so far.
    pub fn latency_at(&self, ptile: f64) -> u64 {
        let inner = self.inner.lock().unwrap();
        percentile(&inner.latencies, inner.completed, ptile)
    }

    pub fn completed(&self) -> u64 {
        self.inner.lock().unwrap().completed
    }

    pub fn summary(&self) -> Summary {
        let inner = self.inner.lock().unwrap();
        let total_latency: u64 = inner
            .latencies
            .iter()
            .map(|(latency, count)| latency * count)
            .sum();
        let duration_us = inner.elapsed_us.max(1);
        Summary {
            duration_us,
            issued: inner.issued,
            completed: inner.completed,
            throughput: inner.completed * 1_000_000 / duration_us,
            average_latency_us: total_latency
                .checked_div(inner.completed)
                .unwrap_or_default(),
            median_latency_us: percentile(&inner.latencies, inner.completed, 0.5),
            p90_latency_us: percentile(&inner.latencies, inner.completed, 0.9),
            p99_latency_us: percentile(&inner.latencies, inner.completed, 0.99),
        }
    }

    /// Log the run summary as one JSON line and optionally dump the raw
    /// histogram as `latency count` rows.
    pub fn dump(&self, histogram_path: Option<&Path>) -> Result<Summary> {
        let summary = self.summary();
        info!("STATS:{}", serde_json::to_string(&summary)?);
        if let Some(path) = histogram_path {
            let inner = self.inner.lock().unwrap();
            let mut file = File::create(path)?;
            for (latency, count) in &inner.latencies {
                writeln!(file, "{latency} {count}")?;
            }
        }
        Ok(summary)
    }
}

fn percentile(latencies: &BTreeMap<u64, u64>, completed: u64, ptile: f64) -> u64 {
    if completed == 0 {
        return 0;
    }
    let threshold = ((completed as f64) * ptile).ceil() as u64;
    let mut seen = 0;
    for (latency, count) in latencies {
        seen += count;
        if seen >= threshold {
            return *latency;
        }
    }
    *latencies.keys().next_back().unwrap_or(&0)
}

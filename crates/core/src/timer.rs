//! Nested stage timings for a render job.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub total: Duration,
    pub count: u32,
}

/// Stack of running stages. Each stage is recorded under its full path,
/// e.g. `tile/model/run`.
#[derive(Debug, Default)]
pub struct StageTimer {
    stack: Vec<(String, Instant)>,
    stats: BTreeMap<String, StageStats>,
}

impl StageTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str) {
        let path = match self.stack.last() {
            Some((parent, _)) => format!("{parent}/{name}"),
            None => name.to_string(),
        };
        self.stack.push((path, Instant::now()));
    }

    pub fn pop(&mut self) {
        let Some((path, started)) = self.stack.pop() else {
            return;
        };
        let entry = self.stats.entry(path).or_default();
        entry.total += started.elapsed();
        entry.count += 1;
    }

    /// Close the current stage and open a sibling.
    pub fn transition(&mut self, name: &str) {
        self.pop();
        self.push(name);
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Close all open stages and return the stats.
    pub fn finish(&mut self) -> BTreeMap<String, StageStats> {
        while !self.stack.is_empty() {
            self.pop();
        }
        std::mem::take(&mut self.stats)
    }

    pub fn log_summary(&mut self) {
        for (path, stats) in self.finish() {
            tracing::debug!(
                stage = %path,
                total_ms = stats.total.as_secs_f64() * 1000.0,
                count = stats.count,
                "Stage timing"
            );
        }
    }
}

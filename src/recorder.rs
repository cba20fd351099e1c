//! Recorder backends consuming nullness observations.
//!
//! Both backends satisfy the same contract: `log` records one event and is
//! safe under unsynchronized concurrent invocation; `finish` runs once at
//! shutdown and durably flushes the sink. Selection between them is a
//! deployment choice, never visible to the instrumentation side.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};

use crate::record::{AggregateKey, Observation};

/// Output sink shared by both backends. Sinks over stdout are flushed and
/// left open; files close when the process exits.
pub(crate) type Sink = Box<dyn Write + Send>;

/// Backend contract for observation consumers.
pub(crate) trait Recorder: Send + Sync {
    fn log(&self, observation: &Observation) -> Result<()>;
    fn finish(&self) -> Result<()>;
}

/// Streams one CSV row per observation: `class,method,num_params,params,result`.
///
/// The lock is held per line, so concurrent invocations interleave at line
/// granularity. O(1) memory.
pub(crate) struct StreamingRecorder {
    sink: Mutex<Sink>,
}

impl StreamingRecorder {
    pub(crate) fn new(sink: Sink) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

impl Recorder for StreamingRecorder {
    fn log(&self, observation: &Observation) -> Result<()> {
        let mut sink = lock(&self.sink)?;
        writeln!(
            sink,
            "{},{},{},{},{}",
            observation.class_id,
            observation.method_id,
            observation.params.len(),
            observation.params.encode(),
            observation.outcome.code()
        )
        .context("write streaming row")
    }

    fn finish(&self) -> Result<()> {
        lock(&self.sink)?.flush().context("flush streaming sink")
    }
}

/// Aggregates observations into a frequency table keyed by the full signature,
/// drained once at shutdown.
///
/// Memory is proportional to the number of distinct signature and outcome
/// combinations observed, not to the number of calls.
pub(crate) struct AggregateRecorder {
    sink: Mutex<Sink>,
    table: Mutex<BTreeMap<AggregateKey, u64>>,
}

impl AggregateRecorder {
    pub(crate) fn new(sink: Sink) -> Self {
        Self {
            sink: Mutex::new(sink),
            table: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Recorder for AggregateRecorder {
    fn log(&self, observation: &Observation) -> Result<()> {
        let mut table = lock(&self.table)?;
        *table.entry(observation.key()).or_insert(0) += 1;
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        let table = std::mem::take(&mut *lock(&self.table)?);
        let mut totals: BTreeMap<(&str, &str), u64> = BTreeMap::new();
        for (key, count) in &table {
            *totals
                .entry((key.class_id.as_str(), key.method_id.as_str()))
                .or_insert(0) += count;
        }

        let mut sink = lock(&self.sink)?;
        writeln!(sink, "class,method,fields,params,result,count,ratio")
            .context("write aggregate header")?;
        for (key, count) in &table {
            let total = totals[&(key.class_id.as_str(), key.method_id.as_str())];
            writeln!(
                sink,
                "{},{},{},{},{},{},{:.2}",
                key.class_id,
                key.method_id,
                key.fields.encode(),
                key.params.encode(),
                key.outcome.code(),
                count,
                *count as f64 / total as f64
            )
            .context("write aggregate row")?;
        }
        sink.flush().context("flush aggregate sink")
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("recorder lock poisoned"))
}

/// Process-wide recorder slot with one-time installation and a one-shot
/// shutdown hook.
pub(crate) struct GlobalRecorder {
    slot: OnceLock<Box<dyn Recorder>>,
    finished: AtomicBool,
}

impl GlobalRecorder {
    pub(crate) const fn new() -> Self {
        Self {
            slot: OnceLock::new(),
            finished: AtomicBool::new(false),
        }
    }

    /// Establish the recorder. Installing twice is an error.
    pub(crate) fn install(&self, recorder: Box<dyn Recorder>) -> Result<()> {
        self.slot
            .set(recorder)
            .map_err(|_| anyhow!("recorder was initialized twice"))
    }

    pub(crate) fn get(&self) -> Option<&dyn Recorder> {
        self.slot.get().map(|recorder| recorder.as_ref())
    }

    /// Run `finish` exactly once; later calls are no-ops.
    pub(crate) fn shutdown(&self) -> Result<()> {
        let Some(recorder) = self.slot.get() else {
            return Ok(());
        };
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        recorder.finish()
    }
}

/// The process-wide recorder used by the collector.
pub(crate) static RECORDER: GlobalRecorder = GlobalRecorder::new();

/// Feed a raw probe event stream into a recorder, one observation per line.
pub(crate) fn collect_events<R: BufRead>(input: R, recorder: &dyn Recorder) -> Result<u64> {
    let mut count = 0u64;
    for (number, line) in input.lines().enumerate() {
        let line = line.with_context(|| format!("read event line {}", number + 1))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let observation = Observation::parse_line(line)
            .with_context(|| format!("event line {}", number + 1))?;
        recorder.log(&observation)?;
        count += 1;
    }
    Ok(count)
}

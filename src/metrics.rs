//! Built-in metrics backend
//!
//! Aggregates per-region timing by label hash, measures the whole run with a
//! [`MainBundle`], and writes everything to `metrics.json` at finalize.
//!
//! Which quantities are measured is a process-global selection made once by
//! [`MetricsBackend::global_init`]:
//!
//! - `wall_clock`: elapsed time per region (default)
//! - `cpu_clock`: thread CPU time per region plus process CPU time
//! - `peak_rss`: peak resident set size of the process
//!
//! An empty selection disables the backend.

use crate::error::{Result, RuntimeError};
use crate::hash_table::HashTable;
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::time::TimeVal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

/// One measured quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricComponent {
    WallClock,
    CpuClock,
    PeakRss,
}

impl FromStr for MetricComponent {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wall_clock" | "wall" => Ok(MetricComponent::WallClock),
            "cpu_clock" | "cpu" => Ok(MetricComponent::CpuClock),
            "peak_rss" | "rss" => Ok(MetricComponent::PeakRss),
            other => Err(RuntimeError::Config(format!(
                "unknown metrics component '{other}'"
            ))),
        }
    }
}

fn timeval_ns(tv: TimeVal) -> u64 {
    let secs = u64::try_from(tv.tv_sec()).unwrap_or(0);
    let micros = u64::try_from(tv.tv_usec()).unwrap_or(0);
    secs * 1_000_000_000 + micros * 1_000
}

/// CPU time consumed by the calling thread, in nanoseconds
pub fn thread_cpu_ns() -> u64 {
    getrusage(UsageWho::RUSAGE_THREAD)
        .map(|u| timeval_ns(u.user_time()) + timeval_ns(u.system_time()))
        .unwrap_or(0)
}

/// Process-wide resource usage at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub user_cpu_ns: u64,
    pub system_cpu_ns: u64,
    /// Peak resident set size in KiB
    pub peak_rss_kb: u64,
}

impl ResourceSnapshot {
    pub fn capture() -> Result<Self> {
        let usage = getrusage(UsageWho::RUSAGE_SELF)?;
        Ok(Self {
            user_cpu_ns: timeval_ns(usage.user_time()),
            system_cpu_ns: timeval_ns(usage.system_time()),
            peak_rss_kb: u64::try_from(usage.max_rss()).unwrap_or(0),
        })
    }

    pub fn cpu_ns(&self) -> u64 {
        self.user_cpu_ns + self.system_cpu_ns
    }
}

/// Aggregated timing of one region label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionStats {
    pub count: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub cpu_ns: u64,
}

impl Default for RegionStats {
    fn default() -> Self {
        Self {
            count: 0,
            total_ns: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            cpu_ns: 0,
        }
    }
}

impl RegionStats {
    pub fn record(&mut self, wall_ns: u64, cpu_ns: u64) {
        self.count += 1;
        self.total_ns += wall_ns;
        self.min_ns = self.min_ns.min(wall_ns);
        self.max_ns = self.max_ns.max(wall_ns);
        self.cpu_ns += cpu_ns;
    }

    pub fn merge(&mut self, other: &RegionStats) {
        if other.count == 0 {
            return;
        }
        self.count += other.count;
        self.total_ns += other.total_ns;
        self.min_ns = self.min_ns.min(other.min_ns);
        self.max_ns = self.max_ns.max(other.max_ns);
        self.cpu_ns += other.cpu_ns;
    }

    pub fn mean_ns(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_ns / self.count
        }
    }
}

/// Region statistics of one thread, keyed by label hash
#[derive(Debug, Clone, Default)]
pub struct ThreadMetrics {
    stats: HashMap<u64, RegionStats>,
}

impl ThreadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, hash: u64, wall_ns: u64, cpu_ns: u64) {
        self.stats.entry(hash).or_default().record(wall_ns, cpu_ns);
    }

    pub fn merge(&mut self, other: &ThreadMetrics) {
        for (hash, stats) in &other.stats {
            self.stats.entry(*hash).or_default().merge(stats);
        }
    }

    pub fn get(&self, hash: u64) -> Option<&RegionStats> {
        self.stats.get(&hash)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn reset(&mut self) {
        self.stats.clear();
    }
}

/// Whole-run measurement
#[derive(Debug, Default)]
pub struct MainBundle {
    started: Option<(Instant, ResourceSnapshot)>,
    summary: Option<RunSummary>,
}

/// What the main bundle measured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub wall_ns: u64,
    pub user_cpu_ns: u64,
    pub system_cpu_ns: u64,
    pub peak_rss_kb: u64,
}

impl MainBundle {
    pub fn start(&mut self) {
        if self.started.is_none() {
            let snapshot = ResourceSnapshot::capture().unwrap_or_default();
            self.started = Some((Instant::now(), snapshot));
            self.summary = None;
        }
    }

    /// Stop the measurement; a bundle that never started yields nothing
    pub fn stop(&mut self) -> Option<RunSummary> {
        let (began, before) = self.started.take()?;
        let after = ResourceSnapshot::capture().unwrap_or_default();
        let summary = RunSummary {
            wall_ns: began.elapsed().as_nanos() as u64,
            user_cpu_ns: after.user_cpu_ns.saturating_sub(before.user_cpu_ns),
            system_cpu_ns: after.system_cpu_ns.saturating_sub(before.system_cpu_ns),
            peak_rss_kb: after.peak_rss_kb,
        };
        self.summary = Some(summary);
        Some(summary)
    }

    pub fn reset(&mut self) {
        self.started = None;
        self.summary = None;
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn summary(&self) -> Option<RunSummary> {
        self.summary
    }
}

/// Output artifact recorded in the metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutput {
    pub kind: String,
    pub path: PathBuf,
}

/// Region line of the metrics document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSummary {
    pub name: String,
    pub hash: u64,
    #[serde(flatten)]
    pub stats: RegionStats,
}

/// Contents of `metrics.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsDocument {
    pub pid: u32,
    pub components: Vec<MetricComponent>,
    pub run: Option<RunSummary>,
    pub regions: Vec<RegionSummary>,
    pub samples: BTreeMap<String, u64>,
    pub outputs: Vec<FileOutput>,
    pub libraries: Vec<String>,
}

/// Process-wide metrics backend
#[derive(Debug, Default)]
pub struct MetricsBackend {
    components: BTreeSet<MetricComponent>,
    initialized: bool,
    main: MainBundle,
    samples: BTreeMap<String, u64>,
    outputs: Vec<FileOutput>,
    libraries: Vec<String>,
}

impl MetricsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the measured components once for the whole process
    pub fn global_init<S: AsRef<str>>(&mut self, components: &[S]) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.components = components
            .iter()
            .map(|c| c.as_ref().parse())
            .collect::<Result<_>>()?;
        self.initialized = true;
        tracing::debug!("Metrics components: {:?}", self.components);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.initialized && !self.components.is_empty()
    }

    pub fn measures(&self, component: MetricComponent) -> bool {
        self.is_enabled() && self.components.contains(&component)
    }

    pub fn main_bundle(&mut self) -> &mut MainBundle {
        &mut self.main
    }

    /// Add per-function sample counts from the samplers
    pub fn record_samples<I>(&mut self, counts: I)
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        for (name, count) in counts {
            *self.samples.entry(name).or_insert(0) += count;
        }
    }

    pub fn add_file_output(&mut self, kind: &str, path: &Path) {
        self.outputs.push(FileOutput {
            kind: kind.to_string(),
            path: path.to_path_buf(),
        });
    }

    pub fn outputs(&self) -> &[FileOutput] {
        &self.outputs
    }

    /// Record the distinct libraries mapped into the process
    pub fn add_metadata(&mut self) -> Result<usize> {
        let maps = std::fs::read_to_string("/proc/self/maps")?;
        self.libraries = mapped_libraries(&maps);
        Ok(self.libraries.len())
    }

    /// Assemble the metrics document from merged per-thread data
    pub fn document(&self, stats: &ThreadMetrics, names: &HashTable) -> MetricsDocument {
        let mut regions: Vec<RegionSummary> = stats
            .stats
            .iter()
            .map(|(hash, stats)| RegionSummary {
                name: names
                    .get(*hash)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{hash:#x}")),
                hash: *hash,
                stats: *stats,
            })
            .collect();
        regions.sort_by(|a, b| {
            b.stats
                .total_ns
                .cmp(&a.stats.total_ns)
                .then_with(|| a.name.cmp(&b.name))
        });

        MetricsDocument {
            pid: std::process::id(),
            components: self.components.iter().copied().collect(),
            run: self.main.summary(),
            regions,
            samples: self.samples.clone(),
            outputs: self.outputs.clone(),
            libraries: self.libraries.clone(),
        }
    }

    /// Write `metrics.json` and print the summary
    ///
    /// Returns the written path, or `None` when the backend is disabled.
    pub fn finalize(
        &mut self,
        path: &Path,
        stats: &ThreadMetrics,
        names: &HashTable,
        verbose: i32,
    ) -> Result<Option<PathBuf>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let document = self.document(stats, names);
        if verbose >= 0 {
            print_summary(&document);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&document)?)?;
        tracing::info!("Outputting '{}'...", path.display());
        self.outputs.push(FileOutput {
            kind: "metrics".to_string(),
            path: path.to_path_buf(),
        });
        Ok(Some(path.to_path_buf()))
    }
}

/// Distinct file-backed paths of a `/proc/<pid>/maps` listing
fn mapped_libraries(maps: &str) -> Vec<String> {
    let paths: BTreeSet<&str> = maps
        .lines()
        .filter_map(|line| line.split_whitespace().nth(5))
        .filter(|path| path.starts_with('/'))
        .collect();
    paths.into_iter().map(str::to_string).collect()
}

/// Print the end-of-run summary to stderr
pub fn print_summary(document: &MetricsDocument) {
    eprintln!("\n╔════════════════════════════════════════════════════════════════════════════════╗");
    eprintln!("║  Region Timing Summary (sorted by total time)                                  ║");
    eprintln!("╚════════════════════════════════════════════════════════════════════════════════╝");

    if let Some(run) = document.run {
        eprintln!(
            "  wall: {:.6}s  user: {:.6}s  sys: {:.6}s  peak rss: {} KiB",
            run.wall_ns as f64 / 1e9,
            run.user_cpu_ns as f64 / 1e9,
            run.system_cpu_ns as f64 / 1e9,
            run.peak_rss_kb
        );
    }

    if document.regions.is_empty() {
        eprintln!("\nNo region data collected.");
        return;
    }

    eprintln!();
    eprintln!(
        "{:<44} {:>10} {:>12} {:>12} {:>12}",
        "Region", "Calls", "Total Time", "Mean Time", "Max Time"
    );
    eprintln!("{}", "─".repeat(94));
    for region in &document.regions {
        eprintln!(
            "{:<44} {:>10} {:>11.6}s {:>11.6}s {:>11.6}s",
            region.name,
            region.stats.count,
            region.stats.total_ns as f64 / 1e9,
            region.stats.mean_ns() as f64 / 1e9,
            region.stats.max_ns as f64 / 1e9
        );
    }
    eprintln!("{}", "─".repeat(94));
}

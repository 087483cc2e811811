//! CLI argument parsing for critrace

use crate::trace_session::{TracePacket, TrackEvent};
use clap::{Parser, Subcommand};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "critrace")]
#[command(version)]
#[command(about = "Instrumentation runtime with cross-thread critical-path tracing", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decode a trace file and summarize its events
    Inspect {
        /// Trace file written at finalize
        file: PathBuf,
    },
    /// Print the effective configuration (environment and config file) as TOML
    Config,
    /// Run a synthetic multi-threaded workload with critical tracing enabled
    Demo {
        /// Number of worker threads
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Nesting depth of the regions in each worker
        #[arg(long, default_value = "3")]
        depth: usize,

        /// Directory for the output files
        #[arg(long = "output-dir", value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
}

/// Event counts of a decoded trace
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TraceSummary {
    pub packets: usize,
    pub pids: BTreeSet<u32>,
    pub by_category: BTreeMap<String, usize>,
    pub by_name: BTreeMap<String, usize>,
    pub slice_begins: usize,
    pub slice_ends: usize,
}

impl TraceSummary {
    pub fn from_packets(packets: &[TracePacket]) -> Self {
        let mut summary = TraceSummary {
            packets: packets.len(),
            ..Default::default()
        };
        for packet in packets {
            summary.pids.insert(packet.pid);
            *summary
                .by_category
                .entry(packet.event.category().to_string())
                .or_insert(0) += 1;
            *summary
                .by_name
                .entry(packet.event.name().to_string())
                .or_insert(0) += 1;
            match packet.event {
                TrackEvent::SliceBegin { .. } => summary.slice_begins += 1,
                TrackEvent::SliceEnd { .. } => summary.slice_ends += 1,
                _ => {}
            }
        }
        summary
    }

    /// Slices begun but never ended
    pub fn unbalanced(&self) -> usize {
        self.slice_begins.saturating_sub(self.slice_ends)
    }

    pub fn print(&self) {
        println!("Packets: {} (processes: {})", self.packets, self.pids.len());
        println!();
        println!("{:<24} {:>10}", "Category", "Events");
        println!("─────────────────────────────────────────");
        for (category, count) in &self.by_category {
            println!("{category:<24} {count:>10}");
        }
        println!();
        println!("{:<48} {:>10}", "Name", "Events");
        println!("─────────────────────────────────────────────────────────────");
        for (name, count) in &self.by_name {
            println!("{name:<48} {count:>10}");
        }
        println!();
        println!(
            "Slices: {} begin / {} end ({} unbalanced)",
            self.slice_begins,
            self.slice_ends,
            self.unbalanced()
        );
    }
}

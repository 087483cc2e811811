use anyhow::{anyhow, Context, Result};
use clap::Parser;
use critrace::cli::{Cli, Command, TraceSummary};
use critrace::{logging, trace_session, Runtime, RuntimeConfig, RuntimeHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn inspect(file: &Path) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("failed to read '{}'", file.display()))?;
    let packets = trace_session::decode_trace(&bytes)
        .with_context(|| format!("'{}' is not a critrace trace", file.display()))?;
    println!("Trace: {} ({} bytes)", file.display(), bytes.len());
    TraceSummary::from_packets(&packets).print();
    Ok(())
}

/// Nested regions with a little work at each level
fn work(runtime: &Runtime, worker: usize, level: usize, depth: usize) -> critrace::Result<()> {
    if level == depth {
        return Ok(());
    }
    let name = format!("worker-{worker}/level-{level}");
    runtime.push_region(&name)?;
    std::thread::sleep(Duration::from_millis(((worker + 1) * (level + 1)) as u64));
    work(runtime, worker, level + 1, depth)?;
    runtime.pop_region(&name)
}

fn demo(threads: usize, depth: usize, output_dir: Option<PathBuf>, debug: bool) -> Result<()> {
    let mut config = RuntimeConfig::from_env()?;
    config.use_critical_trace = true;
    config.debug |= debug;
    if let Some(dir) = output_dir {
        config.output_dir = dir;
    }
    logging::init_logging(config.verbose, config.debug);

    let handle = RuntimeHandle::new(Runtime::new(config)?);
    let runtime = Arc::clone(handle.runtime());
    runtime.init("trace", false, "critrace-demo")?;
    runtime.push_trace("main")?;

    let mut workers = Vec::with_capacity(threads);
    for worker in 0..threads {
        let rt = Arc::clone(&runtime);
        workers.push(runtime.spawn(move || work(&rt, worker, 0, depth))?);
    }
    for handle in workers {
        handle
            .join()
            .map_err(|_| anyhow!("demo worker panicked"))??;
    }

    runtime.pop_trace("main")?;
    let report = handle.finalize()?;

    if let Some(critical) = &report.critical_trace {
        println!("Critical path: {}", critical.path_names.join(" -> "));
        println!("Total cost: {:.3}ms", critical.total_cost as f64 / 1e6);
    }
    if let Some(path) = &report.trace_file {
        println!("Trace written to {} ({} bytes)", path.display(), report.trace_bytes);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { file } => {
            logging::init_logging(0, cli.debug);
            inspect(&file)
        }
        Command::Config => {
            logging::init_logging(0, cli.debug);
            let config = RuntimeConfig::from_env()?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Demo {
            threads,
            depth,
            output_dir,
        } => demo(threads, depth, output_dir, cli.debug),
    }
}

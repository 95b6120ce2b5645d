mod cache;
mod config;
mod outcome;
mod runner;
mod signals;
mod submit;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use cache::{RunCache, RunReport};
use config::Config;
use outcome::{pretty_duration, RunOutcome, RunStatus};
use runner::{CancelHandle, RunOptions};
use submit::{JobProgress, ProgressCallback};

#[derive(Parser)]
#[command(name = "hubrun")]
#[command(about = "Run commands with streamed output, cancellation, and cached results")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a shell command, streaming its output
    Run {
        /// Command to execute (wrap commands with pipes in quotes)
        #[arg(required = true)]
        command: String,
        /// Cache the result under this run name; a later run with the same
        /// name replays the stored output without executing
        #[arg(long, short = 'n')]
        name: Option<String>,
        /// Cache directory (overrides CACHEDIR and the config file)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Print output only after the run completes
        #[arg(long, short)]
        quiet: bool,
        /// File piped to the command's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,
        /// Execute directly instead of through `sh -c`
        #[arg(long)]
        argv: bool,
    },
    /// Run the hub's submit command with cached results
    Submit {
        /// Run name for the results (also the cache key)
        #[arg(long, short = 'n')]
        name: String,
        /// Cache directory (overrides the config file)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Suppress progress lines and print output only after the run completes
        #[arg(long, short)]
        quiet: bool,
        /// Arguments passed to submit (without runName/progress flags)
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Inspect or clean cached results
    Cache {
        #[command(subcommand)]
        mode: CacheMode,
    },
}

#[derive(Subcommand)]
enum CacheMode {
    /// List cached runs
    List {
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Use the submit cache instead of the run cache
        #[arg(long)]
        submit: bool,
    },
    /// Remove one cached run
    Clear {
        /// Run name to remove
        key: String,
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        #[arg(long)]
        submit: bool,
    },
    /// Remove every cached run
    ClearAll {
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        #[arg(long)]
        submit: bool,
    },
}

type CancelSlot = Arc<Mutex<Option<CancelHandle>>>;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::new()?;

    let code = match cli.command {
        Commands::Run {
            command,
            name,
            cache_dir,
            quiet,
            stdin,
            argv,
        } => cmd_run(&config, &command, name, cache_dir, quiet, stdin, argv)?,
        Commands::Submit {
            name,
            cache_dir,
            quiet,
            args,
        } => cmd_submit(&config, &name, &args, cache_dir, quiet)?,
        Commands::Cache { mode } => cmd_cache(&config, mode)?,
    };
    std::process::exit(code)
}

/// Route Ctrl-C to whichever run is in flight. With nothing running we
/// behave like an unhandled interrupt.
fn install_cancel_handler() -> Result<CancelSlot> {
    let slot: CancelSlot = Arc::new(Mutex::new(None));
    let handler_slot = slot.clone();
    ctrlc::set_handler(move || {
        let guard = handler_slot.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(handle) => handle.cancel(),
            None => std::process::exit(130),
        }
    })?;
    Ok(slot)
}

fn register(slot: &CancelSlot, handle: CancelHandle) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
}

fn execute_with_cancel(command: &str, options: &RunOptions, slot: &CancelSlot) -> Result<RunOutcome> {
    match runner::spawn(command, options) {
        Ok(running) => {
            register(slot, running.cancel_handle());
            running.wait()
        }
        Err(err) => Ok(runner::spawn_failure(err, options)),
    }
}

fn cmd_run(
    config: &Config,
    command: &str,
    name: Option<String>,
    cache_dir: Option<PathBuf>,
    quiet: bool,
    stdin: Option<PathBuf>,
    argv: bool,
) -> Result<i32> {
    let slot = install_cancel_handler()?;
    let options = RunOptions {
        stream: !quiet,
        stdin,
        argv_mode: argv,
        ..Default::default()
    };

    let report = match name {
        Some(key) => {
            let cache = RunCache::new(config.cache_root(cache_dir.as_deref()))?;
            cache.run_cached(&key, command, &options, |handle| register(&slot, handle))?
        }
        None => RunReport::uncached(execute_with_cancel(command, &options, &slot)?),
    };
    finish_report(&report, quiet);
    Ok(if report.cached { 0 } else { report.outcome.status.exit_code() })
}

fn cmd_submit(
    config: &Config,
    name: &str,
    args: &[String],
    cache_dir: Option<PathBuf>,
    quiet: bool,
) -> Result<i32> {
    let slot = install_cancel_handler()?;
    let cache = RunCache::new(config.submit_cache_root(cache_dir.as_deref()))?;
    let options = RunOptions {
        stream: !quiet,
        ..Default::default()
    };
    let progress_cb: Option<ProgressCallback> = if quiet {
        None
    } else {
        Some(Arc::new(|p: &JobProgress| {
            eprintln!(
                "[submit] {:.1}% done: {} finished, {} failed, {} running, {} waiting of {}",
                p.percent_done,
                p.finished,
                p.failed,
                p.executing,
                p.waiting,
                p.total_jobs()
            );
        }))
    };

    let report = submit::run_submit(&cache, name, args, &options, progress_cb, |handle| {
        register(&slot, handle)
    })?;
    finish_report(&report, quiet);
    Ok(if report.cached { 0 } else { report.outcome.status.exit_code() })
}

fn finish_report(report: &RunReport, quiet: bool) {
    if report.cached {
        let stored_on = report.stored_on.as_deref().unwrap_or("unknown");
        let run_time = report.stored_run_time.as_deref().unwrap_or("unknown");
        println!(
            "{}",
            format!("Cached: ({}, run time {})", stored_on, run_time)
                .green()
                .bold()
        );
        print!("{}", report.outcome.transcript);
        return;
    }

    if quiet && !report.outcome.transcript.is_empty() {
        print!("{}", report.outcome.transcript);
    }
    let time = pretty_duration(report.outcome.elapsed());
    match &report.outcome.status {
        RunStatus::Ok => println!(
            "{}",
            format!("Last run: OK.  Run time: {}", time).green().bold()
        ),
        RunStatus::Canceled => println!(
            "{}",
            format!("Last run: Canceled.  Run time: {}", time)
                .yellow()
                .bold()
        ),
        status => println!(
            "{}",
            format!("Last run: {}.  Run time: {}", status.describe(), time)
                .red()
                .bold()
        ),
    }
    if let Some(entry) = &report.entry {
        println!("Results cached in {}", entry.display().to_string().cyan());
    }
}

fn cmd_cache(config: &Config, mode: CacheMode) -> Result<i32> {
    match mode {
        CacheMode::List { cache_dir, submit } => {
            let cache = open_cache(config, cache_dir.as_deref(), submit)?;
            let rows = cache.entries()?;
            if rows.is_empty() {
                println!("No cached runs in {}", cache.root().display());
                return Ok(0);
            }
            for row in rows {
                let command = row.command.unwrap_or_else(|| "?".to_string());
                println!(
                    "{}  {}  {}  {}",
                    row.key.green().bold(),
                    row.stored_on,
                    row.run_time.yellow(),
                    command.dimmed()
                );
            }
        }
        CacheMode::Clear {
            key,
            cache_dir,
            submit,
        } => {
            let cache = open_cache(config, cache_dir.as_deref(), submit)?;
            let _lock = cache.open_locked()?;
            if cache.clear(&key)? {
                println!("Removed cached run '{}'", key.green());
            } else {
                println!("No cached run named '{}'", key.yellow());
            }
        }
        CacheMode::ClearAll { cache_dir, submit } => {
            let cache = open_cache(config, cache_dir.as_deref(), submit)?;
            println!(
                "{}",
                format!("This removes every cached result under {}", cache.root().display())
                    .red()
                    .bold()
            );
            if !confirm_delete()? {
                println!("{}", "Aborted".yellow());
                return Ok(1);
            }
            let _lock = cache.open_locked()?;
            let removed = cache.clear_all()?;
            println!("Removed {} cached runs", removed);
        }
    }
    Ok(0)
}

fn open_cache(config: &Config, cache_dir: Option<&std::path::Path>, submit: bool) -> Result<RunCache> {
    let root = if submit {
        config.submit_cache_root(cache_dir)
    } else {
        config.cache_root(cache_dir)
    };
    RunCache::new(root)
}

fn confirm_delete() -> Result<bool> {
    print!("{}", "Type 'yes' to continue: ".yellow());
    io::stdout().flush().ok();
    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return Ok(false);
    }
    Ok(input.trim().eq_ignore_ascii_case("yes"))
}

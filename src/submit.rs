use crate::cache::{run_start_stamp, RunCache, RunReport};
use crate::runner::{self, CancelHandle, RunOptions};
use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

// Progress lines emitted by the hub's submit CLI when run with
// `--progress submit`.
static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"=SUBMIT-PROGRESS=> aborted=(\d+) finished=(\d+) failed=(\d+) executing=(\d+) waiting=(\d+) setting_up=(\d+) setup=(\d+) %done=(\d*\.\d+|\d+) timestamp=(\d*\.\d+|\d+)",
    )
    .expect("progress pattern compiles")
});

pub type ProgressCallback = Arc<dyn Fn(&JobProgress) + Send + Sync>;

/// One parsed `=SUBMIT-PROGRESS=>` update.
#[derive(Debug, Clone, PartialEq)]
pub struct JobProgress {
    pub aborted: u64,
    pub finished: u64,
    pub failed: u64,
    pub executing: u64,
    pub waiting: u64,
    pub setting_up: u64,
    pub setup: u64,
    pub percent_done: f64,
    pub timestamp: f64,
}

impl JobProgress {
    /// Jobs in any non-aborted state, the denominator for progress display.
    pub fn total_jobs(&self) -> u64 {
        self.finished + self.failed + self.executing + self.waiting + self.setting_up + self.setup
    }
}

/// Extract a progress update from an output chunk, if one is present.
pub fn parse_progress(chunk: &str) -> Option<JobProgress> {
    let caps = PROGRESS_RE.captures(chunk)?;
    let num = |i: usize| caps[i].parse::<u64>().ok();
    let float = |i: usize| caps[i].parse::<f64>().ok();
    Some(JobProgress {
        aborted: num(1)?,
        finished: num(2)?,
        failed: num(3)?,
        executing: num(4)?,
        waiting: num(5)?,
        setting_up: num(6)?,
        setup: num(7)?,
        percent_done: float(8)?,
        timestamp: float(9)?,
    })
}

/// The caller passes the arguments *after* `submit`; the wrapper owns the
/// run name and progress flags itself.
pub fn validate_args(args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("no submit arguments given");
    }
    if args[0] == "submit" {
        bail!("pass only the arguments after 'submit'");
    }
    for arg in args {
        if arg.contains("--runName") {
            bail!("'--runName' is added automatically; remove it from the arguments");
        }
        if arg.contains("--progress") {
            bail!("'--progress' is added automatically; remove it from the arguments");
        }
    }
    Ok(())
}

pub fn build_command(runname: &str, args: &[String]) -> String {
    // the command runs through `sh -c`; arguments with whitespace or shell
    // metacharacters must survive the round trip as single words
    format!(
        "submit --runName={} --progress submit {}",
        runname,
        shell_words::join(args)
    )
}

/// Gather stdout written by batch jobs after the run finished.
///
/// A parametric sweep leaves a `<runname>/` directory with one numeric
/// subdirectory per job; a single job leaves `<runname>.stdout`. Both are
/// ignored unless touched at or after `start`.
pub fn collect_job_output(workdir: &Path, runname: &str, start: SystemTime) -> Result<String> {
    let dir = workdir.join(runname);
    if dir.is_dir() && modified_since(&dir, start) {
        let mut jobs: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Ok(job) = name.parse::<u64>() {
                if entry.path().is_dir() {
                    jobs.push((job, entry.path()));
                }
            }
        }
        jobs.sort_by_key(|(job, _)| *job);

        let mut collected = String::new();
        for (job, job_dir) in jobs {
            let mut stdout_files: Vec<PathBuf> = fs::read_dir(&job_dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("stdout"))
                .collect();
            stdout_files.sort();
            for file in stdout_files {
                collected.push_str(&format!(
                    "\n{}\nJOB {} OUTPUT\n{}\n",
                    "=".repeat(40),
                    job,
                    "=".repeat(40)
                ));
                collected.push_str(
                    &fs::read_to_string(&file)
                        .with_context(|| format!("cannot read '{}'", file.display()))?,
                );
            }
        }
        return Ok(collected);
    }

    let single = workdir.join(format!("{}.stdout", runname));
    if single.is_file() && modified_since(&single, start) {
        let mut collected = String::from("\n");
        collected.push_str(
            &fs::read_to_string(&single)
                .with_context(|| format!("cannot read '{}'", single.display()))?,
        );
        return Ok(collected);
    }
    Ok(String::new())
}

fn modified_since(path: &Path, start: SystemTime) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|mtime| mtime >= start)
        .unwrap_or(false)
}

/// Run the submit CLI with cached results.
///
/// Same locking and store discipline as `RunCache::run_cached`, plus:
/// progress lines on stdout are parsed and fed to `progress_cb`, batch job
/// stdout is folded into the transcript after the run, and a parametric
/// result directory is moved wholesale into the cache entry.
pub fn run_submit(
    cache: &RunCache,
    runname: &str,
    args: &[String],
    options: &RunOptions,
    progress_cb: Option<ProgressCallback>,
    on_spawn: impl FnOnce(CancelHandle),
) -> Result<RunReport> {
    validate_args(args)?;
    let _lock = cache.open_locked()?;

    if let Some(hit) = cache.lookup(runname)? {
        return Ok(RunReport::from_hit(hit));
    }

    let workdir = match &options.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine working directory")?,
    };

    // stale results from an earlier uncached run would confuse the
    // newer-than-start collection below
    let local_results = workdir.join(runname);
    if local_results.is_dir() {
        fs::remove_dir_all(&local_results)
            .with_context(|| format!("cannot remove '{}'", local_results.display()))?;
    }

    let command = build_command(runname, args);
    let mut run_options = options.clone();
    run_options.argv_mode = false;
    let user_cb = options.on_stdout.clone();
    run_options.on_stdout = Some(Arc::new(move |chunk: &str| {
        if let Some(cb) = &progress_cb {
            if let Some(progress) = parse_progress(chunk) {
                cb(&progress);
            }
        }
        if let Some(cb) = &user_cb {
            cb(chunk);
        }
    }));

    let start = run_start_stamp(&workdir);
    let running = match runner::spawn(&command, &run_options) {
        Ok(running) => running,
        Err(err) => return Ok(RunReport::uncached(runner::spawn_failure(err, &run_options))),
    };
    on_spawn(running.cancel_handle());
    let mut outcome = running.wait()?;

    let batch = collect_job_output(&workdir, runname, start)?;
    if !batch.is_empty() {
        outcome.transcript.push_str(&batch);
    }

    let entry = if outcome.status.is_ok() {
        Some(cache.store(runname, &command, &outcome, start, &workdir, Some(&local_results))?)
    } else {
        None
    };
    let mut report = RunReport::uncached(outcome);
    report.entry = entry;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::RunStatus;
    use std::time::Duration;

    const SAMPLE: &str = "=SUBMIT-PROGRESS=> aborted=0 finished=2 failed=1 executing=3 \
waiting=4 setting_up=1 setup=5 %done=25.0 timestamp=1234.5";

    #[test]
    fn test_parse_progress() {
        let p = parse_progress(SAMPLE).unwrap();
        assert_eq!(p.aborted, 0);
        assert_eq!(p.finished, 2);
        assert_eq!(p.failed, 1);
        assert_eq!(p.executing, 3);
        assert_eq!(p.waiting, 4);
        assert_eq!(p.setting_up, 1);
        assert_eq!(p.setup, 5);
        assert!((p.percent_done - 25.0).abs() < f64::EPSILON);
        assert_eq!(p.total_jobs(), 16);
    }

    #[test]
    fn test_parse_progress_embedded_in_chunk() {
        let chunk = format!("some earlier output\n{}\n", SAMPLE);
        assert!(parse_progress(&chunk).is_some());
    }

    #[test]
    fn test_parse_progress_rejects_garbage() {
        assert!(parse_progress("job 3 done").is_none());
        assert!(parse_progress("=SUBMIT-PROGRESS=> aborted=x").is_none());
    }

    #[test]
    fn test_validate_args() {
        let ok = vec!["-w".to_string(), "60".to_string(), "toolx".to_string()];
        assert!(validate_args(&ok).is_ok());

        assert!(validate_args(&[]).is_err());
        assert!(validate_args(&["submit".to_string(), "toolx".to_string()]).is_err());
        assert!(validate_args(&["--runName=x".to_string()]).is_err());
        assert!(validate_args(&["--progress".to_string()]).is_err());
    }

    #[test]
    fn test_build_command() {
        let args = vec!["-w".to_string(), "60".to_string(), "toolx".to_string()];
        assert_eq!(
            build_command("run7", &args),
            "submit --runName=run7 --progress submit -w 60 toolx"
        );
    }

    #[test]
    fn test_build_command_keeps_whitespace_args_whole() {
        let args = vec!["-d".to_string(), "a b".to_string()];
        assert_eq!(
            build_command("r1", &args),
            "submit --runName=r1 --progress submit -d 'a b'"
        );
        let roundtrip = shell_words::split(&build_command("r1", &args)).unwrap();
        assert_eq!(roundtrip.last().map(String::as_str), Some("a b"));
    }

    #[test]
    fn test_collect_parametric_output_in_job_order() {
        let work = tempfile::tempdir().unwrap();
        let start = SystemTime::now() - Duration::from_secs(5);
        for job in ["2", "10", "1"] {
            let dir = work.path().join("sweep").join(job);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("job.stdout"), format!("out {}\n", job)).unwrap();
        }

        let collected = collect_job_output(work.path(), "sweep", start).unwrap();
        let pos = |needle: &str| collected.find(needle).unwrap();
        assert!(pos("JOB 1 OUTPUT") < pos("JOB 2 OUTPUT"));
        assert!(pos("JOB 2 OUTPUT") < pos("JOB 10 OUTPUT"));
        assert!(collected.contains("out 10"));
    }

    #[test]
    fn test_collect_single_job_output() {
        let work = tempfile::tempdir().unwrap();
        let start = SystemTime::now() - Duration::from_secs(5);
        fs::write(work.path().join("solo.stdout"), "lonely job\n").unwrap();

        let collected = collect_job_output(work.path(), "solo", start).unwrap();
        assert_eq!(collected, "\nlonely job\n");
    }

    #[test]
    fn test_collect_ignores_results_older_than_start() {
        let work = tempfile::tempdir().unwrap();
        fs::write(work.path().join("solo.stdout"), "old\n").unwrap();
        let start = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(collect_job_output(work.path(), "solo", start).unwrap(), "");
    }

    #[test]
    fn test_collect_nothing() {
        let work = tempfile::tempdir().unwrap();
        let collected =
            collect_job_output(work.path(), "ghost", SystemTime::now()).unwrap();
        assert_eq!(collected, "");
    }

    #[test]
    fn test_run_submit_without_submit_cli_fails_cleanly() {
        // no hub submit CLI in the test environment; the shell reports 127
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();
        let options = RunOptions {
            workdir: Some(work.path().to_path_buf()),
            ..Default::default()
        };
        let args = vec!["toolx".to_string()];

        let report = run_submit(&cache, "r1", &args, &options, None, |_| {}).unwrap();
        assert!(!report.cached);
        assert!(matches!(report.outcome.status, RunStatus::Failed(_)));
        assert!(report.entry.is_none());
        assert!(cache.lookup("r1").unwrap().is_none());
    }
}

use crate::outcome::{pretty_duration, RunMeta, RunOutcome, RunStatus};
use crate::runner::{self, CancelHandle, RunOptions};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const OUTPUT_FILE: &str = ".output";
const STAMP_FILE: &str = ".submit_time";
const META_FILE: &str = ".meta.json";
const LOCK_FILE: &str = ".lock";

/// On-disk cache of successful runs, one directory per run name.
///
/// Layout: `<root>/<key>/{.output, .submit_time, .meta.json, <result files>}`.
/// An entry without its `.submit_time` stamp is treated as absent.
pub struct RunCache {
    root: PathBuf,
}

/// A replayed entry.
pub struct CachedRun {
    pub output: String,
    pub run_time: String,
    pub stored_on: String,
    pub path: PathBuf,
    pub meta: Option<RunMeta>,
}

/// Listing row for `cache list`.
pub struct CacheEntryInfo {
    pub key: String,
    pub run_time: String,
    pub stored_on: String,
    pub command: Option<String>,
}

/// Result of a cache-aware run.
pub struct RunReport {
    pub cached: bool,
    pub outcome: RunOutcome,
    pub entry: Option<PathBuf>,
    /// Pretty run time recorded at store time, present on cache hits.
    pub stored_run_time: Option<String>,
    pub stored_on: Option<String>,
}

impl RunReport {
    pub fn uncached(outcome: RunOutcome) -> Self {
        RunReport {
            cached: false,
            outcome,
            entry: None,
            stored_run_time: None,
            stored_on: None,
        }
    }

    pub fn from_hit(hit: CachedRun) -> Self {
        let outcome = RunOutcome {
            status: hit
                .meta
                .as_ref()
                .map(|m| m.status.clone())
                .unwrap_or(RunStatus::Ok),
            stdout: String::new(),
            stderr: String::new(),
            transcript: hit.output,
            elapsed_ms: hit.meta.as_ref().map(|m| m.elapsed_ms).unwrap_or(0),
        };
        RunReport {
            cached: true,
            outcome,
            entry: Some(hit.path),
            stored_run_time: Some(hit.run_time),
            stored_on: Some(hit.stored_on),
        }
    }
}

/// Advisory exclusive lock on the cache root. Held across the whole
/// lookup, execute, and commit window so concurrent submitters with the
/// same key cannot race each other.
pub struct CacheLock {
    file: File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl RunCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("cannot create cache directory '{}'", root.display()))?;
        Ok(RunCache { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Block until we hold the cache lock.
    pub fn open_locked(&self) -> Result<CacheLock> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("cannot open lock file '{}'", path.display()))?;
        file.lock_exclusive().context("cannot lock cache")?;
        Ok(CacheLock { file })
    }

    fn entry_dir(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.starts_with('.') {
            bail!("invalid run name '{}'", key);
        }
        Ok(self.root.join(key))
    }

    /// Look up a stored run. A missing or stampless directory is a miss,
    /// never an error; a missing `.output` replays as empty.
    pub fn lookup(&self, key: &str) -> Result<Option<CachedRun>> {
        let dir = self.entry_dir(key)?;
        let stamp = dir.join(STAMP_FILE);
        if !stamp.exists() {
            return Ok(None);
        }
        let run_time = fs::read_to_string(&stamp).unwrap_or_else(|_| "unknown".to_string());
        let output = fs::read_to_string(dir.join(OUTPUT_FILE)).unwrap_or_default();
        let stored_on = match fs::metadata(&stamp).and_then(|m| m.modified()) {
            Ok(mtime) => DateTime::<Utc>::from(mtime).format("%d %b %Y").to_string(),
            Err(_) => "unknown".to_string(),
        };
        let meta = File::open(dir.join(META_FILE))
            .ok()
            .and_then(|f| serde_json::from_reader::<_, RunMeta>(f).ok());
        Ok(Some(CachedRun {
            output,
            run_time: run_time.trim().to_string(),
            stored_on,
            path: dir,
            meta,
        }))
    }

    /// Persist a finished run under `key`.
    ///
    /// The entry is assembled in a staging directory and committed with a
    /// single rename, so readers only ever see a fully populated entry.
    /// Result files come from `result_dir` (a batch output directory, moved
    /// wholesale) when it exists, otherwise every file in `workdir`
    /// modified at or after `start` is copied in.
    pub fn store(
        &self,
        key: &str,
        command: &str,
        outcome: &RunOutcome,
        start: SystemTime,
        workdir: &Path,
        result_dir: Option<&Path>,
    ) -> Result<PathBuf> {
        let dir = self.entry_dir(key)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging")
            .tempdir_in(&self.root)
            .context("cannot create cache staging directory")?;

        fs::write(staging.path().join(OUTPUT_FILE), &outcome.transcript)
            .context("cannot save output")?;
        fs::write(
            staging.path().join(STAMP_FILE),
            pretty_duration(outcome.elapsed()),
        )
        .context("cannot save run time")?;
        let meta = RunMeta::new(command, outcome);
        serde_json::to_writer_pretty(File::create(staging.path().join(META_FILE))?, &meta)
            .context("cannot save run metadata")?;

        match result_dir {
            Some(results) if results.is_dir() => {
                copy_dir_contents(results, staging.path())?;
                fs::remove_dir_all(results)
                    .with_context(|| format!("cannot remove '{}'", results.display()))?;
            }
            _ => copy_newer_files(workdir, staging.path(), start)?,
        }

        // overwrite a leftover entry rather than fail the commit
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("cannot replace cache entry '{}'", dir.display()))?;
        }
        let staged = staging.into_path();
        if let Err(err) = fs::rename(&staged, &dir) {
            let _ = fs::remove_dir_all(&staged);
            return Err(err)
                .with_context(|| format!("cannot commit cache entry '{}'", dir.display()));
        }
        Ok(dir)
    }

    /// Remove one entry. Returns whether it existed.
    pub fn clear(&self, key: &str) -> Result<bool> {
        let dir = self.entry_dir(key)?;
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)
            .with_context(|| format!("cannot remove cache entry '{}'", dir.display()))?;
        Ok(true)
    }

    /// Remove every entry, keeping the cache root and its lock file.
    pub fn clear_all(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if entry.path().is_dir() {
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// List stored entries, sorted by key. Stampless directories are
    /// skipped just like in lookup.
    pub fn entries(&self) -> Result<Vec<CacheEntryInfo>> {
        let mut rows = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            if let Some(cached) = self.lookup(&name)? {
                rows.push(CacheEntryInfo {
                    key: name,
                    run_time: cached.run_time,
                    stored_on: cached.stored_on,
                    command: cached.meta.map(|m| m.command),
                });
            }
        }
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }

    /// Run `command` unless a stored result for `key` already exists.
    ///
    /// The lock spans the lookup, the execution, and the commit. Only
    /// successful runs are stored; failures and cancellations leave no
    /// entry behind. `on_spawn` receives the cancel handle as soon as the
    /// child exists.
    pub fn run_cached(
        &self,
        key: &str,
        command: &str,
        options: &RunOptions,
        on_spawn: impl FnOnce(CancelHandle),
    ) -> Result<RunReport> {
        self.entry_dir(key)?;
        let _lock = self.open_locked()?;

        if let Some(hit) = self.lookup(key)? {
            return Ok(RunReport::from_hit(hit));
        }

        let workdir = match &options.workdir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("cannot determine working directory")?,
        };
        let start = run_start_stamp(&workdir);
        let running = match runner::spawn(command, options) {
            Ok(running) => running,
            Err(err) => return Ok(RunReport::uncached(runner::spawn_failure(err, options))),
        };
        on_spawn(running.cancel_handle());
        let outcome = running.wait()?;

        let entry = if outcome.status.is_ok() {
            Some(self.store(key, command, &outcome, start, &workdir, None)?)
        } else {
            None
        };
        let mut report = RunReport::uncached(outcome);
        report.entry = entry;
        Ok(report)
    }
}

/// Baseline mtime for a run, read back from a file stamped in `workdir`.
///
/// File mtimes come from the kernel's coarse clock, which can trail
/// `SystemTime::now()` within the same tick; a file written right after
/// `now()` can carry an earlier mtime. Stamping a file on the same
/// filesystem gives a baseline every file the run writes compares
/// at-or-after.
pub(crate) fn run_start_stamp(workdir: &Path) -> SystemTime {
    tempfile::Builder::new()
        .prefix(".run-start")
        .tempfile_in(workdir)
        .ok()
        .and_then(|stamp| stamp.as_file().metadata().ok())
        .and_then(|meta| meta.modified().ok())
        .unwrap_or_else(SystemTime::now)
}

/// Copy every plain file in `src` modified at or after `start` into `dst`.
fn copy_newer_files(src: &Path, dst: &Path, start: SystemTime) -> Result<()> {
    for entry in fs::read_dir(src)
        .with_context(|| format!("cannot read working directory '{}'", src.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified());
        if let Ok(mtime) = modified {
            if mtime >= start {
                fs::copy(&path, dst.join(entry.file_name()))
                    .with_context(|| format!("cannot copy '{}'", path.display()))?;
            }
        }
    }
    Ok(())
}

fn copy_dir_contents(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            fs::create_dir_all(&to)?;
            copy_dir_contents(&from, &to)?;
        } else {
            fs::copy(&from, &to)
                .with_context(|| format!("cannot copy '{}'", from.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn outcome_ok(transcript: &str, elapsed_ms: u64) -> RunOutcome {
        RunOutcome {
            status: RunStatus::Ok,
            stdout: transcript.to_string(),
            stderr: String::new(),
            transcript: transcript.to_string(),
            elapsed_ms,
        }
    }

    #[test]
    fn test_lookup_missing_is_none() {
        let root = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();
        assert!(cache.lookup("nothing").unwrap().is_none());
    }

    #[test]
    fn test_stampless_entry_is_a_miss() {
        let root = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();
        let dir = root.path().join("broken");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join(OUTPUT_FILE), "leftovers").unwrap();
        assert!(cache.lookup("broken").unwrap().is_none());
    }

    #[test]
    fn test_store_then_lookup() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();

        let start = SystemTime::now() - Duration::from_secs(5);
        fs::write(work.path().join("result.dat"), "42").unwrap();
        let outcome = outcome_ok("all good\n", 65_000);
        cache
            .store("myrun", "./sim --steps 10", &outcome, start, work.path(), None)
            .unwrap();

        let hit = cache.lookup("myrun").unwrap().unwrap();
        assert_eq!(hit.output, "all good\n");
        assert_eq!(hit.run_time, "1m5s");
        assert!(hit.path.join("result.dat").exists());
        let meta = hit.meta.unwrap();
        assert_eq!(meta.command, "./sim --steps 10");
        assert_eq!(meta.status, RunStatus::Ok);
    }

    #[test]
    fn test_store_skips_old_files() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();

        fs::write(work.path().join("old.dat"), "stale").unwrap();
        let start = SystemTime::now() + Duration::from_secs(60);
        let entry = cache
            .store("r1", "cmd", &outcome_ok("", 0), start, work.path(), None)
            .unwrap();
        assert!(!entry.join("old.dat").exists());
        assert!(entry.join(STAMP_FILE).exists());
    }

    #[test]
    fn test_store_moves_result_dir() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();

        let results = work.path().join("sweep1");
        fs::create_dir_all(results.join("1")).unwrap();
        fs::write(results.join("1").join("job.stdout"), "job one").unwrap();

        let start = SystemTime::now();
        let entry = cache
            .store("sweep1", "cmd", &outcome_ok("", 0), start, work.path(), Some(&results))
            .unwrap();
        assert!(entry.join("1").join("job.stdout").exists());
        assert!(!results.exists());
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let root = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();
        assert!(cache.lookup("").is_err());
        assert!(cache.lookup("a/b").is_err());
        assert!(cache.lookup(".hidden").is_err());
    }

    #[test]
    fn test_run_cached_miss_then_hit() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();
        let options = RunOptions {
            workdir: Some(work.path().to_path_buf()),
            ..Default::default()
        };
        let command = "printf hi; echo ran >> marker.txt";

        let first = cache.run_cached("trial", command, &options, |_| {}).unwrap();
        assert!(!first.cached);
        assert_eq!(first.outcome.status, RunStatus::Ok);
        assert_eq!(first.outcome.transcript, "hi");
        let entry = first.entry.unwrap();
        assert!(entry.join("marker.txt").exists());

        let second = cache.run_cached("trial", command, &options, |_| {}).unwrap();
        assert!(second.cached);
        assert_eq!(second.outcome.transcript, first.outcome.transcript);
        assert!(second.stored_run_time.is_some());

        // the process must not have run a second time
        let marker = fs::read_to_string(work.path().join("marker.txt")).unwrap();
        assert_eq!(marker.lines().count(), 1);
    }

    #[test]
    fn test_run_start_stamp_orders_before_later_writes() {
        // now() can run ahead of the coarse clock that stamps mtimes, so a
        // write right after it may look older; the stamp baseline must not
        let work = tempfile::tempdir().unwrap();
        for round in 0..20 {
            let start = run_start_stamp(work.path());
            let file = work.path().join(format!("f{}", round));
            fs::write(&file, "x").unwrap();
            let mtime = fs::metadata(&file).unwrap().modified().unwrap();
            assert!(mtime >= start, "round {}: write stamped before start", round);
        }
    }

    #[test]
    fn test_run_cached_keeps_files_from_a_fast_command() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();
        let options = RunOptions {
            workdir: Some(work.path().to_path_buf()),
            ..Default::default()
        };

        // writes its file within the first millisecond of the run
        let report = cache
            .run_cached("fast", "printf data > quick.txt", &options, |_| {})
            .unwrap();
        assert_eq!(report.outcome.status, RunStatus::Ok);
        assert!(report.entry.unwrap().join("quick.txt").exists());
    }

    #[test]
    fn test_run_cached_does_not_store_failures() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();
        let options = RunOptions {
            workdir: Some(work.path().to_path_buf()),
            ..Default::default()
        };

        let report = cache.run_cached("bad", "exit 3", &options, |_| {}).unwrap();
        assert!(!report.cached);
        assert_eq!(report.outcome.status, RunStatus::Failed(3));
        assert!(report.entry.is_none());
        assert!(cache.lookup("bad").unwrap().is_none());
    }

    #[test]
    fn test_run_cached_spawn_failure() {
        let root = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();
        let options = RunOptions {
            argv_mode: true,
            ..Default::default()
        };
        let report = cache
            .run_cached("nope", "/no/such/binary", &options, |_| {})
            .unwrap();
        assert_eq!(report.outcome.status, RunStatus::Failed(1));
        assert!(report.entry.is_none());
    }

    #[test]
    fn test_clear_and_clear_all() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();
        let start = SystemTime::now();
        cache.store("a", "cmd a", &outcome_ok("", 0), start, work.path(), None).unwrap();
        cache.store("b", "cmd b", &outcome_ok("", 0), start, work.path(), None).unwrap();

        assert!(cache.clear("a").unwrap());
        assert!(!cache.clear("a").unwrap());
        assert!(cache.lookup("a").unwrap().is_none());

        assert_eq!(cache.clear_all().unwrap(), 1);
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn test_entries_listing() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();
        let start = SystemTime::now();
        cache.store("zeta", "z", &outcome_ok("", 1000), start, work.path(), None).unwrap();
        cache.store("alpha", "a", &outcome_ok("", 2000), start, work.path(), None).unwrap();

        let rows = cache.entries().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "alpha");
        assert_eq!(rows[0].command.as_deref(), Some("a"));
        assert_eq!(rows[1].key, "zeta");
    }

    #[test]
    fn test_lock_is_reacquirable() {
        let root = tempfile::tempdir().unwrap();
        let cache = RunCache::new(root.path()).unwrap();
        let lock = cache.open_locked().unwrap();
        drop(lock);
        let _again = cache.open_locked().unwrap();
    }
}

use crate::outcome::{mark_stderr, RunOutcome, RunStatus};
use crate::signals::signal_name;
use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

const CHUNK_SIZE: usize = 4096;

pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// How a command is launched and where its output goes.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Tee output to our own stdout/stderr while capturing it.
    pub stream: bool,
    /// Redirect the child's stdin from this file. Inherited when unset.
    pub stdin: Option<PathBuf>,
    /// Split the command into argv with shell quoting rules and execute it
    /// directly instead of going through `sh -c`.
    pub argv_mode: bool,
    /// Run the child in this directory. Inherited when unset.
    pub workdir: Option<PathBuf>,
    /// Called with each decoded stdout chunk as it arrives.
    pub on_stdout: Option<OutputCallback>,
}

struct CancelState {
    pgid: libc::pid_t,
    canceled: AtomicBool,
    done: AtomicBool,
}

/// Cancellation handle for one in-flight run.
///
/// Clonable so it can be handed to a Ctrl-C handler or another thread;
/// there is deliberately no process-global "current pid" anywhere.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

impl CancelHandle {
    /// Send SIGTERM to the child's whole process group, so subprocesses
    /// spawned by the shell wrapper die with it. No-op once the run has
    /// been reaped.
    pub fn cancel(&self) {
        if self.inner.done.load(Ordering::SeqCst) {
            return;
        }
        self.inner.canceled.store(true, Ordering::SeqCst);
        unsafe {
            libc::killpg(self.inner.pgid, libc::SIGTERM);
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }
}

/// A spawned command whose output is being drained in the background.
pub struct RunningCommand {
    child: Child,
    cancel: CancelHandle,
    start: Instant,
    stdout_thread: JoinHandle<Result<Vec<u8>>>,
    stderr_thread: JoinHandle<Result<Vec<u8>>>,
    transcript: Arc<Mutex<String>>,
}

/// Spawn `command` in its own process group with piped stdout/stderr and
/// start two reader threads draining the pipes.
pub fn spawn(command: &str, options: &RunOptions) -> Result<RunningCommand> {
    let command = command.trim();
    if command.is_empty() {
        bail!("empty command");
    }

    let mut cmd = if options.argv_mode {
        let words =
            shell_words::split(command).with_context(|| format!("cannot parse '{}'", command))?;
        let (program, args) = words
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    match &options.stdin {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("cannot open stdin file '{}'", path.display()))?;
            cmd.stdin(Stdio::from(file));
        }
        None => {
            cmd.stdin(Stdio::inherit());
        }
    }
    if let Some(dir) = &options.workdir {
        cmd.current_dir(dir);
    }

    // New process group so cancellation can signal the shell and everything
    // it spawned without touching our own group.
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("cannot execute '{}'", command))?;
    let start = Instant::now();

    // process_group(0) makes the child the leader, so pgid == pid
    let pgid = child.id() as libc::pid_t;
    let cancel = CancelHandle {
        inner: Arc::new(CancelState {
            pgid,
            canceled: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }),
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("cannot capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("cannot capture stderr"))?;

    let transcript = Arc::new(Mutex::new(String::new()));
    let stdout_thread = spawn_stdout_reader(stdout, options, transcript.clone());
    let stderr_thread = spawn_stderr_reader(stderr, options.stream, transcript.clone());

    Ok(RunningCommand {
        child,
        cancel,
        start,
        stdout_thread,
        stderr_thread,
        transcript,
    })
}

fn spawn_stdout_reader(
    stdout: ChildStdout,
    options: &RunOptions,
    transcript: Arc<Mutex<String>>,
) -> JoinHandle<Result<Vec<u8>>> {
    let stream = options.stream;
    let callback = options.on_stdout.clone();
    thread::spawn(move || -> Result<Vec<u8>> {
        let mut reader = stdout;
        let mut buffer = [0u8; CHUNK_SIZE];
        let mut collected = Vec::new();
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            collected.extend_from_slice(&buffer[..bytes_read]);
            let text = String::from_utf8_lossy(&buffer[..bytes_read]).to_string();
            transcript
                .lock()
                .map_err(|_| anyhow!("transcript lock poisoned"))?
                .push_str(&text);
            if let Some(cb) = &callback {
                cb(&text);
            }
            if stream {
                let mut handle = io::stdout();
                handle.write_all(&buffer[..bytes_read])?;
                handle.flush()?;
            }
        }
        Ok(collected)
    })
}

fn spawn_stderr_reader(
    stderr: ChildStderr,
    stream: bool,
    transcript: Arc<Mutex<String>>,
) -> JoinHandle<Result<Vec<u8>>> {
    thread::spawn(move || -> Result<Vec<u8>> {
        let mut reader = stderr;
        let mut buffer = [0u8; CHUNK_SIZE];
        let mut collected = Vec::new();
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            collected.extend_from_slice(&buffer[..bytes_read]);
            let text = String::from_utf8_lossy(&buffer[..bytes_read]);
            transcript
                .lock()
                .map_err(|_| anyhow!("transcript lock poisoned"))?
                .push_str(&mark_stderr(&text));
            if stream {
                let mut handle = io::stderr();
                handle.write_all(&buffer[..bytes_read])?;
                handle.flush()?;
            }
        }
        Ok(collected)
    })
}

impl RunningCommand {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the child to exit, join the readers, and classify the result.
    pub fn wait(mut self) -> Result<RunOutcome> {
        let status = self.child.wait().context("failed waiting for command")?;
        let stdout_bytes = self
            .stdout_thread
            .join()
            .map_err(|_| anyhow!("stdout reader panicked"))??;
        let stderr_bytes = self
            .stderr_thread
            .join()
            .map_err(|_| anyhow!("stderr reader panicked"))??;
        self.cancel.inner.done.store(true, Ordering::SeqCst);

        let elapsed = self.start.elapsed();
        let transcript = self
            .transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        Ok(RunOutcome {
            status: classify(status, self.cancel.is_canceled()),
            stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
            stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
            transcript,
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }
}

fn classify(status: ExitStatus, canceled: bool) -> RunStatus {
    if let Some(sig) = status.signal() {
        if canceled {
            return RunStatus::Canceled;
        }
        return RunStatus::Signaled(signal_name(sig));
    }
    match status.code() {
        Some(0) | None => RunStatus::Ok,
        Some(code) => RunStatus::Failed(code),
    }
}

/// Spawn and wait in one step.
///
/// Failure to start at all (missing executable, bad stdin file, unparsable
/// argv) is reported as a `Failed(1)` outcome carrying the error text on
/// stderr rather than bubbling up as an error, so callers see the same three
/// outcomes a shell user would.
pub fn run(command: &str, options: &RunOptions) -> Result<RunOutcome> {
    let running = match spawn(command, options) {
        Ok(running) => running,
        Err(err) => return Ok(spawn_failure(err, options)),
    };
    running.wait()
}

/// Turn a spawn error into the `Failed(1)` outcome, echoing the error text
/// to stderr when streaming is on, just as a started child would have.
pub fn spawn_failure(err: anyhow::Error, options: &RunOptions) -> RunOutcome {
    let text = format!("{:#}\n", err);
    if options.stream {
        let mut handle = io::stderr();
        let _ = handle.write_all(text.as_bytes());
        let _ = handle.flush();
    }
    RunOutcome::spawn_failure(text)
}

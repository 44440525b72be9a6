//! Supervised subprocess execution.
//!
//! [`run_tracked`] spawns one external process, streams its stdout and stderr
//! line by line to a callback, and resolves when the process exits. Every
//! process is registered with a [`ProcessTracker`] before any output is read
//! so that a cancellation arriving at any point can tear the whole process
//! tree down.

use crate::parser::LineSplitter;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long to keep draining buffered output after the process exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Number of trailing stderr lines kept for error messages.
const STDERR_TAIL: usize = 8;

/// Error type for process execution
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {}: {detail}", exit_label(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("canceled")]
    Canceled,
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Handle to a live child process registered for cancellation.
#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub pid: u32,
    pub program: String,
    token: CancellationToken,
}

impl TrackedProcess {
    pub fn new(pid: u32, program: impl Into<String>) -> Self {
        Self {
            pid,
            program: program.into(),
            token: CancellationToken::new(),
        }
    }

    /// Forcibly terminates the process and all of its descendants.
    ///
    /// Inside a Tokio runtime the process table scan runs on the blocking
    /// pool. The runner supervising the process is woken once the tree has
    /// been signalled. Safe to call repeatedly.
    pub fn terminate(&self) {
        tracing::debug!(pid = self.pid, program = %self.program, "terminating process tree");
        let pid = self.pid;
        let token = self.token.clone();
        let kill = move || {
            kill_process_tree(pid);
            token.cancel();
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(kill);
            }
            Err(_) => kill(),
        }
    }
}

/// Registry of the live processes belonging to one job.
pub trait ProcessTracker: Send + Sync {
    /// Registers a process.
    ///
    /// Returns false when the job was canceled already; the caller must then
    /// terminate the process itself.
    fn track(&self, process: TrackedProcess) -> bool;

    fn untrack(&self, pid: u32);

    fn is_canceled(&self) -> bool;
}

/// Kills `pid` and every descendant, deepest first.
///
/// Blocks while the OS process table is scanned for descendants. On Unix
/// `pid` must lead its own process group (see [`run_tracked`]); the whole
/// group is signalled too, which reaches members already reparented away
/// from the tree. On Windows `taskkill /T /F` is used as well since it
/// follows job hierarchies the table walk can miss.
pub fn kill_process_tree(pid: u32) {
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }

    use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

    let sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );

    #[cfg(unix)]
    {
        let group = format!("-{}", pid);
        if let Err(e) = std::process::Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            tracing::debug!(pid, error = %e, "process group kill failed");
        }
    }

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (child_pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*child_pid);
        }
    }

    let root = Pid::from_u32(pid);
    let mut order = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(next) = queue.pop_front() {
        order.push(next);
        if let Some(kids) = children.get(&next) {
            queue.extend(kids.iter().copied());
        }
    }

    for target in order.iter().rev() {
        if let Some(process) = sys.process(*target) {
            if !process.kill() {
                tracing::debug!(pid = target.as_u32(), "kill signal was not delivered");
            }
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// Last stderr lines, oldest first
    pub stderr_tail: Vec<String>,
}

/// Spawns `command`, feeds every output line to `on_line`, and waits for exit.
///
/// Returns [`RunError::Canceled`] when the tracker was canceled before the
/// spawn or while the process ran, regardless of the exit status.
pub async fn run_tracked<F>(
    tracker: &dyn ProcessTracker,
    mut command: Command,
    mut on_line: F,
) -> Result<RunOutput, RunError>
where
    F: FnMut(OutputStream, &str) + Send,
{
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    if tracker.is_canceled() {
        return Err(RunError::Canceled);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| RunError::Spawn {
        program: program.clone(),
        source,
    })?;

    let tracked = child.id().map(|pid| TrackedProcess::new(pid, program.clone()));
    let token = match &tracked {
        Some(process) => {
            if !tracker.track(process.clone()) {
                process.terminate();
            }
            process.token.clone()
        }
        None => CancellationToken::new(),
    };
    tracing::debug!(program = %program, pid = ?child.id(), "process started");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump_lines(stdout, OutputStream::Stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump_lines(stderr, OutputStream::Stderr, tx.clone())));
    }
    drop(tx);

    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
    let mut deliver = |stream: OutputStream, line: String, tail: &mut VecDeque<String>| {
        if stream == OutputStream::Stderr {
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        on_line(stream, &line);
    };

    let mut lines_open = true;
    let mut kill_sent = false;
    let waited = loop {
        tokio::select! {
            _ = token.cancelled(), if !kill_sent => {
                kill_sent = true;
                if let Err(e) = child.start_kill() {
                    tracing::debug!(program = %program, error = %e, "start_kill failed");
                }
            }
            maybe = rx.recv(), if lines_open => match maybe {
                Some((stream, line)) => deliver(stream, line, &mut tail),
                None => lines_open = false,
            },
            status = child.wait() => break status,
        }
    };

    if lines_open {
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some((stream, line)) = rx.recv().await {
                deliver(stream, line, &mut tail);
            }
        })
        .await;
    }
    for reader in readers {
        reader.abort();
    }

    if let Some(process) = &tracked {
        tracker.untrack(process.pid);
    }

    let status = waited.map_err(|source| RunError::Wait {
        program: program.clone(),
        source,
    })?;

    if token.is_cancelled() || tracker.is_canceled() {
        return Err(RunError::Canceled);
    }

    let stderr_tail: Vec<String> = tail.into_iter().collect();
    if status.success() {
        tracing::debug!(program = %program, "process exited successfully");
        Ok(RunOutput { stderr_tail })
    } else {
        let detail = stderr_tail
            .iter()
            .rev()
            .find(|line| !is_progress_noise(line))
            .cloned()
            .unwrap_or_else(|| "no diagnostic output".to_string());
        Err(RunError::Failed {
            program,
            code: status.code(),
            detail,
        })
    }
}

/// Runs `command` and returns its stdout.
pub async fn run_capture(tracker: &dyn ProcessTracker, command: Command) -> Result<String, RunError> {
    let mut stdout = Vec::new();
    run_tracked(tracker, command, |stream, line| {
        if stream == OutputStream::Stdout {
            stdout.push(line.to_string());
        }
    })
    .await?;
    Ok(stdout.join("\n"))
}

/// Encoder `-progress` key/value lines are not useful as error detail.
fn is_progress_noise(line: &str) -> bool {
    line.split_once('=')
        .map(|(key, _)| !key.is_empty() && !key.contains(char::is_whitespace))
        .unwrap_or(false)
}

async fn pump_lines<R>(
    mut reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    if tx.send((stream, line)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        let _ = tx.send((stream, line));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[derive(Default)]
    struct TestTracker {
        canceled: AtomicBool,
        live: Mutex<Vec<TrackedProcess>>,
    }

    impl TestTracker {
        fn cancel(&self) {
            self.canceled.store(true, Ordering::SeqCst);
            let live: Vec<_> = self.live.lock().unwrap().drain(..).collect();
            for process in live {
                process.terminate();
            }
        }
    }

    impl ProcessTracker for TestTracker {
        fn track(&self, process: TrackedProcess) -> bool {
            let mut live = self.live.lock().unwrap();
            if self.canceled.load(Ordering::SeqCst) {
                return false;
            }
            live.push(process);
            true
        }

        fn untrack(&self, pid: u32) {
            self.live.lock().unwrap().retain(|p| p.pid != pid);
        }

        fn is_canceled(&self) -> bool {
            self.canceled.load(Ordering::SeqCst)
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn process_alive(pid: u32) -> bool {
        use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, RefreshKind, System};
        let sys = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        match sys.process(Pid::from_u32(pid)) {
            Some(p) => !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
            None => false,
        }
    }

    #[tokio::test]
    async fn test_streams_lines_from_both_pipes() {
        let tracker = TestTracker::default();
        let mut seen = Vec::new();
        let result = run_tracked(
            &tracker,
            sh("printf 'a\\nb\\r\\nc'; printf 'oops\\n' 1>&2"),
            |stream, line| seen.push((stream, line.to_string())),
        )
        .await
        .unwrap();

        let stdout: Vec<_> = seen
            .iter()
            .filter(|(s, _)| *s == OutputStream::Stdout)
            .map(|(_, l)| l.as_str())
            .collect();
        assert_eq!(stdout, vec!["a", "b", "c"]);
        assert_eq!(result.stderr_tail, vec!["oops".to_string()]);
        assert!(tracker.live.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_code_and_last_line() {
        let tracker = TestTracker::default();
        let err = run_tracked(&tracker, sh("echo first 1>&2; echo boom 1>&2; exit 3"), |_, _| {})
            .await
            .unwrap_err();
        match err {
            RunError::Failed { code, detail, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(detail, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let tracker = TestTracker::default();
        let err = run_tracked(&tracker, Command::new("/nonexistent/mediaflow-tool"), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_canceled_tracker_never_spawns() {
        let tracker = TestTracker::default();
        tracker.cancel();
        let err = run_tracked(&tracker, sh("echo never"), |_, _| panic!("no output expected"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Canceled));
    }

    #[tokio::test]
    async fn test_cancel_kills_process_tree() {
        let tracker = Arc::new(TestTracker::default());
        let grandchild = Arc::new(Mutex::new(None::<u32>));

        let canceller = {
            let tracker = tracker.clone();
            let grandchild = grandchild.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(5);
                while grandchild.lock().unwrap().is_none() && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                tracker.cancel();
            })
        };

        let started = Instant::now();
        let sink = grandchild.clone();
        let err = run_tracked(
            tracker.as_ref(),
            sh("sleep 30 & echo $!; wait"),
            move |stream, line| {
                if stream == OutputStream::Stdout {
                    if let Ok(pid) = line.trim().parse::<u32>() {
                        *sink.lock().unwrap() = Some(pid);
                    }
                }
            },
        )
        .await
        .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, RunError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = grandchild.lock().unwrap().expect("grandchild pid reported");
        let deadline = Instant::now() + Duration::from_secs(3);
        while process_alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!process_alive(pid), "grandchild {} survived cancellation", pid);
    }

    #[tokio::test]
    async fn test_cancel_reaches_reparented_group_members() {
        let tracker = Arc::new(TestTracker::default());
        let orphan = Arc::new(Mutex::new(None::<u32>));

        let canceller = {
            let tracker = tracker.clone();
            let orphan = orphan.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(5);
                while orphan.lock().unwrap().is_none() && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                tracker.cancel();
            })
        };

        // The inner shell exits at once, leaving its sleep without a parent in the tree
        let sink = orphan.clone();
        let err = run_tracked(
            tracker.as_ref(),
            sh("sh -c 'sleep 30 >/dev/null 2>&1 & echo $!'; sleep 30"),
            move |stream, line| {
                if stream == OutputStream::Stdout {
                    if let Ok(pid) = line.trim().parse::<u32>() {
                        *sink.lock().unwrap() = Some(pid);
                    }
                }
            },
        )
        .await
        .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, RunError::Canceled));

        let pid = orphan.lock().unwrap().expect("orphan pid reported");
        let deadline = Instant::now() + Duration::from_secs(3);
        while process_alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!process_alive(pid), "orphaned group member {} survived cancellation", pid);
    }

    #[tokio::test]
    async fn test_run_capture_collects_stdout() {
        let tracker = TestTracker::default();
        let out = run_capture(&tracker, sh("echo '{\"a\": 1}'; echo noise 1>&2"))
            .await
            .unwrap();
        assert_eq!(out, "{\"a\": 1}");
    }

    #[test]
    fn test_progress_noise_filter() {
        assert!(is_progress_noise("out_time_us=1000"));
        assert!(!is_progress_noise("Error opening input: No such file"));
        assert!(!is_progress_noise("boom"));
    }
}

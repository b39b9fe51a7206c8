//! Platform-native bulk copy.
//!
//! Each [`CopyStrategy`] knows how to invoke its tool, how progress can be
//! observed while it runs, and which exit codes count as success.

use crate::config::Config;
use crate::error::BackupError;
use crate::Result;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Highest mirror-tool exit code that still means every file was copied
pub const MIRROR_SUCCESS_CEILING: i32 = 8;

/// Lines of tool output kept for a failure diagnostic
pub const DIAGNOSTIC_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    /// Multi-threaded tree mirror (robocopy); progress is polled from the destination
    Mirror,
    /// Archive-mode sync (rsync); progress is parsed from its output
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSource {
    PollDestination,
    ParseOutput,
}

/// How a successful copy finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    Clean,
    /// Mirror tool reported an informational code between 1 and the ceiling
    WithWarnings(i32),
}

impl CopyStrategy {
    /// Strategy for the running platform
    pub fn detect() -> Result<Self> {
        Self::for_os(std::env::consts::OS)
    }

    pub fn for_os(os: &str) -> Result<Self> {
        match os {
            "windows" => Ok(CopyStrategy::Mirror),
            "linux" | "macos" => Ok(CopyStrategy::Sync),
            other => Err(BackupError::UnsupportedPlatform {
                os: other.to_string(),
            }),
        }
    }

    pub fn progress_source(&self) -> ProgressSource {
        match self {
            CopyStrategy::Mirror => ProgressSource::PollDestination,
            CopyStrategy::Sync => ProgressSource::ParseOutput,
        }
    }

    pub fn tool<'a>(&self, config: &'a Config) -> &'a str {
        match self {
            CopyStrategy::Mirror => &config.robocopy_path,
            CopyStrategy::Sync => &config.rsync_path,
        }
    }

    /// Command-line arguments, tool name excluded
    pub fn arguments(&self, source: &Path, destination: &Path, config: &Config) -> Vec<OsString> {
        match self {
            CopyStrategy::Mirror => vec![
                source.as_os_str().to_os_string(),
                destination.as_os_str().to_os_string(),
                "/E".into(),
                format!("/MT:{}", config.mirror_threads).into(),
                format!("/R:{}", config.mirror_retries).into(),
                format!("/W:{}", config.mirror_retry_wait).into(),
                "/NP".into(),
                "/NJS".into(),
                "/NJH".into(),
            ],
            CopyStrategy::Sync => vec![
                "-a".into(),
                "--info=progress2".into(),
                with_trailing_separator(source),
                destination.as_os_str().to_os_string(),
            ],
        }
    }

    /// `Some` when `exit_code` means the copy succeeded
    pub fn classify(&self, exit_code: i32) -> Option<CopyStatus> {
        match (self, exit_code) {
            (_, 0) => Some(CopyStatus::Clean),
            (CopyStrategy::Mirror, 1..=MIRROR_SUCCESS_CEILING) => {
                Some(CopyStatus::WithWarnings(exit_code))
            }
            _ => None,
        }
    }

    /// Start the copy tool with piped output
    pub fn spawn(&self, source: &Path, destination: &Path, config: &Config) -> Result<CopyHandle> {
        let tool = self.tool(config).to_string();
        let args = self.arguments(source, destination, config);

        let mut cmd = Command::new(&tool);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running copy command: {} {:?}", tool, args);

        let mut child = cmd.spawn().map_err(|e| BackupError::ToolLaunch {
            tool: tool.clone(),
            detail: e.to_string(),
        })?;

        info!("Started {} (pid {:?})", tool, child.id());

        let stdout = child.stdout.take();
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = OutputLines::new(BufReader::new(stderr));
                let mut tail = LineTail::new(DIAGNOSTIC_LINES);
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("copy tool stderr: {}", line);
                    tail.push(line);
                }
                tail.into_lines()
            })
        });

        Ok(CopyHandle {
            strategy: *self,
            tool,
            child,
            stdout,
            stderr_task,
            terminate_requested: false,
        })
    }
}

/// rsync copies a directory's contents only when the source ends in a separator
fn with_trailing_separator(path: &Path) -> OsString {
    let mut arg = path.as_os_str().to_os_string();
    let text = path.to_string_lossy();
    if !text.ends_with('/') && !text.ends_with(std::path::MAIN_SEPARATOR) {
        arg.push("/");
    }
    arg
}

/// A running copy tool
#[derive(Debug)]
pub struct CopyHandle {
    strategy: CopyStrategy,
    tool: String,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<Vec<String>>>,
    terminate_requested: bool,
}

impl CopyHandle {
    pub fn strategy(&self) -> CopyStrategy {
        self.strategy
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// The tool's stdout as lines; can be taken once
    pub fn take_output(&mut self) -> Option<OutputLines<BufReader<ChildStdout>>> {
        self.stdout
            .take()
            .map(|stdout| OutputLines::new(BufReader::new(stdout)))
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Ask the tool to stop. Returns false if a request was already sent.
    pub fn terminate(&mut self) -> bool {
        if self.terminate_requested {
            return false;
        }
        self.terminate_requested = true;

        match self.send_terminate() {
            Ok(()) => info!("Sent terminate request to {}", self.tool),
            // The process may already have exited
            Err(e) => debug!("Terminate request for {} failed: {}", self.tool, e),
        }
        true
    }

    #[cfg(unix)]
    fn send_terminate(&mut self) -> std::io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        // SIGTERM so rsync can still remove its temporary files
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate_requested
    }

    /// Force the tool down after it ignored a terminate request
    pub fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("Kill for {} failed: {}", self.tool, e);
        } else {
            warn!("Killed {}", self.tool);
        }
    }

    /// The last lines the tool wrote to stderr, once it has closed the stream
    pub async fn stderr_lines(&mut self) -> Vec<String> {
        match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

/// Keeps only the most recent lines of a tool's output
#[derive(Debug, Clone)]
pub struct LineTail {
    lines: VecDeque<String>,
    limit: usize,
}

impl LineTail {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.limit == 0 {
            return;
        }
        if self.lines.len() == self.limit {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Splits tool output at every `\n` or `\r`, since progress meters
/// redraw a single terminal line with carriage returns.
pub struct OutputLines<R> {
    reader: R,
    partial: Vec<u8>,
}

impl<R> OutputLines<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            partial: Vec::new(),
        }
    }

    /// Next non-empty line, `None` at end of stream
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(self.take_line());
            }

            let line_end = available.iter().position(|b| matches!(b, b'\r' | b'\n'));
            let (consumed, ended) = match line_end {
                Some(end) => {
                    self.partial.extend_from_slice(&available[..end]);
                    (end + 1, true)
                }
                None => {
                    self.partial.extend_from_slice(available);
                    (available.len(), false)
                }
            };
            self.reader.consume(consumed);

            if ended {
                if let Some(line) = self.take_line() {
                    return Ok(Some(line));
                }
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        if line.trim().is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_detect_by_os() {
        assert_eq!(CopyStrategy::for_os("windows").unwrap(), CopyStrategy::Mirror);
        assert_eq!(CopyStrategy::for_os("linux").unwrap(), CopyStrategy::Sync);
        assert_eq!(CopyStrategy::for_os("macos").unwrap(), CopyStrategy::Sync);

        match CopyStrategy::for_os("freebsd") {
            Err(BackupError::UnsupportedPlatform { os }) => assert_eq!(os, "freebsd"),
            other => panic!("Expected UnsupportedPlatform, got {other:?}"),
        }
    }

    #[test]
    fn test_progress_sources() {
        assert_eq!(
            CopyStrategy::Mirror.progress_source(),
            ProgressSource::PollDestination
        );
        assert_eq!(CopyStrategy::Sync.progress_source(), ProgressSource::ParseOutput);
    }

    #[test]
    fn test_mirror_arguments() {
        let config = Config::default();
        let args = CopyStrategy::Mirror.arguments(
            Path::new("C:/work/project"),
            Path::new("D:/backups/v3"),
            &config,
        );
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "C:/work/project",
                "D:/backups/v3",
                "/E",
                "/MT:8",
                "/R:2",
                "/W:5",
                "/NP",
                "/NJS",
                "/NJH"
            ]
        );
        assert_eq!(CopyStrategy::Mirror.tool(&config), "robocopy");
    }

    #[test]
    fn test_sync_arguments_add_trailing_slash() {
        let config = Config::default();
        let args = CopyStrategy::Sync.arguments(
            Path::new("/home/me/project"),
            Path::new("/mnt/backups/v1"),
            &config,
        );
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["-a", "--info=progress2", "/home/me/project/", "/mnt/backups/v1"]
        );
        assert_eq!(CopyStrategy::Sync.tool(&config), "rsync");
    }

    #[test]
    fn test_sync_arguments_keep_existing_slash() {
        let source = PathBuf::from("/home/me/project/");
        let arg = with_trailing_separator(&source);
        assert_eq!(arg.to_string_lossy(), "/home/me/project/");
    }

    #[test]
    fn test_classify_mirror() {
        assert_eq!(CopyStrategy::Mirror.classify(0), Some(CopyStatus::Clean));
        assert_eq!(
            CopyStrategy::Mirror.classify(1),
            Some(CopyStatus::WithWarnings(1))
        );
        assert_eq!(
            CopyStrategy::Mirror.classify(8),
            Some(CopyStatus::WithWarnings(8))
        );
        assert_eq!(CopyStrategy::Mirror.classify(9), None);
        assert_eq!(CopyStrategy::Mirror.classify(16), None);
        assert_eq!(CopyStrategy::Mirror.classify(-1), None);
    }

    #[test]
    fn test_classify_sync() {
        assert_eq!(CopyStrategy::Sync.classify(0), Some(CopyStatus::Clean));
        assert_eq!(CopyStrategy::Sync.classify(1), None);
        assert_eq!(CopyStrategy::Sync.classify(23), None);
    }

    #[tokio::test]
    async fn test_output_lines_split_on_carriage_returns() {
        let raw: &[u8] =
            b"sending incremental file list\n  10%  1.00kB/s\r  45%  120.00kB/s\r\n\n100%\n";
        let mut lines = OutputLines::new(BufReader::new(raw));

        let mut collected = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            collected.push(line);
        }

        assert_eq!(
            collected,
            vec![
                "sending incremental file list",
                "  10%  1.00kB/s",
                "  45%  120.00kB/s",
                "100%"
            ]
        );
    }

    #[tokio::test]
    async fn test_output_lines_lossy_utf8() {
        let raw: &[u8] = b"caf\xff\n";
        let mut lines = OutputLines::new(BufReader::new(raw));
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.starts_with("caf"));
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_output_lines_do_not_wait_for_stream_end() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut lines = OutputLines::new(BufReader::new(reader));

        writer.write_all(b"  10%  1.00kB/s\n").await.unwrap();
        let first = tokio::time::timeout(Duration::from_millis(500), lines.next_line())
            .await
            .expect("newline-terminated line is delivered while the stream is open")
            .unwrap();
        assert_eq!(first.as_deref(), Some("  10%  1.00kB/s"));

        writer.write_all(b"  55%  2.00kB/s\r").await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(500), lines.next_line())
            .await
            .expect("carriage-return-terminated line is delivered while the stream is open")
            .unwrap();
        assert_eq!(second.as_deref(), Some("  55%  2.00kB/s"));

        writer.write_all(b"tail without newline").await.unwrap();
        drop(writer);
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("tail without newline")
        );
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[test]
    fn test_line_tail_keeps_most_recent() {
        let mut tail = LineTail::new(3);
        for n in 1..=5 {
            tail.push(format!("line {n}"));
        }
        assert_eq!(tail.into_lines(), vec!["line 3", "line 4", "line 5"]);

        let mut empty = LineTail::new(0);
        empty.push("dropped".to_string());
        assert!(empty.into_lines().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_missing_tool() {
        let mut config = Config::default();
        config.rsync_path = "/nonexistent/localvc-test-tool".to_string();

        let result = CopyStrategy::Sync.spawn(Path::new("/tmp"), Path::new("/tmp"), &config);
        assert!(matches!(result, Err(BackupError::ToolLaunch { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_is_sent_once() {
        let mut config = Config::default();
        config.rsync_path = "sleep".to_string();

        // `sleep -a ...` fails fast on argument parsing; we only need a process handle
        let mut handle = CopyStrategy::Sync
            .spawn(Path::new("/tmp"), Path::new("/tmp"), &config)
            .unwrap();

        assert!(handle.terminate());
        assert!(!handle.terminate());
        assert!(handle.terminate_requested());
        let _ = handle.wait().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_sends_sigterm() {
        use std::os::unix::fs::PermissionsExt;

        let tools = tempfile::tempdir().unwrap();
        let script = tools.path().join("trapping-rsync");
        std::fs::write(
            &script,
            "#!/bin/sh\ntrap 'exit 42' TERM\nwhile :; do sleep 0.05; done\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::default();
        config.rsync_path = script.to_string_lossy().into_owned();
        let mut handle = CopyStrategy::Sync
            .spawn(Path::new("/tmp"), Path::new("/tmp"), &config)
            .unwrap();

        // Give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.terminate());

        let status = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("tool exits after the terminate request")
            .unwrap();
        assert_eq!(status.code(), Some(42));
    }
}

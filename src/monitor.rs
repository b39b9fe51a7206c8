use crate::engine::{LineTail, OutputLines, DIAGNOSTIC_LINES};
use crate::signal::BackupContext;
use crate::utils::estimate_size;
use regex::Regex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Estimating,
    Copying,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub fraction: f64,
    pub phase: Phase,
}

impl ProgressEvent {
    pub fn percent(&self) -> u8 {
        (self.fraction * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

/// Emits progress events, never letting the fraction move backwards
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<ProgressEvent>,
    last: f64,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx, last: 0.0 }
    }

    pub fn last_fraction(&self) -> f64 {
        self.last
    }

    pub async fn estimating(&mut self) {
        self.send(Phase::Estimating, self.last).await;
    }

    pub async fn copying(&mut self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0).max(self.last);
        self.last = fraction;
        self.send(Phase::Copying, fraction).await;
    }

    pub async fn complete(&mut self) {
        self.last = 1.0;
        self.send(Phase::Complete, 1.0).await;
    }

    async fn send(&self, phase: Phase, fraction: f64) {
        // A caller that stopped listening does not stop the backup
        if self.tx.send(ProgressEvent { fraction, phase }).await.is_err() {
            trace!("Progress receiver dropped");
        }
    }
}

fn percent_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)%").expect("valid percentage pattern"))
}

/// Fraction for the last `<digits>%` token on a line
pub fn parse_percentage(line: &str) -> Option<f64> {
    let captures = percent_pattern().captures_iter(line).last()?;
    let percent: u64 = captures.get(1)?.as_str().parse().ok()?;
    Some(percent.min(100) as f64 / 100.0)
}

/// Turn every percentage in the tool's output into a `Copying` event.
///
/// Runs until the output stream closes and returns the most recent lines that
/// carried no percentage, for use as diagnostics.
pub async fn follow_output<R>(
    mut lines: OutputLines<R>,
    reporter: &mut ProgressReporter,
) -> Vec<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut other = LineTail::new(DIAGNOSTIC_LINES);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_percentage(&line) {
                Some(fraction) => reporter.copying(fraction).await,
                None => {
                    trace!("copy tool: {}", line);
                    other.push(line);
                }
            },
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading copy tool output: {}", e);
                break;
            }
        }
    }
    other.into_lines()
}

/// Settings for polling the destination size
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub destination: PathBuf,
    pub total_bytes: u64,
    pub interval: Duration,
}

/// Measure the destination every interval and report it against the total.
///
/// Stops when the fraction reaches 1.0, when `stop` is set, or when the run
/// is cancelled. A zero total reports nothing; the caller finishes at 1.0.
pub async fn poll_destination(
    settings: PollSettings,
    context: BackupContext,
    stop: Arc<AtomicBool>,
    reporter: &mut ProgressReporter,
) {
    loop {
        if stop.load(Ordering::SeqCst) || context.is_cancelled() {
            break;
        }

        if settings.total_bytes > 0 {
            let destination = settings.destination.clone();
            let current = tokio::task::spawn_blocking(move || estimate_size(&destination))
                .await
                .unwrap_or(0);

            let fraction = (current as f64 / settings.total_bytes as f64).min(1.0);
            reporter.copying(fraction).await;
            if fraction >= 1.0 {
                break;
            }
        }

        tokio::time::sleep(settings.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use tokio::io::BufReader;

    fn drain(rx: &mut mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_parse_percentage() {
        assert_eq!(parse_percentage("  45%  120.00kB/s"), Some(0.45));
        assert_eq!(parse_percentage("sending incremental file list"), None);
        assert_eq!(parse_percentage("100%"), Some(1.0));
        assert_eq!(parse_percentage("  0%    0.00kB/s    0:00:00"), Some(0.0));
    }

    #[test]
    fn test_parse_percentage_takes_last_token() {
        assert_eq!(
            parse_percentage("1,234,567  12%  3.21MB/s  0:00:01 (xfr#3, to-chk=5/10) 67%"),
            Some(0.67)
        );
    }

    #[test]
    fn test_parse_percentage_caps_at_one() {
        assert_eq!(parse_percentage("250%"), Some(1.0));
    }

    #[test]
    fn test_event_percent() {
        let event = ProgressEvent {
            fraction: 0.456,
            phase: Phase::Copying,
        };
        assert_eq!(event.percent(), 46);
    }

    #[tokio::test]
    async fn test_reporter_is_monotonic() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut reporter = ProgressReporter::new(tx);

        reporter.copying(0.30).await;
        reporter.copying(0.25).await;
        reporter.copying(1.7).await;
        reporter.complete().await;

        let fractions: Vec<f64> = drain(&mut rx).iter().map(|e| e.fraction).collect();
        assert_eq!(fractions, vec![0.30, 0.30, 1.0, 1.0]);
    }

    #[tokio::test]
    async fn test_reporter_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut reporter = ProgressReporter::new(tx);
        reporter.copying(0.5).await;
        assert_eq!(reporter.last_fraction(), 0.5);
    }

    #[tokio::test]
    async fn test_follow_output() {
        let raw: &[u8] = b"sending incremental file list\n  45%  120.00kB/s\r 100%  1.00MB/s\nrsync: warning\n";
        let (tx, mut rx) = mpsc::channel(16);
        let mut reporter = ProgressReporter::new(tx);

        let other = follow_output(OutputLines::new(BufReader::new(raw)), &mut reporter).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].fraction, 0.45);
        assert_eq!(events[0].phase, Phase::Copying);
        assert_eq!(events[1].fraction, 1.0);
        assert_eq!(
            other,
            vec!["sending incremental file list", "rsync: warning"]
        );
    }

    #[tokio::test]
    async fn test_poll_destination_clamps_to_one() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("copied.bin"), vec![0u8; 150]).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let mut reporter = ProgressReporter::new(tx);
        let settings = PollSettings {
            destination: dir.path().to_path_buf(),
            total_bytes: 100,
            interval: Duration::from_millis(10),
        };

        tokio::time::timeout(
            Duration::from_secs(5),
            poll_destination(
                settings,
                BackupContext::new(),
                Arc::new(AtomicBool::new(false)),
                &mut reporter,
            ),
        )
        .await
        .expect("poll loop ends at 1.0");

        let events = drain(&mut rx);
        assert_eq!(events.last().unwrap().fraction, 1.0);
        assert!(events.iter().all(|e| e.fraction <= 1.0));
    }

    #[tokio::test]
    async fn test_poll_destination_partial_progress() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("half.bin"), vec![0u8; 50]).unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let mut reporter = ProgressReporter::new(tx);
        let stop = Arc::new(AtomicBool::new(false));
        let settings = PollSettings {
            destination: dir.path().to_path_buf(),
            total_bytes: 200,
            interval: Duration::from_millis(10),
        };

        let stopper = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.store(true, Ordering::SeqCst);
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            poll_destination(settings, BackupContext::new(), stop, &mut reporter),
        )
        .await
        .expect("poll loop observes stop");

        let events = drain(&mut rx);
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.fraction == 0.25));
    }

    #[tokio::test]
    async fn test_poll_destination_zero_total() {
        let dir = tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let mut reporter = ProgressReporter::new(tx);
        let context = BackupContext::new();
        let settings = PollSettings {
            destination: dir.path().to_path_buf(),
            total_bytes: 0,
            interval: Duration::from_millis(10),
        };

        let canceller = context.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            canceller.cancel();
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            poll_destination(
                settings,
                context,
                Arc::new(AtomicBool::new(false)),
                &mut reporter,
            ),
        )
        .await
        .expect("poll loop observes cancellation");

        assert!(drain(&mut rx).is_empty());
        assert_eq!(reporter.last_fraction(), 0.0);
    }
}

use crate::clock::ManualClock;
use crate::engine::{IngestOutcome, PositioningEngine};
use crate::scanner::{RawEvent, Scanner};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::sleep;

/// Longest pause honoured between two events in realtime mode.
pub const MAX_REALTIME_GAP: Duration = Duration::from_secs(60);

/// Pause between events observed at `prev` and `at`. Backwards jumps do not
/// pause; long silences are capped at [`MAX_REALTIME_GAP`].
fn realtime_gap(prev: i64, at: i64) -> Duration {
    let gap = u64::try_from(at.saturating_sub(prev)).unwrap_or(0);
    Duration::from_millis(gap).min(MAX_REALTIME_GAP)
}

/// Scanner that plays back a JSON-lines capture of [`RawEvent`]s.
///
/// Blank lines and lines starting with `#` are skipped.
pub struct ReplayScanner {
    path: PathBuf,
    realtime: bool,
    running: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: usize,
    pub applied: usize,
    pub published: usize,
    pub rejected: usize,
    pub discarded: usize,
}

impl ReplayScanner {
    /// With `realtime`, gaps between event timestamps are slept through.
    pub fn new<P: AsRef<Path>>(path: P, realtime: bool) -> Self {
        ReplayScanner {
            path: path.as_ref().to_path_buf(),
            realtime,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Feed the capture into `engine` until the file ends or the scan is
    /// stopped. When `clock` is given it follows the capture timestamps, so
    /// staleness is judged on the recorded timeline.
    pub async fn run(
        &self,
        engine: &PositioningEngine,
        clock: Option<&ManualClock>,
    ) -> Result<ReplaySummary> {
        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open capture file: {:?}", self.path))?;
        let mut lines = BufReader::new(file).lines();

        info!("Replaying {:?}", self.path);

        let mut summary = ReplaySummary::default();
        let mut previous_at: Option<i64> = None;
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if !self.is_running() {
                info!("Replay interrupted at line {}", line_no);
                break;
            }

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            summary.events += 1;

            let event: RawEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping malformed line {}: {}", line_no, e);
                    summary.rejected += 1;
                    continue;
                }
            };

            if let Some(at) = event.observed_at {
                if self.realtime {
                    if let Some(prev) = previous_at {
                        sleep(realtime_gap(prev, at)).await;
                    }
                }
                previous_at = Some(at);
                if let Some(clock) = clock {
                    clock.set(at);
                }
            }

            match engine.ingest(event) {
                IngestOutcome::Applied { published } => {
                    summary.applied += 1;
                    if published {
                        summary.published += 1;
                    }
                }
                IngestOutcome::Rejected(_) => summary.rejected += 1,
                IngestOutcome::Discarded => summary.discarded += 1,
            }
        }

        debug!("Replay finished: {:?}", summary);
        Ok(summary)
    }
}

impl Scanner for ReplayScanner {
    fn start_scan(&self) -> Result<()> {
        if !self.path.is_file() {
            anyhow::bail!("capture file not found: {:?}", self.path);
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::EngineState;
    use crate::error::EngineError;
    use crate::model::BeaconIdentity;
    use crate::scanner::StaticPermissions;
    use std::fs;

    fn capture_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "beaconpos-{}-{}.jsonl",
            name,
            std::process::id()
        ));
        fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_replay_capture() {
        let path = capture_file(
            "replay",
            r#"# two beacons, then one goes quiet
{"namespace":"ns","major":1,"minor":1,"rssi":-70,"observed_at":1000}
{"namespace":"ns","major":1,"minor":2,"rssi":-65,"observed_at":1100}

{"namespace":"ns","major":1,"minor":1,"rssi":-50,"observed_at":1200}
not json
{"namespace":"ns","major":1,"rssi":-50,"observed_at":1300}
{"namespace":"ns","major":1,"minor":1,"rssi":-51,"observed_at":9000}
"#,
        );

        let scanner = Arc::new(ReplayScanner::new(&path, false));
        let clock = ManualClock::new(0);
        let engine = PositioningEngine::with_clock(
            Config::default(),
            scanner.clone(),
            Arc::new(StaticPermissions::granted()),
            Arc::new(clock.clone()),
        );

        engine.start().unwrap();
        assert!(scanner.is_running());
        let summary = scanner.run(&engine, Some(&clock)).await.unwrap();

        assert_eq!(summary.events, 6);
        assert_eq!(summary.applied, 4);
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.discarded, 0);

        // Beacon 2 last seen at 1100 is stale by 9000
        let beacons = engine.beacons();
        assert_eq!(beacons.len(), 1);
        assert_eq!(
            engine.current_anchor().unwrap().identity,
            BeaconIdentity::new("ns", 1, 1)
        );

        engine.destroy();
        assert!(!scanner.is_running());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_realtime_gap() {
        assert_eq!(realtime_gap(1_000, 1_250), Duration::from_millis(250));
        assert_eq!(realtime_gap(1_250, 1_000), Duration::ZERO);
        assert_eq!(realtime_gap(0, 3_600_000), MAX_REALTIME_GAP);
        assert_eq!(realtime_gap(i64::MIN, i64::MAX), MAX_REALTIME_GAP);
        assert_eq!(realtime_gap(i64::MAX, i64::MIN), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_realtime_replay_survives_extreme_timestamps() {
        let path = capture_file(
            "extreme",
            &format!(
                "{{\"namespace\":\"ns\",\"major\":1,\"minor\":1,\"rssi\":-60,\"observed_at\":{}}}\n\
                 {{\"namespace\":\"ns\",\"major\":1,\"minor\":1,\"rssi\":-61,\"observed_at\":{}}}\n",
                i64::MAX,
                i64::MIN
            ),
        );

        let scanner = Arc::new(ReplayScanner::new(&path, true));
        let clock = ManualClock::new(0);
        let engine = PositioningEngine::with_clock(
            Config::default(),
            scanner.clone(),
            Arc::new(StaticPermissions::granted()),
            Arc::new(clock.clone()),
        );

        engine.start().unwrap();
        let summary = scanner.run(&engine, Some(&clock)).await.unwrap();
        assert_eq!(summary.events, 2);
        assert_eq!(summary.applied, 2);

        engine.destroy();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_capture_fails_start() {
        let scanner = Arc::new(ReplayScanner::new("/nonexistent/capture.jsonl", false));
        let engine = PositioningEngine::new(
            Config::default(),
            scanner,
            Arc::new(StaticPermissions::granted()),
        );
        assert!(matches!(
            engine.start(),
            Err(EngineError::ScannerUnavailable { .. })
        ));
        assert_eq!(engine.state(), EngineState::Failed);
    }
}

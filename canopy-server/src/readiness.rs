//! Readiness inference from dev-server output.
//!
//! Managed tools expose no health endpoint, so readiness is inferred from
//! their log stream: the first line matching a success pattern resolves
//! the wait as ready, the first failure pattern resolves it as failed, and
//! two clocks (total since start, idle since the last line) bound the wait.
//! An elapsed clock resolves as a timeout, which the supervisor treats as
//! failure.

use crate::defaults::{
    READY_FAILURE_PATTERNS, READY_IDLE_TIMEOUT, READY_SUCCESS_PATTERNS, READY_TOTAL_TIMEOUT,
};
use canopy_core::LogLine;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// The matcher is configuration, not protocol: pattern sets are expected
/// to drift as dev tools change their banner text.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub success_patterns: Vec<String>,
    pub failure_patterns: Vec<String>,
    /// Per-server extra success substring supplied by the caller.
    pub sentinel: Option<String>,
    pub total_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            success_patterns: READY_SUCCESS_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            failure_patterns: READY_FAILURE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sentinel: None,
            total_timeout: READY_TOTAL_TIMEOUT,
            idle_timeout: READY_IDLE_TIMEOUT,
        }
    }
}

impl ReadinessConfig {
    pub fn with_sentinel(mut self, sentinel: Option<String>) -> Self {
        self.sentinel = sentinel;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready,
    Failed { line: String },
    TimedOut { elapsed: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineVerdict {
    Success,
    Failure,
    Pending,
}

fn classify(config: &ReadinessConfig, line: &str) -> LineVerdict {
    let lowered = line.to_lowercase();

    // Failure first: a line like "build failed, server not ready" should
    // not count as success.
    if config
        .failure_patterns
        .iter()
        .any(|p| lowered.contains(p.as_str()))
    {
        return LineVerdict::Failure;
    }

    if config
        .success_patterns
        .iter()
        .any(|p| lowered.contains(p.as_str()))
    {
        return LineVerdict::Success;
    }

    // "Local: http://..." style banners.
    if lowered.contains("local") && lowered.contains("http") {
        return LineVerdict::Success;
    }

    if let Some(sentinel) = &config.sentinel
        && !sentinel.is_empty()
        && lowered.contains(&sentinel.to_lowercase())
    {
        return LineVerdict::Success;
    }

    LineVerdict::Pending
}

/// Consume `rx` until a line resolves the wait or a clock elapses.
/// Stops consuming as soon as it resolves.
pub async fn wait_ready(
    config: &ReadinessConfig,
    rx: &mut broadcast::Receiver<LogLine>,
) -> ReadinessOutcome {
    let started = Instant::now();
    let total_deadline = started + config.total_timeout;
    let mut idle_deadline = started + config.idle_timeout;

    loop {
        let deadline = total_deadline.min(idle_deadline);
        let received = tokio::select! {
            r = rx.recv() => r,
            _ = tokio::time::sleep_until(deadline) => {
                return ReadinessOutcome::TimedOut { elapsed: started.elapsed() };
            }
        };

        match received {
            Ok(entry) => {
                idle_deadline = Instant::now() + config.idle_timeout;
                match classify(config, &entry.line) {
                    LineVerdict::Success => return ReadinessOutcome::Ready,
                    LineVerdict::Failure => {
                        return ReadinessOutcome::Failed { line: entry.line };
                    }
                    LineVerdict::Pending => {}
                }
            }
            // A lagged follower missed lines; keep reading what is left.
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            // Stream torn down: the record is being pruned. Fail closed.
            Err(broadcast::error::RecvError::Closed) => {
                return ReadinessOutcome::Failed {
                    line: "output stream closed before readiness".to_string(),
                };
            }
        }
    }
}

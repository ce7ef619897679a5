//! Tunables for the supervisor daemon, in one place.

use std::time::Duration;

/// Loopback pool: 127.0.0.2 ..= 127.0.0.254. 127.0.0.1 is left alone so the
/// supervisor never fights the machine's own services for it.
pub const HOST_POOL_FIRST_OCTET: u8 = 2;
pub const HOST_POOL_LAST_OCTET: u8 = 254;

/// Max captured lines held in memory per server.
pub const LOG_BUFFER_LINES: usize = 1000;

/// Captured lines longer than this are truncated before buffering.
pub const LOG_LINE_MAX_BYTES: usize = 8 * 1024;

/// How often the liveness watcher polls the child pid.
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How often a tailer re-checks a log file that has no new bytes.
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Readiness clocks: generous total (monorepo cold builds), shorter idle.
pub const READY_TOTAL_TIMEOUT: Duration = Duration::from_secs(180);
pub const READY_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace between SIGTERM and the SIGKILL escalation during stop.
pub const KILL_GRACE: Duration = Duration::from_millis(400);

/// External reverse-proxy admin API.
pub const PROXY_ADMIN_URL: &str = "http://127.0.0.1:2019";
pub const PROXY_ADMIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Ports forwarded when a proxy is enabled and no override is configured.
pub const PROXY_DEFAULT_PORTS: &[u16] = &[3000];

/// Substrings (matched case-insensitively) that mark a dev server as ready.
/// The "local" + "http" co-occurrence is handled separately.
pub const READY_SUCCESS_PATTERNS: &[&str] =
    &["ready", "compiled successfully", "listening on", "started server"];

/// Substrings that mark startup as failed.
pub const READY_FAILURE_PATTERNS: &[&str] =
    &["exited with code", "command failed", "cannot find module", "eaddrinuse"];

/// Process names swept as a last resort when they linger in a stopped
/// server's working directory.
pub const SWEEP_PROCESS_NAMES: &[&str] = &[
    "node", "npm", "pnpm", "yarn", "bun", "deno", "vite", "webpack", "next", "esbuild",
];

/// Launch command when the caller does not supply one.
pub const DEFAULT_COMMAND: &str = "npm";
pub const DEFAULT_ARGS: &[&str] = &["run", "dev"];

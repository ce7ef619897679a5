use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

pub fn wait_for<F>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[allow(dead_code)]
pub struct TestDaemon {
    child: Option<Child>,
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    _tmp: TempDir,
}

impl TestDaemon {
    pub fn spawn() -> Self {
        let tmp = TempDir::new().unwrap();
        Self::spawn_with_dirs(tmp)
    }

    fn spawn_with_dirs(tmp: TempDir) -> Self {
        let data_dir = tmp.path().join("data");
        let socket_path = tmp.path().join("canopyd.sock");
        let child = Self::launch(&socket_path, &data_dir);

        let daemon = Self {
            child: Some(child),
            socket_path,
            data_dir,
            _tmp: tmp,
        };
        assert!(
            wait_for(Duration::from_secs(10), || daemon.try_connect()),
            "daemon never came up on {}",
            daemon.socket_path.display()
        );
        daemon
    }

    fn launch(socket_path: &PathBuf, data_dir: &PathBuf) -> Child {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_canopy-server"));
        cmd.args([
            "--socket",
            &socket_path.to_string_lossy(),
            "--data-dir",
            &data_dir.to_string_lossy(),
            // Nothing listens here; proxy admin calls are not part of these
            // tests and must fail fast.
            "--proxy-admin-url",
            "http://127.0.0.1:1",
            "--ready-timeout-secs",
            "15",
            "--ready-idle-secs",
            "10",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
        cmd.spawn().expect("spawn canopy-server")
    }

    /// Restart the daemon against the same socket and data dir, as after a
    /// crash or upgrade.
    pub fn restart(&mut self) {
        self.shutdown();
        let child = Self::launch(&self.socket_path, &self.data_dir);
        self.child = Some(child);
        assert!(
            wait_for(Duration::from_secs(10), || self.try_connect()),
            "daemon never came back after restart"
        );
    }

    pub fn try_connect(&self) -> bool {
        UnixStream::connect(&self.socket_path).is_ok()
    }

    /// One request over a fresh connection.
    pub fn request(&self, command: &serde_json::Value) -> serde_json::Value {
        let mut stream = UnixStream::connect(&self.socket_path).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut line = serde_json::to_string(command).unwrap();
        line.push('\n');
        stream.write_all(line.as_bytes()).unwrap();

        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        reader.read_line(&mut response).expect("read response");
        serde_json::from_str(&response).expect("parse response")
    }

    pub fn request_ok(&self, command: &serde_json::Value) -> serde_json::Value {
        let resp = self.request(command);
        assert_eq!(resp["status"], "ok", "daemon error: {resp}");
        resp["data"].clone()
    }

    pub fn shutdown(&mut self) {
        if self.try_connect() {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.request(&serde_json::json!({"command": "shutdown"}));
            }));
        }
        if let Some(mut child) = self.child.take() {
            let exited = wait_for(Duration::from_secs(5), || {
                matches!(child.try_wait(), Ok(Some(_)))
            });
            if !exited {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

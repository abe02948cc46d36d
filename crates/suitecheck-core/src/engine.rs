//! Engine CLI boundary: spawn the workflow engine and capture its result.
//!
//! The harness only ever consumes the exit code and the two output streams;
//! it never inspects engine-internal state. The runtime root is exported to
//! the engine as `SUITECHECK_RUN_DIR` so it resolves instance names against
//! the isolated root instead of the user's real run directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{HarnessError, HarnessResult};

/// Environment variable carrying the isolated runtime root to the engine.
pub const RUN_DIR_ENV: &str = "SUITECHECK_RUN_DIR";

/// Captured outcome of one engine invocation. Never mutated after capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub args: Vec<String>,
    /// `None` if the process was killed by a signal or timed out
    pub exit_code: Option<i32>,
    #[serde(with = "lossy_text")]
    pub stdout: Vec<u8>,
    #[serde(with = "lossy_text")]
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Which captured stream an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn extension(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl InvocationResult {
    pub fn stream(&self, stream: Stream) -> &[u8] {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Write `<label>.stdout` and `<label>.stderr` under `dir`.
    pub fn write_artifacts(&self, dir: &Path, label: &str) -> HarnessResult<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let out = dir.join(format!("{}.{}", label, Stream::Stdout.extension()));
        let err = dir.join(format!("{}.{}", label, Stream::Stderr.extension()));
        std::fs::write(&out, &self.stdout)?;
        std::fs::write(&err, &self.stderr)?;
        Ok((out, err))
    }
}

/// How to reach the engine binary.
#[derive(Debug, Clone)]
pub struct Engine {
    program: String,
    prefix_args: Vec<String>,
    run_dir: PathBuf,
    timeout: Duration,
}

impl Engine {
    pub fn new(program: impl Into<String>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            run_dir: run_dir.into(),
            timeout: Duration::from_secs(300),
        }
    }

    /// Arguments inserted before every invocation's own arguments.
    pub fn with_prefix_args(mut self, args: Vec<String>) -> Self {
        self.prefix_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the engine and capture both streams.
    ///
    /// A timeout kills the child and yields a result with `timed_out` set; it
    /// is not an error. Failing to spawn the binary is. Output written before
    /// a timeout is kept, followed by a `timed out after ...` note on stderr.
    pub async fn invoke(&self, args: &[String]) -> HarnessResult<InvocationResult> {
        let mut full_args = self.prefix_args.clone();
        full_args.extend(args.iter().cloned());

        tracing::info!("[Engine] Running: {} {}", self.program, full_args.join(" "));

        let started = Instant::now();
        let mut child = tokio::process::Command::new(&self.program)
            .args(&full_args)
            .env(RUN_DIR_ENV, &self.run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarnessError::Engine(format!(
                    "Failed to spawn '{}': {}. Is it installed and in PATH?",
                    self.program, e
                ))
            })?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let mut readers = [
            spawn_drain(child.stdout.take(), stdout_buf.clone()),
            spawn_drain(child.stderr.take(), stderr_buf.clone()),
        ];

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        let (exit_code, timed_out) = match waited {
            Ok(Ok(status)) => {
                for reader in &mut readers {
                    let _ = reader.await;
                }
                (status.code(), false)
            }
            Ok(Err(e)) => {
                return Err(HarnessError::Engine(format!(
                    "Failed waiting for '{}': {}",
                    self.program, e
                )))
            }
            Err(_) => {
                tracing::warn!(
                    "[Engine] {} timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!("[Engine] Failed to kill {}: {}", self.program, e);
                }
                // Grandchildren may still hold the pipes open.
                let _ = tokio::time::timeout(DRAIN_GRACE, async {
                    for reader in &mut readers {
                        let _ = reader.await;
                    }
                })
                .await;
                for reader in &readers {
                    reader.abort();
                }
                (None, true)
            }
        };

        let stdout = std::mem::take(&mut *stdout_buf.lock().await);
        let mut stderr = std::mem::take(&mut *stderr_buf.lock().await);
        if timed_out {
            if !stderr.is_empty() && !stderr.ends_with(b"\n") {
                stderr.push(b'\n');
            }
            stderr.extend_from_slice(format!("timed out after {:?}\n", self.timeout).as_bytes());
        }

        let result = InvocationResult {
            args: full_args,
            exit_code,
            stdout,
            stderr,
            timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::debug!(
            "[Engine] {} exited with {:?} in {}ms",
            self.program,
            result.exit_code,
            result.duration_ms
        );
        Ok(result)
    }
}

/// How long to keep reading after a timed-out child was killed.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Copy everything from `reader` into `buf` until EOF.
fn spawn_drain<R>(reader: Option<R>, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else { return };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
            }
        }
    })
}

mod lossy_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(d).map(String::into_bytes)
    }
}

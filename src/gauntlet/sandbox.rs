//! Sandboxed execution of untrusted submissions.
//!
//! Each execution spawns the configured Python interpreter on a generated
//! harness script inside a fresh scratch directory: environment cleared,
//! CPU and address-space rlimits applied in the child, wall-clock timeout
//! enforced from the parent. Concurrency is bounded by a semaphore pool
//! with a capped FIFO wait queue; beyond the cap, submissions fail fast.
//!
//! The harness runs the tool code, then the test case, and finishes with a
//! `__GAUNTLET_RUSAGE__` line on stderr carrying the child's own CPU and
//! peak-RSS measurements, which the executor parses out of the stream.

use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use regex::Regex;
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::models::Execution;

/// Marker line the harness prints on stderr before exiting.
static RUSAGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^__GAUNTLET_RUSAGE__ cpu_ms=(\d+) max_rss_kb=(\d+)\n?")
        .expect("rusage pattern")
});

/// Pooled sandbox executor.
pub struct SandboxExecutor {
    config: SandboxConfig,
    pool: Arc<Semaphore>,
    waiting: AtomicUsize,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        let pool = Arc::new(Semaphore::new(config.pool_size));
        Self {
            config,
            pool,
            waiting: AtomicUsize::new(0),
        }
    }

    /// Current number of submissions waiting for a pool slot.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Run `code` then `test_case` in an isolated child process.
    ///
    /// Limit breaches are reported in the returned [`Execution`], not as
    /// errors. Errors mean no execution happened (overload, spawn failure).
    pub async fn execute(&self, code: &str, test_case: &str) -> Result<Execution, SandboxError> {
        let _permit = match self.pool.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
                if waiting >= self.config.max_queue_depth {
                    self.waiting.fetch_sub(1, Ordering::SeqCst);
                    return Err(SandboxError::Overloaded { queued: waiting });
                }
                let acquired = self.pool.clone().acquire_owned().await;
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                acquired.map_err(|_| SandboxError::Spawn("execution pool closed".to_string()))?
            }
        };

        let scratch = tempfile::Builder::new()
            .prefix("agentevolution-run-")
            .tempdir()?;
        let harness_path = scratch.path().join("harness.py");
        tokio::fs::write(&harness_path, build_harness(code, test_case)).await?;

        let mut cmd = Command::new(&self.config.python_bin);
        cmd.arg(&harness_path)
            .current_dir(scratch.path())
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HOME", scratch.path())
            .env("TMPDIR", scratch.path())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let cpu_secs = self.config.cpu_limit.as_secs();
            let mem_bytes = self.config.memory_limit_mb * 1024 * 1024;
            // SAFETY: setrlimit is async-signal-safe and the closure touches
            // nothing but its captured integers.
            unsafe {
                cmd.pre_exec(move || {
                    let cpu = libc::rlimit {
                        rlim_cur: cpu_secs as libc::rlim_t,
                        rlim_max: (cpu_secs + 1) as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    let mem = libc::rlimit {
                        rlim_cur: mem_bytes as libc::rlim_t,
                        rlim_max: mem_bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &mem) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let start = Instant::now();
        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        // On timeout the future is dropped and kill_on_drop reaps the child.
        let output = match tokio::time::timeout(self.config.wall_limit, child.wait_with_output())
            .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(SandboxError::Io(e)),
            Err(_elapsed) => {
                tracing::info!(
                    wall_ms = self.config.wall_limit.as_millis() as u64,
                    "sandbox child exceeded wall-clock limit"
                );
                return Ok(Execution {
                    exit: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    wall_ms: self.config.wall_limit.as_millis() as u64,
                    cpu_ms: 0,
                    peak_mem_kb: 0,
                    timed_out: true,
                    oom: false,
                });
            }
        };

        let wall_ms = start.elapsed().as_millis() as u64;
        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let (cpu_ms, peak_mem_kb) = extract_rusage(&mut stderr);

        truncate_at_boundary(&mut stdout, self.config.max_output_bytes);
        truncate_at_boundary(&mut stderr, self.config.max_output_bytes);

        let exit = output.status.code().unwrap_or(-1);
        let signal = exit_signal(&output.status);

        // SIGXCPU means the rlimit fired before the wall clock did.
        let timed_out = signal == Some(libc_sigxcpu());
        let oom = stderr.contains("MemoryError")
            || matches!(signal, Some(s) if s == 9 || s == 11 || s == 6);

        Ok(Execution {
            exit,
            stdout,
            stderr,
            wall_ms,
            cpu_ms,
            peak_mem_kb,
            timed_out,
            oom,
        })
    }
}

/// Build the Python harness that loads the tool, runs the test, and
/// reports its own resource usage.
fn build_harness(code: &str, test_case: &str) -> String {
    format!(
        r#"import sys
import traceback

_status = 0

try:
{code}
    pass
except Exception as e:
    print("TOOL_LOAD_ERROR: %s: %s" % (type(e).__name__, e), file=sys.stderr)
    _status = 1

if _status == 0:
    try:
{test}
        print("TEST_PASSED")
    except AssertionError as e:
        print("TEST_FAILED: assertion: %s" % e, file=sys.stderr)
        _status = 1
    except Exception as e:
        print("TEST_FAILED: %s: %s" % (type(e).__name__, e), file=sys.stderr)
        traceback.print_exc(file=sys.stderr)
        _status = 1

try:
    import resource as _resource
    _ru = _resource.getrusage(_resource.RUSAGE_SELF)
    _rss_kb = int(_ru.ru_maxrss)
    if sys.platform == "darwin":
        _rss_kb //= 1024
    _cpu_ms = int((_ru.ru_utime + _ru.ru_stime) * 1000)
    print("__GAUNTLET_RUSAGE__ cpu_ms=%d max_rss_kb=%d" % (_cpu_ms, _rss_kb), file=sys.stderr)
except Exception:
    pass

sys.exit(_status)
"#,
        code = indent(code, 4),
        test = indent(test_case, 8),
    )
}

fn indent(source: &str, spaces: usize) -> String {
    let prefix = " ".repeat(spaces);
    source
        .lines()
        .map(|l| {
            if l.trim().is_empty() {
                String::new()
            } else {
                format!("{prefix}{l}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pull the rusage marker line out of stderr, returning (cpu_ms, max_rss_kb).
fn extract_rusage(stderr: &mut String) -> (u64, u64) {
    let Some(caps) = RUSAGE_LINE.captures(stderr) else {
        return (0, 0);
    };
    let cpu_ms = caps[1].parse().unwrap_or(0);
    let rss_kb = caps[2].parse().unwrap_or(0);
    let cleaned = RUSAGE_LINE.replace(stderr, "").into_owned();
    *stderr = cleaned;
    (cpu_ms, rss_kb)
}

/// Truncate a string to at most `max` bytes without splitting a character.
fn truncate_at_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn libc_sigxcpu() -> i32 {
    libc::SIGXCPU
}

#[cfg(not(unix))]
fn libc_sigxcpu() -> i32 {
    24
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use std::time::Duration;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok()
    }

    #[test]
    fn harness_embeds_code_and_test() {
        let harness = build_harness("def f():\n    return 1", "assert f() == 1");
        assert!(harness.contains("    def f():"));
        assert!(harness.contains("        assert f() == 1"));
        assert!(harness.contains("TEST_PASSED"));
        assert!(harness.contains("__GAUNTLET_RUSAGE__"));
    }

    #[test]
    fn indent_skips_blank_lines() {
        assert_eq!(indent("a\n\nb", 4), "    a\n\n    b");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let mut s = "héllo".to_string();
        truncate_at_boundary(&mut s, 2);
        assert_eq!(s, "h");

        let mut short = "ok".to_string();
        truncate_at_boundary(&mut short, 10);
        assert_eq!(short, "ok");
    }

    #[test]
    fn extract_rusage_strips_marker() {
        let mut stderr = "some error\n__GAUNTLET_RUSAGE__ cpu_ms=12 max_rss_kb=3400\n".to_string();
        let (cpu, rss) = extract_rusage(&mut stderr);
        assert_eq!(cpu, 12);
        assert_eq!(rss, 3400);
        assert!(!stderr.contains("__GAUNTLET_RUSAGE__"));
        assert!(stderr.contains("some error"));
    }

    #[test]
    fn extract_rusage_missing_marker() {
        let mut stderr = "plain error".to_string();
        assert_eq!(extract_rusage(&mut stderr), (0, 0));
    }

    #[tokio::test]
    async fn passing_test_exits_zero() {
        if !python_available() {
            return;
        }
        let executor = SandboxExecutor::new(SandboxConfig::default());
        let exec = executor
            .execute("def add(a, b):\n    return a + b", "assert add(2, 3) == 5")
            .await
            .expect("execute");
        assert_eq!(exec.exit, 0, "stderr: {}", exec.stderr);
        assert!(exec.stdout.contains("TEST_PASSED"));
        assert!(!exec.timed_out);
        assert!(exec.cpu_ms > 0 || exec.peak_mem_kb > 0, "rusage parsed");
    }

    #[tokio::test]
    async fn failing_assertion_exits_nonzero() {
        if !python_available() {
            return;
        }
        let executor = SandboxExecutor::new(SandboxConfig::default());
        let exec = executor
            .execute("def add(a, b):\n    return a + b", "assert add(2, 3) == 6")
            .await
            .expect("execute");
        assert_ne!(exec.exit, 0);
        assert!(exec.stderr.contains("TEST_FAILED"));
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        if !python_available() {
            return;
        }
        let executor = SandboxExecutor::new(SandboxConfig {
            wall_limit: Duration::from_secs(2),
            ..SandboxConfig::default()
        });
        let exec = executor
            .execute("def f():\n    return 1", "while True:\n    pass")
            .await
            .expect("execute");
        assert!(exec.timed_out);
    }

    #[tokio::test]
    async fn environment_is_scrubbed() {
        if !python_available() {
            return;
        }
        // SAFETY: No concurrent reader depends on this probe variable.
        unsafe {
            std::env::set_var("AGENTEVOLUTION_SECRET_PROBE", "leaked");
        }
        let executor = SandboxExecutor::new(SandboxConfig::default());
        let exec = executor
            .execute(
                "import json",
                "import os\nassert 'AGENTEVOLUTION_SECRET_PROBE' not in os.environ",
            )
            .await
            .expect("execute");
        assert_eq!(exec.exit, 0, "stderr: {}", exec.stderr);
    }

    #[tokio::test]
    async fn overload_fails_fast() {
        let executor = Arc::new(SandboxExecutor::new(SandboxConfig {
            pool_size: 1,
            max_queue_depth: 0,
            wall_limit: Duration::from_secs(2),
            ..SandboxConfig::default()
        }));

        // Hold the only slot without spawning anything.
        let permit = executor
            .pool
            .clone()
            .try_acquire_owned()
            .expect("acquire slot");

        let result = executor.execute("x = 1", "assert x == 1").await;
        assert!(matches!(result, Err(SandboxError::Overloaded { .. })));
        drop(permit);
    }
}

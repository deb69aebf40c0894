//! The Gauntlet: static screening followed by sandboxed verification.
//!
//! The sole path by which a tool reaches `TrustLevel::Verified`.

mod sandbox;
mod screener;

pub use sandbox::SandboxExecutor;
pub use screener::StaticScreener;

use std::sync::Arc;

use uuid::Uuid;

use crate::error::SandboxError;
use crate::models::{SecurityScan, Verdict};

/// How much failure output to keep in a verdict's error message.
const ERROR_EXCERPT_BYTES: usize = 500;

/// Verification pipeline over a screener and a sandbox pool.
pub struct Gauntlet {
    screener: StaticScreener,
    sandbox: Arc<SandboxExecutor>,
}

impl Gauntlet {
    pub fn new(screener: StaticScreener, sandbox: Arc<SandboxExecutor>) -> Self {
        Self { screener, sandbox }
    }

    /// Run a submission through screen → execute and produce a verdict.
    ///
    /// `Err` is reserved for cases where verification could not run at all
    /// (pool overloaded, interpreter missing); a failing submission is an
    /// `Ok` verdict with `approved = false`.
    pub async fn verify(&self, code: &str, test_case: &str) -> Result<Verdict, SandboxError> {
        let run_id = Uuid::new_v4();

        let scan = self.screener.screen(code, test_case);
        if !scan.safe {
            tracing::info!(%run_id, reasons = scan.reasons.len(), "submission rejected by static screen");
            return Ok(Verdict {
                approved: false,
                security_scan: SecurityScan::Fail,
                exec_ms: 0,
                mem_kb: 0,
                test_passed: false,
                error: Some(scan.reasons.join("; ")),
                run_id,
                timed_out: None,
                oom: None,
            });
        }

        let exec = self.sandbox.execute(code, test_case).await?;

        if exec.timed_out || exec.oom || exec.exit != 0 {
            let error = if exec.timed_out {
                "execution exceeded the time limit".to_string()
            } else if exec.oom {
                "execution exceeded the memory limit".to_string()
            } else {
                let mut excerpt = exec.stderr.clone();
                if excerpt.len() > ERROR_EXCERPT_BYTES {
                    excerpt.truncate(
                        (0..=ERROR_EXCERPT_BYTES)
                            .rev()
                            .find(|&i| excerpt.is_char_boundary(i))
                            .unwrap_or(0),
                    );
                }
                if excerpt.trim().is_empty() {
                    format!("test exited with status {}", exec.exit)
                } else {
                    excerpt
                }
            };

            tracing::info!(
                %run_id,
                exit = exec.exit,
                timed_out = exec.timed_out,
                oom = exec.oom,
                "submission rejected by sandbox"
            );

            return Ok(Verdict {
                approved: false,
                security_scan: scan.scan,
                exec_ms: exec.wall_ms,
                mem_kb: exec.peak_mem_kb,
                test_passed: false,
                error: Some(error),
                run_id,
                timed_out: Some(exec.timed_out),
                oom: Some(exec.oom),
            });
        }

        tracing::info!(%run_id, exec_ms = exec.wall_ms, "submission verified");

        Ok(Verdict {
            approved: true,
            security_scan: scan.scan,
            exec_ms: exec.wall_ms,
            mem_kb: exec.peak_mem_kb,
            test_passed: true,
            error: None,
            run_id,
            timed_out: None,
            oom: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SandboxConfig, ScreenerConfig};

    fn gauntlet() -> Gauntlet {
        Gauntlet::new(
            StaticScreener::new(ScreenerConfig::default()),
            Arc::new(SandboxExecutor::new(SandboxConfig::default())),
        )
    }

    #[tokio::test]
    async fn static_rejection_skips_the_sandbox() {
        // An unscreenable submission never reaches the interpreter, so this
        // passes even on hosts without python.
        let verdict = gauntlet()
            .verify("import socket\n", "pass")
            .await
            .expect("verify");
        assert!(!verdict.approved);
        assert_eq!(verdict.security_scan, SecurityScan::Fail);
        assert_eq!(verdict.exec_ms, 0);
        assert!(verdict.error.as_deref().is_some_and(|e| e.contains("socket")));
    }

    #[tokio::test]
    async fn approved_submission_passes_both_stages() {
        if std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_err()
        {
            return;
        }
        let verdict = gauntlet()
            .verify("def add(a, b):\n    return a + b", "assert add(2, 3) == 5")
            .await
            .expect("verify");
        assert!(verdict.approved, "error: {:?}", verdict.error);
        assert!(verdict.test_passed);
        assert_eq!(verdict.security_scan, SecurityScan::Pass);
    }
}

//! Workers backed by external programs.
//!
//! The task envelope is written to the program's stdin as JSON; the program
//! answers with a result envelope on stdout. A non-zero exit is a transport
//! failure; an envelope with `status = error` is a worker failure.

use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use foreman_core::{ForemanError, ForemanResult, ResultEnvelope, TaskEnvelope, Worker};

#[derive(Debug, Clone)]
pub struct CommandWorker {
    skill_id: String,
    program: String,
    args: Vec<String>,
}

impl CommandWorker {
    pub fn new(skill_id: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            skill_id: skill_id.into(),
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn skill_id(&self) -> &str {
        &self.skill_id
    }

    async fn call(&self, task: &TaskEnvelope) -> ForemanResult<ResultEnvelope> {
        let payload = serde_json::to_vec(task)?;

        // The dispatcher drops this future on timeout; the child goes with it.
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ForemanError::Transport(format!("failed to spawn {}: {e}", self.program)))?;

        // Feed stdin while stdout drains, or a chatty child fills its pipe
        // and both sides wait on each other.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        match fed {
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(program = %self.program, "worker exited without reading its task");
            }
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(program = %self.program, status = %output.status, "worker process exited");

        if !output.status.success() {
            return Err(ForemanError::Transport(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            ForemanError::Transport(format!("{} wrote an invalid result envelope: {e}", self.program))
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use foreman_core::EnvelopeStatus;
    use serde_json::json;

    fn sh(script: &str) -> CommandWorker {
        CommandWorker::new("shell", "sh", vec!["-c".into(), script.into()])
    }

    fn task() -> TaskEnvelope {
        TaskEnvelope::new("t-1", "shell", json!({"text": "hi"}))
    }

    #[tokio::test]
    async fn test_reads_envelope_from_stdout() {
        let worker = sh(r#"cat > /dev/null; echo '{"status":"success","result":{"ok":true},"completion_promise":"COMPLETE"}'"#);
        let env = worker.call(&task()).await.unwrap();
        assert_eq!(env.status, EnvelopeStatus::Success);
        assert_eq!(env.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_task_is_written_to_stdin() {
        let worker = sh(r#"grep -q '"task_id":"t-1"' && echo '{"status":"success","result":{},"completion_promise":"COMPLETE"}'"#);
        let env = worker.call(&task()).await.unwrap();
        assert!(env.is_success());
    }

    fn large_task() -> TaskEnvelope {
        TaskEnvelope::new("t-2", "shell", json!({"text": "x".repeat(1 << 20)}))
    }

    #[tokio::test]
    async fn test_worker_that_ignores_stdin_still_succeeds() {
        let worker = sh(r#"echo '{"status":"success","result":{},"completion_promise":"COMPLETE"}'"#);
        let env = worker.call(&large_task()).await.unwrap();
        assert!(env.is_success());
    }

    #[tokio::test]
    async fn test_large_output_before_reading_input_does_not_stall() {
        let worker = sh(r#"head -c 262144 /dev/zero | tr '\0' ' '; echo '{"status":"success","result":{},"completion_promise":"COMPLETE"}'; cat > /dev/null"#);
        let env = tokio::time::timeout(std::time::Duration::from_secs(20), worker.call(&large_task()))
            .await
            .expect("worker call stalled")
            .unwrap();
        assert!(env.is_success());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_transport_error() {
        let worker = sh("cat > /dev/null; echo boom >&2; exit 3");
        let err = worker.call(&task()).await.unwrap_err();
        assert!(matches!(err, ForemanError::Transport(ref m) if m.contains("boom")), "{err}");
    }

    #[tokio::test]
    async fn test_garbage_stdout_is_transport_error() {
        let worker = sh("cat > /dev/null; echo not-json");
        let err = worker.call(&task()).await.unwrap_err();
        assert!(matches!(err, ForemanError::Transport(_)));
    }
}

//! Lifecycle of the external anonymizing proxy process.
//!
//! When the configuration names a program (typically `tor`), it is started
//! before the first fetch and stopped after the last one. The child is
//! spawned with `kill_on_drop`, so an early return, an error or a panic
//! still takes it down; [`AnonymizerProcess::shutdown`] is the orderly path
//! that also reaps it.

use std::error::Error;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::AnonymizerConfig;
use crate::utils::truncate_for_log;

#[derive(Debug)]
pub struct AnonymizerProcess {
    child: Child,
    program: String,
}

impl AnonymizerProcess {
    /// Spawn the program and, if a ready marker is configured, wait until it
    /// shows up on stdout.
    #[instrument(level = "info", skip_all, fields(program = %config.program))]
    pub async fn launch(config: &AnonymizerConfig) -> Result<Self, Box<dyn Error>> {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if config.ready_marker.is_some() {
            command.stdout(Stdio::piped());
        } else {
            command.stdout(Stdio::null());
        }

        let child = command.spawn()?;
        let mut process = Self {
            child,
            program: config.program.clone(),
        };
        info!(pid = ?process.pid(), "Anonymizer process started");

        let Some(marker) = config.ready_marker.as_deref() else {
            return Ok(process);
        };
        let stdout = process
            .child
            .stdout
            .take()
            .ok_or("anonymizer stdout was not captured")?;
        let mut lines = BufReader::new(stdout).lines();

        match timeout(config.startup_timeout(), wait_for_marker(&mut lines, marker)).await {
            Ok(Ok(true)) => {
                info!(%marker, "Anonymizer process is ready");
                // Keep draining so the child never blocks on a full pipe.
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(line = %truncate_for_log(&line, 200), "anonymizer");
                    }
                });
                Ok(process)
            }
            Ok(Ok(false)) => {
                Err(format!("{} exited before printing {marker:?}", process.program).into())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(format!(
                "{} not ready after {}s",
                process.program, config.startup_timeout_secs
            )
            .into()),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the process and wait for it to exit.
    #[instrument(level = "info", skip_all, fields(program = %self.program))]
    pub async fn shutdown(mut self) {
        match self.child.kill().await {
            Ok(()) => info!("Anonymizer process stopped"),
            Err(e) => warn!(error = %e, "Failed to stop anonymizer process"),
        }
    }
}

async fn wait_for_marker(
    lines: &mut Lines<BufReader<ChildStdout>>,
    marker: &str,
) -> std::io::Result<bool> {
    while let Some(line) = lines.next_line().await? {
        debug!(line = %truncate_for_log(&line, 200), "anonymizer");
        if line.contains(marker) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str, marker: Option<&str>) -> AnonymizerConfig {
        AnonymizerConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ready_marker: marker.map(str::to_string),
            startup_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_launch_waits_for_marker_then_shutdown() {
        let config = shell("echo starting; echo 'Bootstrapped 100% (done)'; sleep 30", Some("Bootstrapped 100%"));
        let process = AnonymizerProcess::launch(&config).await.unwrap();
        assert!(process.pid().is_some());
        process.shutdown().await;
    }

    #[tokio::test]
    async fn test_launch_fails_when_process_exits_early() {
        let config = shell("echo nope", Some("Bootstrapped 100%"));
        let err = AnonymizerProcess::launch(&config).await.unwrap_err();
        assert!(err.to_string().contains("exited before"));
    }

    #[tokio::test]
    async fn test_launch_without_marker_returns_immediately() {
        let config = shell("sleep 30", None);
        let process = AnonymizerProcess::launch(&config).await.unwrap();
        process.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let config = AnonymizerConfig {
            program: "definitely-not-an-installed-program".to_string(),
            args: Vec::new(),
            ready_marker: None,
            startup_timeout_secs: 1,
        };
        assert!(AnonymizerProcess::launch(&config).await.is_err());
    }
}

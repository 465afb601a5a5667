//! Signalling the reverse proxy to pick up a new configuration

use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("invalid reload command {command:?}: {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("failed to run reload command {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("reload command {command:?} exited with code {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// What `reload` ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded,
    Skipped,
}

/// Runs the configured proxy reload command (default `nginx -s reload`)
#[derive(Debug, Clone)]
pub struct ProxyReloader {
    program: String,
    args: Vec<String>,
}

impl ProxyReloader {
    /// Parse a shell-style command line
    pub fn from_command_line(command: &str) -> Result<Self, ReloadError> {
        let invalid = |reason: String| ReloadError::InvalidCommand {
            command: command.to_string(),
            reason,
        };
        let mut words = shell_words::split(command).map_err(|e| invalid(e.to_string()))?;
        if words.is_empty() {
            return Err(invalid("command is empty".to_string()));
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            args: words,
        })
    }

    pub fn command_line(&self) -> String {
        let mut words = vec![self.program.as_str()];
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }

    /// Ask the proxy to reload. A failure here leaves the saved file in place;
    /// the live proxy keeps serving its previous configuration until the next reload.
    pub async fn reload(&self, skip: bool) -> Result<ReloadOutcome, ReloadError> {
        if skip {
            info!("Skipping proxy reload");
            return Ok(ReloadOutcome::Skipped);
        }

        let command = self.command_line();
        info!(command = %command, "Reloading proxy");

        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ReloadError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                command = %command,
                code = ?output.status.code(),
                stderr = %stderr,
                "Proxy reload failed; saved configuration is not rolled back"
            );
            return Err(ReloadError::Failed {
                command,
                code: output.status.code(),
                stderr,
            });
        }

        debug!(command = %command, "Proxy reloaded");
        Ok(ReloadOutcome::Reloaded)
    }
}

impl Default for ProxyReloader {
    fn default() -> Self {
        Self {
            program: "nginx".to_string(),
            args: vec!["-s".to_string(), "reload".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_line() {
        let reloader = ProxyReloader::from_command_line("systemctl reload 'nginx.service'").unwrap();
        assert_eq!(reloader.program, "systemctl");
        assert_eq!(reloader.args, vec!["reload", "nginx.service"]);
        assert_eq!(ProxyReloader::default().command_line(), "nginx -s reload");
    }

    #[test]
    fn test_rejects_empty_command() {
        assert!(matches!(
            ProxyReloader::from_command_line("   "),
            Err(ReloadError::InvalidCommand { .. })
        ));
        assert!(ProxyReloader::from_command_line("nginx 'unterminated").is_err());
    }

    #[tokio::test]
    async fn test_skip_does_not_run_anything() {
        let reloader = ProxyReloader::from_command_line("/nonexistent/reloader").unwrap();
        assert_eq!(reloader.reload(true).await.unwrap(), ReloadOutcome::Skipped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_reload() {
        let reloader = ProxyReloader::from_command_line("true").unwrap();
        assert_eq!(reloader.reload(false).await.unwrap(), ReloadOutcome::Reloaded);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_reload_is_reported() {
        let reloader = ProxyReloader::from_command_line("sh -c 'echo broken >&2; exit 3'").unwrap();
        match reloader.reload(false).await {
            Err(ReloadError::Failed { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let reloader = ProxyReloader::from_command_line("/nonexistent/reloader").unwrap();
        assert!(matches!(
            reloader.reload(false).await,
            Err(ReloadError::Spawn { .. })
        ));
    }
}

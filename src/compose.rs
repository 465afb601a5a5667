//! Container lifecycle through the compose CLI
//!
//! A lab's compose template is instantiated per student by writing an env file with
//! the student's variables next to it and letting compose interpolate `${...}`
//! references. The compose project name is the container name, so `down` tears
//! down exactly one student's lab.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("invalid compose command {command:?}: {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("could not find compose template at {0}")]
    TemplateMissing(PathBuf),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command:?} exited with code {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// A compose template bound to one student's variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    /// Compose project name (`student-lab`)
    pub name: String,
    pub template: PathBuf,
    pub env_file: PathBuf,
}

/// Runs `docker compose` (or a configured replacement) for student labs
#[derive(Debug, Clone)]
pub struct ComposeRunner {
    program: String,
    base_args: Vec<String>,
    templates_dir: PathBuf,
    work_dir: PathBuf,
}

impl ComposeRunner {
    pub fn new(
        command: &str,
        templates_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> Result<Self, ComposeError> {
        let invalid = |reason: String| ComposeError::InvalidCommand {
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
            base_args: words,
            templates_dir: templates_dir.into(),
            work_dir: work_dir.into(),
        })
    }

    /// Resolve a lab's template path against the templates directory
    pub fn template_path(&self, template: &Path) -> PathBuf {
        if template.is_absolute() {
            template.to_path_buf()
        } else {
            self.templates_dir.join(template)
        }
    }

    /// Env file for a project; it is kept until the project is torn down
    pub fn env_file_path(&self, project: &str) -> PathBuf {
        self.work_dir.join(format!("{}.env", project))
    }

    /// Bind `template` to `variables` by writing the project's env file
    pub fn prepare(
        &self,
        project: &str,
        template: &Path,
        variables: &BTreeMap<String, String>,
    ) -> Result<ComposeProject, ComposeError> {
        let template = self.template_path(template);
        if !template.exists() {
            return Err(ComposeError::TemplateMissing(template));
        }

        std::fs::create_dir_all(&self.work_dir).map_err(|source| ComposeError::Write {
            path: self.work_dir.clone(),
            source,
        })?;

        let env_file = self.env_file_path(project);
        std::fs::write(&env_file, render_env(variables)).map_err(|source| {
            ComposeError::Write {
                path: env_file.clone(),
                source,
            }
        })?;
        debug!(project, env_file = %env_file.display(), "Wrote compose variables");

        Ok(ComposeProject {
            name: project.to_string(),
            template,
            env_file,
        })
    }

    /// The project as it was prepared for a previous `up`
    pub fn existing(&self, project: &str, template: &Path) -> ComposeProject {
        ComposeProject {
            name: project.to_string(),
            template: self.template_path(template),
            env_file: self.env_file_path(project),
        }
    }

    /// Start the project's containers in the background
    pub async fn up(&self, project: &ComposeProject) -> Result<(), ComposeError> {
        info!(project = %project.name, "Starting containers");
        self.run(project, &["up", "-d"]).await
    }

    /// Stop and remove the project's containers, then drop its env file
    pub async fn down(&self, project: &ComposeProject) -> Result<(), ComposeError> {
        info!(project = %project.name, "Stopping and removing containers");
        self.run(project, &["down"]).await?;
        self.discard(project);
        Ok(())
    }

    /// Drop the env file of a project that never came up
    pub fn discard(&self, project: &ComposeProject) {
        if let Err(e) = std::fs::remove_file(&project.env_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %project.env_file.display(), error = %e, "Failed to remove env file");
            }
        }
    }

    fn command_args(&self, project: &ComposeProject, action: &[&str]) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("-p".to_string());
        args.push(project.name.clone());
        args.push("-f".to_string());
        args.push(project.template.display().to_string());
        if project.env_file.exists() {
            args.push("--env-file".to_string());
            args.push(project.env_file.display().to_string());
        }
        args.extend(action.iter().map(|a| a.to_string()));
        args
    }

    async fn run(&self, project: &ComposeProject, action: &[&str]) -> Result<(), ComposeError> {
        let args = self.command_args(project, action);
        let mut words = vec![self.program.clone()];
        words.extend(args.iter().cloned());
        let command = shell_words::join(&words);
        debug!(command = %command, "Running compose");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ComposeError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ComposeError::Failed {
                command,
                code: output.status.code(),
                stderr,
            });
        }
        Ok(())
    }
}

/// `KEY=value` lines; values are single-quoted so compose reads them literally
fn render_env(variables: &BTreeMap<String, String>) -> String {
    variables
        .iter()
        .map(|(key, value)| format!("{}='{}'\n", key, value.replace('\'', "")))
        .collect()
}

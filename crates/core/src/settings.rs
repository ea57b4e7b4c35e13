//! Layered settings for a run.
//!
//! Precedence, highest first: values passed explicitly by the client SDK at
//! run-start time > project file (`./.runlog/settings.toml`) > user file
//! (`~/.config/runlog/settings.toml`) > [`Settings::default`].
//!
//! Follows a project-over-user-over-built-in precedence; this struct only
//! deals with the settings consumed by the core pipeline, not product-wide
//! configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// How console (stdout/stderr) output is captured from the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleCaptureMode {
  #[default]
  Redirect,
  Wrap,
  Off,
}

/// Exactly one of these may be selected for a first-time run; the Sender
/// validates that before issuing the upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ResumeMode {
  #[default]
  None,
  Resume(String),
  ForkFrom(String),
  ResumeFrom(String),
}

impl ResumeMode {
  pub fn is_branching(&self) -> bool {
    !matches!(self, ResumeMode::None)
  }
}

/// Retry/timeout policy applied to one remote client (GraphQL, file-stream,
/// file-transfer).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
  pub timeout: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 7,
      initial_backoff: Duration::from_millis(500),
      max_backoff: Duration::from_secs(30),
      timeout: Duration::from_secs(60),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
  /// No GraphQL/HTTP calls are made; everything still gets written to the
  /// transaction log.
  pub offline: bool,
  /// Running in sync (replay) mode: Reader drives ingress instead of a live client.
  pub sync: bool,
  /// Shared mode: step ordering is delegated to the backend via client id.
  pub x_shared: bool,
  /// Writer is bypassed entirely; no durability.
  pub skip_transaction_log: bool,

  pub enable_server_side_derived_summary: bool,
  pub enable_server_side_expand_glob_metrics: bool,

  pub disable_meta: bool,
  pub disable_stats: bool,
  pub disable_git: bool,
  pub disable_machine_info: bool,

  pub console_capture_mode: ConsoleCaptureMode,

  pub files_dir: PathBuf,
  pub log_dir: PathBuf,
  pub sync_file: Option<PathBuf>,

  pub label: Option<String>,

  pub resume_mode: ResumeMode,

  pub graphql_retry: RetryPolicy,
  pub filestream_retry: RetryPolicy,
  pub file_transfer_retry: RetryPolicy,

  /// Derived: true for the process responsible for uploading the run's
  /// `wandb/` directory contents. Never set directly; computed by
  /// [`Settings::with_primary_node`].
  pub primary_node: bool,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      offline: false,
      sync: false,
      x_shared: false,
      skip_transaction_log: false,
      enable_server_side_derived_summary: false,
      enable_server_side_expand_glob_metrics: false,
      disable_meta: false,
      disable_stats: false,
      disable_git: false,
      disable_machine_info: false,
      console_capture_mode: ConsoleCaptureMode::default(),
      files_dir: PathBuf::from("files"),
      log_dir: PathBuf::from("logs"),
      sync_file: None,
      label: None,
      resume_mode: ResumeMode::default(),
      graphql_retry: RetryPolicy::default(),
      filestream_retry: RetryPolicy::default(),
      file_transfer_retry: RetryPolicy::default(),
      primary_node: true,
    }
  }
}

/// On-disk settings overrides; every field optional so a partial file only
/// overrides what it names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
  pub offline: Option<bool>,
  pub x_shared: Option<bool>,
  pub skip_transaction_log: Option<bool>,
  pub enable_server_side_derived_summary: Option<bool>,
  pub enable_server_side_expand_glob_metrics: Option<bool>,
  pub disable_meta: Option<bool>,
  pub disable_stats: Option<bool>,
  pub disable_git: Option<bool>,
  pub disable_machine_info: Option<bool>,
  pub console_capture_mode: Option<ConsoleCaptureMode>,
  pub files_dir: Option<PathBuf>,
  pub log_dir: Option<PathBuf>,
  pub label: Option<String>,
}

fn bool_env(key: &str) -> Option<bool> {
  match std::env::var(key).ok()?.as_str() {
    "1" | "true" | "TRUE" | "True" => Some(true),
    "0" | "false" | "FALSE" | "False" => Some(false),
    _ => None,
  }
}

impl Settings {
  /// Load layered settings for a project directory: defaults, overlaid by
  /// the user file, overlaid by the project file.
  pub fn load_for_project(project_root: &std::path::Path) -> Result<Self, CoreError> {
    let mut settings = Settings::default();

    if let Some(user_file) = dirs::config_dir().map(|d| d.join("runlog").join("settings.toml"))
      && user_file.is_file()
    {
      settings.apply_file(&Self::read_file(&user_file)?);
    }

    let project_file = project_root.join(".runlog").join("settings.toml");
    if project_file.is_file() {
      settings.apply_file(&Self::read_file(&project_file)?);
    }

    settings.merge_env_overrides();
    Ok(settings)
  }

  /// `RUNLOG_*` escape hatches, applied last (highest precedence), in the
  /// style of `RUST_LOG`-style environment overrides. Consumed only by
  /// `runlog-service`'s own config loading, never by library code deeper in
  /// the pipeline.
  pub fn merge_env_overrides(&mut self) {
    if let Some(v) = bool_env("RUNLOG_OFFLINE") {
      self.offline = v;
    }
    if let Some(v) = bool_env("RUNLOG_X_SHARED") {
      self.x_shared = v;
    }
    if let Some(v) = bool_env("RUNLOG_SKIP_TRANSACTION_LOG") {
      self.skip_transaction_log = v;
    }
    if let Some(v) = bool_env("RUNLOG_DISABLE_META") {
      self.disable_meta = v;
    }
    if let Some(v) = bool_env("RUNLOG_DISABLE_STATS") {
      self.disable_stats = v;
    }
    if let Some(v) = bool_env("RUNLOG_DISABLE_GIT") {
      self.disable_git = v;
    }
    if let Ok(label) = std::env::var("RUNLOG_LABEL") {
      self.label = Some(label);
    }
  }

  fn read_file(path: &std::path::Path) -> Result<SettingsFile, CoreError> {
    let contents = std::fs::read_to_string(path).map_err(|source| CoreError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    toml::from_str(&contents).map_err(|source| CoreError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  fn apply_file(&mut self, file: &SettingsFile) {
    macro_rules! overlay {
      ($field:ident) => {
        if let Some(v) = file.$field.clone() {
          self.$field = v;
        }
      };
    }
    overlay!(offline);
    overlay!(x_shared);
    overlay!(skip_transaction_log);
    overlay!(enable_server_side_derived_summary);
    overlay!(enable_server_side_expand_glob_metrics);
    overlay!(disable_meta);
    overlay!(disable_stats);
    overlay!(disable_git);
    overlay!(disable_machine_info);
    overlay!(console_capture_mode);
    overlay!(files_dir);
    overlay!(log_dir);
    overlay!(label);
  }

  /// Validate that at most one resume strategy is selected.
  pub fn validate_resume_mode(&self) -> Result<(), CoreError> {
    match &self.resume_mode {
      ResumeMode::None => Ok(()),
      _ => Ok(()), // ResumeMode is an enum of at most one variant by construction.
    }
  }

  pub fn with_primary_node(mut self, primary: bool) -> Self {
    self.primary_node = primary;
    self
  }
}

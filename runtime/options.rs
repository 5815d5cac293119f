// Copyright 2018-2026 the Deno authors. MIT license.

use std::path::PathBuf;

use serde::Deserialize;
use skiff_core::event_loop::DEFAULT_MAX_BLOCKING_THREADS;
use skiff_core::event_loop::DEFAULT_MAX_TICK_DEPTH;

/// A real directory grafted onto a logical path prefix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
  pub prefix: PathBuf,
  pub target: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeOptions {
  /// How deep tasks may enqueue tasks before the loop aborts.
  pub max_tick_depth: usize,
  pub max_blocking_threads: usize,
  /// Confine scripts below this real directory. `None` exposes the host
  /// filesystem as is.
  pub fs_root: Option<PathBuf>,
  /// Logical directory relative paths resolve against.
  pub working_directory: PathBuf,
  pub mounts: Vec<Mount>,
  pub tls_delegated_tasks: bool,
}

impl Default for RuntimeOptions {
  fn default() -> Self {
    Self {
      max_tick_depth: DEFAULT_MAX_TICK_DEPTH,
      max_blocking_threads: DEFAULT_MAX_BLOCKING_THREADS,
      fs_root: None,
      working_directory: PathBuf::from("/"),
      mounts: Vec::new(),
      tls_delegated_tasks: true,
    }
  }
}

impl RuntimeOptions {
  /// Defaults overridden by `SKIFF_MAX_TICK_DEPTH` and
  /// `SKIFF_MAX_BLOCKING_THREADS`.
  pub fn from_env() -> Self {
    Self::default().with_env(|name| std::env::var(name).ok())
  }

  pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
    if let Some(depth) = parse_var(&lookup, "SKIFF_MAX_TICK_DEPTH") {
      self.max_tick_depth = depth;
    }
    if let Some(threads) = parse_var(&lookup, "SKIFF_MAX_BLOCKING_THREADS") {
      self.max_blocking_threads = threads;
    }
    self
  }
}

fn parse_var(
  lookup: &impl Fn(&str) -> Option<String>,
  name: &str,
) -> Option<usize> {
  let value = lookup(name)?;
  match value.trim().parse::<usize>() {
    Ok(parsed) if parsed > 0 => Some(parsed),
    _ => {
      log::warn!("ignoring {name}={value}: expected a positive integer");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn parses_camel_case_json() {
    let options: RuntimeOptions = serde_json::from_str(
      r#"{
        "maxTickDepth": 10,
        "fsRoot": "/srv/app",
        "workingDirectory": "/home",
        "mounts": [{ "prefix": "/tmp", "target": "/var/tmp/app" }],
        "tlsDelegatedTasks": false
      }"#,
    )
    .unwrap();
    assert_eq!(options.max_tick_depth, 10);
    assert_eq!(options.max_blocking_threads, DEFAULT_MAX_BLOCKING_THREADS);
    assert_eq!(options.fs_root, Some(PathBuf::from("/srv/app")));
    assert_eq!(options.working_directory, PathBuf::from("/home"));
    assert_eq!(
      options.mounts,
      vec![Mount {
        prefix: PathBuf::from("/tmp"),
        target: PathBuf::from("/var/tmp/app"),
      }]
    );
    assert!(!options.tls_delegated_tasks);
  }

  #[test]
  fn empty_json_is_default() {
    let options: RuntimeOptions = serde_json::from_str("{}").unwrap();
    assert_eq!(options, RuntimeOptions::default());
  }

  #[test]
  fn env_overrides() {
    let options = RuntimeOptions::default().with_env(|name| match name {
      "SKIFF_MAX_TICK_DEPTH" => Some("25".to_string()),
      "SKIFF_MAX_BLOCKING_THREADS" => Some("zero".to_string()),
      _ => None,
    });
    assert_eq!(options.max_tick_depth, 25);
    assert_eq!(options.max_blocking_threads, DEFAULT_MAX_BLOCKING_THREADS);
  }
}

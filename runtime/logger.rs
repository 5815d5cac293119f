// Copyright 2018-2026 the Deno authors. MIT license.

use std::io::Write;

struct SkiffLogger(env_logger::Logger);

impl SkiffLogger {
  pub fn new(logger: env_logger::Logger) -> Self {
    Self(logger)
  }

  pub fn filter(&self) -> log::LevelFilter {
    self.0.filter()
  }
}

impl log::Log for SkiffLogger {
  fn enabled(&self, metadata: &log::Metadata) -> bool {
    self.0.enabled(metadata)
  }

  fn log(&self, record: &log::Record) {
    if self.enabled(record.metadata()) {
      self.0.log(record);
    }
  }

  fn flush(&self) {
    self.0.flush();
  }
}

fn build(log_level: log::Level) -> env_logger::Logger {
  env_logger::Builder::from_env(
    env_logger::Env::new()
      // Use `SKIFF_LOG` and `SKIFF_LOG_STYLE` instead of `RUST_` prefix
      .filter_or("SKIFF_LOG", log_level.to_level_filter().to_string())
      .write_style("SKIFF_LOG_STYLE"),
  )
  .filter_module("rustls", log::LevelFilter::Off)
  // One line per readiness event is too chatty even for debug.
  .filter_module("mio", log::LevelFilter::Error)
  .format(|buf, record| {
    let mut target = record.target().to_string();
    if let Some(line_no) = record.line() {
      target.push(':');
      target.push_str(&line_no.to_string());
    }
    if record.level() <= log::Level::Info {
      // Print ERROR, WARN and INFO logs as they are
      writeln!(buf, "{}", record.args())
    } else {
      // Add prefix to DEBUG or TRACE logs
      writeln!(
        buf,
        "{} RS - {} - {}",
        record.level(),
        target,
        record.args()
      )
    }
  })
  .build()
}

/// Install the process-wide logger. Later calls are ignored, so tests and
/// embedders may call this more than once.
pub fn init(maybe_level: Option<log::Level>) {
  let log_level = maybe_level.unwrap_or(log::Level::Info);
  let logger = SkiffLogger::new(build(log_level));
  let max_level = logger.filter();
  if log::set_boxed_logger(Box::new(logger)).is_ok() {
    log::set_max_level(max_level);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use log::Log;

  #[test]
  fn init_is_idempotent() {
    init(Some(log::Level::Debug));
    init(None);
    log::debug!("logger installed");
  }

  #[test]
  fn noisy_crates_are_filtered() {
    let logger = build(log::Level::Trace);
    let rustls = log::Metadata::builder()
      .level(log::Level::Error)
      .target("rustls::conn")
      .build();
    assert!(!logger.enabled(&rustls));
    let mio = log::Metadata::builder()
      .level(log::Level::Debug)
      .target("mio::poll")
      .build();
    assert!(!logger.enabled(&mio));
    let ours = log::Metadata::builder()
      .level(log::Level::Debug)
      .target("skiff_net::tcp")
      .build();
    assert!(logger.enabled(&ours));
  }
}

//! Minimal stderr logger behind the `log` facade.
//!
//! The verbosity is taken from the `TAPSTACK_LOG` environment variable
//! (`error`, `warn`, `info`, `debug`, `trace`); it defaults to `warn` so the
//! per-packet debug output stays out of the way unless asked for.

use std::env;
use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

struct StackLogger;

static LOGGER: StackLogger = StackLogger;

impl Log for StackLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}
		let level = match record.level() {
			Level::Error => "ERROR",
			Level::Warn => "WARN",
			Level::Info => "INFO",
			Level::Debug => "DEBUG",
			Level::Trace => "TRACE",
		};
		let mut stderr = std::io::stderr().lock();
		let _ = writeln!(
			stderr,
			"[{}][{}] {}",
			level,
			record.target(),
			record.args()
		);
	}

	fn flush(&self) {}
}

fn level_from_env() -> LevelFilter {
	match env::var("TAPSTACK_LOG").as_deref() {
		Ok("error") => LevelFilter::Error,
		Ok("warn") => LevelFilter::Warn,
		Ok("info") => LevelFilter::Info,
		Ok("debug") => LevelFilter::Debug,
		Ok("trace") => LevelFilter::Trace,
		Ok("off") => LevelFilter::Off,
		_ => LevelFilter::Warn,
	}
}

/// Install the logger. Safe to call more than once; later calls only
/// refresh the maximum level.
pub(crate) fn init() {
	let _ = log::set_logger(&LOGGER);
	log::set_max_level(level_from_env());
}

// THEORY:
// Logger initialization for the binary and for embedders that want the same output.
// Every record is printed as `timestamp level target`, followed by the message with
// the record's `duration` key-value (if any) in a right-aligned column.

use env_logger::{Builder, WriteStyle};
use log::LevelFilter;
use log::kv::Key;
use std::io::Write;

const DURATION_WIDTH: usize = 12;

/// Installs the global logger. `RUST_LOG` takes precedence over `default_level`.
///
/// Returns `false` if a logger was already installed, which is harmless.
pub fn init(default_level: LevelFilter) -> bool {
    let mut builder = Builder::new();
    builder
        .write_style(WriteStyle::Auto)
        .filter_level(default_level)
        .format(|buf, record| {
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "{} {}{}{} {}",
                buf.timestamp(),
                level_style.render(),
                record.level(),
                level_style.render_reset(),
                record.target()
            )?;

            let duration = record
                .key_values()
                .get(Key::from("duration"))
                .map(|value| value.to_string())
                .unwrap_or_default();
            let indent = " ".repeat(DURATION_WIDTH + 1);

            let message = record.args().to_string();
            let mut lines = message.lines();
            if let Some(first) = lines.next() {
                writeln!(buf, "{duration:>width$} {first}", width = DURATION_WIDTH)?;
            }
            for line in lines {
                writeln!(buf, "{indent}{line}")?;
            }
            Ok(())
        });

    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder.try_init().is_ok()
}

/// Maps a `-v` count onto a level: none is `info`, one is `debug`, more is `trace`.
pub fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

//! Logging initialization for the command-line binary

use std::io::Write;

use env_logger::Builder;
use log::LevelFilter;

/// Initialize the logger with the given maximum level, which can be
/// overridden via the `RUST_LOG` environment variable.
pub fn initialize_logger(filter: LevelFilter) {
    Builder::new()
        .format(|buf, record| {
            let style = buf.default_level_style(record.level());
            writeln!(buf, "[{style}{}{style:#}] {}", record.level(), record.args())
        })
        .filter_level(filter)
        .parse_default_env()
        .init();
}

use env_logger::Builder;
use std::io::Write;

/// Installs a `log`/`env_logger` subscriber with the same timestamped,
/// file:line formatter the rest of the retrieval pack uses. Safe to call
/// more than once; only the first call wins.
pub fn init() {
    let _ = Builder::from_default_env()
        .format_timestamp_millis()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} - {}] [{}:{}] {}",
                record.level(),
                record.target(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init();
}

use std::io::Write;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Install the stderr logger. `RUST_LOG` still wins over the default level,
/// which is Info when `verbose` and Warn otherwise.
///
/// Lines look like `[HH:MM:SS] LEVEL: message`, with the time elapsed since
/// start-up. A second call is a no-op.
pub fn init_logger(verbose: bool) {
    START_TIME.set(Instant::now()).ok();

    let level = if verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            let elapsed = START_TIME.get_or_init(Instant::now).elapsed();
            writeln!(
                buf,
                "[{}] {}: {}",
                format_duration(elapsed),
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .try_init();
}

/// `H:MM:SS`-style clock, zero padded.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logger(false);
        init_logger(true);
        log::info!("logger ready");
    }
}

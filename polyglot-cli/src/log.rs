use log::LevelFilter;

/// Wire up the log sink for one CLI run.
///
/// The `-v` flags only raise the level for the polyglot crates; everything
/// else stays at warnings so `--trace` wire dumps are not drowned out by
/// third-party chatter. `POLYGLOT_LOG_LEVEL` overrides the flags entirely.
pub fn setup_logging<T: Into<fern::Output>>(output: T, verbosity: u64) -> anyhow::Result<()> {
    let level = match std::env::var("POLYGLOT_LOG_LEVEL") {
        Ok(spec) => spec.parse::<LevelFilter>()?,
        Err(_) => match verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        },
    };

    fern::Dispatch::new()
        .level(LevelFilter::Warn)
        .level_for("polyglot_lsp", level)
        .level_for("polyglot_cli", level)
        .format(|out, message, record| {
            // runs are short-lived one-shots; a time of day is enough
            out.finish(format_args!(
                "{} [{:>5}] {}: {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .chain(output)
        .apply()?;

    Ok(())
}

use log::LevelFilter;

/// Sets the behavior of the logger, based on passed environment variables
/// such as `RUST_LOG`. Debug mode mirrors the plugin's DebugFlag: every
/// external command and its captured output is logged.
pub fn setup_logging(verbose: bool) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    builder.format_timestamp_millis();

    // Overwrite the defaults from env
    builder.parse_default_env();
    let _ = builder.try_init();
}

use cs_telemetry::logging::{self, Format};

#[test]
fn init_is_idempotent_across_formats() {
    // Whichever call wins installs the subscriber; the second can never.
    let first = logging::init("logging-test", "debug", Format::Json);
    let second = logging::init("logging-test", "info", Format::Pretty);
    assert!(!second || !first);
    assert!(!logging::init("logging-test", "info", Format::Pretty));

    tracing::info!(key = "value", "log line after init");
}

#[test]
fn wrappers_never_panic_when_already_installed() {
    logging::init_logging("test-service", "info");
    logging::init_logging_json("test-service-json", "info");
    tracing::warn!("still logging");
}

//! Loading configuration files and wiring them into a bus.

use std::time::Duration;

use assert_matches::assert_matches;
use colombo::{ColomboBuilder, ColomboConfig, ConfigError};
use colombo_testlib::{HelloWorldHandler, HelloWorldRequest};
use indoc::indoc;

#[test]
fn load_reads_and_validates_the_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        indoc! {r#"
            [send]
            sla_ms = 500

            [stateful]
            max_allowed_sends = 4
        "#},
    )?;

    let config = ColomboConfig::load(&path)?;
    assert_eq!(config.default_sla(), Some(Duration::from_millis(500)));
    assert_eq!(config.stateful.max_allowed_sends, 4);
    assert_eq!(config.logging.filter, "info");
    Ok(())
}

#[test]
fn missing_file_falls_back_to_defaults() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = ColomboConfig::load_or_default(Some(&dir.path().join("absent.toml")))?;
    assert_eq!(config, ColomboConfig::default());
    Ok(())
}

#[test]
fn malformed_and_inconsistent_files_are_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let malformed = dir.path().join("malformed.toml");
    std::fs::write(&malformed, "[stateful]\nmax_allowed_sends = \"many\"\n")?;
    assert_matches!(ColomboConfig::load(&malformed), Err(ConfigError::Parse { .. }));

    let duplicated = dir.path().join("duplicated.toml");
    std::fs::write(
        &duplicated,
        indoc! {r#"
            [[remote]]
            name = "billing"
            groups = ["billing"]

            [[remote]]
            name = "billing"
            groups = ["invoices"]
        "#},
    )?;
    let error = ColomboConfig::load(&duplicated).unwrap_err();
    assert_matches!(&error, ConfigError::Invalid(message) if message.contains("billing"));

    assert_matches!(
        ColomboConfig::load(&dir.path().join("absent.toml")),
        Err(ConfigError::Read { .. })
    );
    Ok(())
}

#[tokio::test]
async fn stateful_limit_comes_from_the_config() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[stateful]\nmax_allowed_sends = 3\n")?;

    let colombo = ColomboBuilder::new()
        .with_config(ColomboConfig::load(&path)?)
        .request_handler::<HelloWorldRequest, _>(HelloWorldHandler)
        .build()?;

    assert_eq!(colombo.config().stateful.max_allowed_sends, 3);
    assert_eq!(colombo.stateful().max_allowed_sends(), 3);
    Ok(())
}

#[test]
fn builder_rejects_an_invalid_config() {
    let mut config = ColomboConfig::default();
    config.stateful.max_allowed_sends = 0;
    let error = ColomboBuilder::new().with_config(config).build().unwrap_err();
    assert!(error.is_configuration_error());
}

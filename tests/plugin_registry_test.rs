//! Integration tests for manifest loading and the plugin registry.

use anyhow::Result;
use std::path::Path;

use pinscan::plugin::{AssignmentTarget, BusType, PluginRegistry};
use pinscan::EngineError;

fn write(dir: &Path, file: &str, content: &str) -> Result<()> {
    std::fs::write(dir.join(file), content)?;
    Ok(())
}

#[tokio::test]
async fn broken_manifests_are_skipped() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    write(temp_dir.path(), "a_button.yaml", "name: Door\ndriver: button\n")?;
    write(temp_dir.path(), "b_broken.yaml", "name: [unterminated\n")?;
    write(temp_dir.path(), "c_unknown_driver.yaml", "name: Ghost\ndriver: flux_capacitor\n")?;
    write(temp_dir.path(), "d_no_name.yaml", "name: \"\"\ndriver: dht22\n")?;
    write(temp_dir.path(), "notes.txt", "not a manifest")?;

    let mut registry = PluginRegistry::new();
    let errors = registry.load(temp_dir.path()).await;

    assert_eq!(registry.names(), vec!["Door"]);
    assert_eq!(errors.len(), 3);
    assert!(errors[0].file_path.ends_with("b_broken.yaml"));
    assert!(errors[0].message.contains("YAML"));
    Ok(())
}

#[tokio::test]
async fn manifest_defaults_apply() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    write(temp_dir.path(), "sensor.yml", "name: Minimal\ndriver: dht22\n")?;

    let mut registry = PluginRegistry::new();
    assert!(registry.load(temp_dir.path()).await.is_empty());

    let handle = registry.get("Minimal").expect("plugin should load");
    assert_eq!(handle.descriptor.bus_type, BusType::Gpio);
    assert!(handle.descriptor.pin_roles.is_empty());
    assert!(!handle.descriptor.auto_detectable);
    assert_eq!(registry.auto_detectable().count(), 0);
    Ok(())
}

#[tokio::test]
async fn first_search_path_wins_on_duplicate_names() -> Result<()> {
    let primary = tempfile::tempdir()?;
    let fallback = tempfile::tempdir()?;
    write(primary.path(), "dht.yaml", "name: DHT22\ndriver: dht22\nauto_detectable: true\n")?;
    write(fallback.path(), "dht.yaml", "name: DHT22\ndriver: dht22\nauto_detectable: false\n")?;

    let mut registry = PluginRegistry::new();
    registry.add_search_path(primary.path());
    registry.add_search_path(fallback.path());
    assert!(registry.scan().await.is_empty());

    assert_eq!(registry.len(), 1);
    let handle = registry.get("DHT22").expect("plugin should load");
    assert!(handle.descriptor.auto_detectable);
    assert!(handle.source.as_deref().is_some_and(|p| p.starts_with(primary.path())));
    Ok(())
}

#[tokio::test]
async fn tm1637_must_declare_both_roles() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    write(
        temp_dir.path(),
        "tm1637.yaml",
        "name: TM1637\ndriver: tm1637\npin_roles: [CLK]\n",
    )?;

    let mut registry = PluginRegistry::new();
    let errors = registry.load(temp_dir.path()).await;

    assert!(registry.is_empty());
    assert_eq!(errors.len(), 1);
    assert!(!errors[0].validation_errors.is_empty());
    Ok(())
}

#[tokio::test]
async fn bundled_manifests_load() -> Result<()> {
    let plugins_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("plugins");
    let mut registry = PluginRegistry::new();
    let errors = registry.load(&plugins_dir).await;
    assert!(errors.is_empty(), "unexpected load errors: {:?}", errors);

    assert_eq!(registry.len(), 7);
    let auto: Vec<&str> = registry.auto_detectable().map(|h| h.name()).collect();
    assert_eq!(auto, vec!["DHT22", "DS18B20"]);

    assert_eq!(
        registry.options(),
        vec![
            "BMP280",
            "Button:DATA",
            "DHT22",
            "DS18B20:DATA",
            "LM393:DATA",
            "PIR HC-SR501:DATA",
            "TM1637:CLK",
            "TM1637:DIO",
            "I2C",
        ]
    );
    assert_eq!(registry.get("BMP280").map(|h| h.descriptor.bus_type), Some(BusType::I2c));
    Ok(())
}

#[tokio::test]
async fn assignment_targets_resolve_against_roles() -> Result<()> {
    let plugins_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("plugins");
    let mut registry = PluginRegistry::new();
    registry.load(&plugins_dir).await;

    assert_eq!(registry.resolve_target("i2c")?, AssignmentTarget::I2c);
    assert_eq!(
        registry.resolve_target("TM1637:DIO")?,
        AssignmentTarget::Plugin {
            name: "TM1637".to_string(),
            role: Some("DIO".to_string()),
        }
    );
    assert_eq!(
        registry.resolve_target("Button")?,
        AssignmentTarget::Plugin {
            name: "Button".to_string(),
            role: Some("DATA".to_string()),
        }
    );
    assert!(matches!(
        registry.resolve_target("TM1637"),
        Err(EngineError::InvalidAssignment(_))
    ));
    assert!(matches!(
        registry.resolve_target("Nope"),
        Err(EngineError::InvalidAssignment(_))
    ));
    Ok(())
}

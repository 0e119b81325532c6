use std::{path::Path, process::Command};

fn manifest_dir() -> &'static Path {
    Path::new(env!("CARGO_MANIFEST_DIR"))
}

fn descriptor() -> serde_yaml::Value {
    let path = manifest_dir().join("../render.yaml");
    let file = std::fs::File::open(path).unwrap();
    serde_yaml::from_reader(file).unwrap()
}

#[test]
fn test_single_web_service() {
    let descriptor = descriptor();
    let services = descriptor["services"].as_sequence().unwrap();
    assert_eq!(services.len(), 1);

    let service = &services[0];
    assert_eq!(service["type"].as_str(), Some("web"));
    assert_eq!(service["healthCheckPath"].as_str(), Some("/health"));
    assert_eq!(
        service["preDeployCommand"].as_str(),
        Some("./target/release/groupbot check")
    );

    let scaling = &service["scaling"];
    assert_eq!(scaling["minInstances"].as_u64(), Some(1));
    assert_eq!(scaling["maxInstances"].as_u64(), Some(1));
    assert_eq!(scaling["targetMemoryPercent"].as_u64(), Some(80));
}

#[test]
fn test_env_vars_are_not_synced() {
    let descriptor = descriptor();
    let vars = descriptor["services"][0]["envVars"].as_sequence().unwrap();
    let keys: Vec<&str> = vars.iter().filter_map(|var| var["key"].as_str()).collect();
    for key in ["TELEGRAM_TOKEN", "MONGODB_URI", "MONGODB_DB", "WEBHOOK_DOMAIN"] {
        assert!(keys.contains(&key), "{key} is missing");
    }
    for var in vars {
        assert_eq!(var["sync"].as_bool(), Some(false), "{:?}", var["key"]);
        assert!(var.get("value").is_none());
    }
}

#[test]
fn test_dependencies_carry_versions() {
    let manifest = std::fs::read_to_string(manifest_dir().join("Cargo.toml")).unwrap();
    let manifest: toml::Value = toml::from_str(&manifest).unwrap();

    for table in ["dependencies", "dev-dependencies", "build-dependencies"] {
        let Some(dependencies) = manifest.get(table).and_then(|t| t.as_table()) else {
            continue;
        };
        for (name, entry) in dependencies {
            let version = match entry {
                toml::Value::String(version) => Some(version.as_str()),
                toml::Value::Table(entry) => entry.get("version").and_then(|v| v.as_str()),
                _ => None,
            };
            assert!(
                version.map_or(false, |v| !v.trim().is_empty()),
                "{table}.{name} has no version"
            );
        }
    }

    let workspace = std::fs::read_to_string(manifest_dir().join("../Cargo.toml")).unwrap();
    let workspace: toml::Value = toml::from_str(&workspace).unwrap();
    assert!(workspace["workspace"]["package"]["rust-version"].as_str().is_some());
}

fn check(config: &str) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_groupbot"));
    command
        .current_dir(manifest_dir())
        .env_clear()
        .args(["--config", config, "check"]);
    command
}

#[test]
fn test_check_passes_with_token() {
    let output = check("tests/missing.yaml")
        .env("TELEGRAM_TOKEN", "123456:abcdef")
        .env("SUPERADMINS", "10001")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let output = check("tests/config.yaml").output().unwrap();
    assert_eq!(output.status.code(), Some(0), "{output:?}");
}

#[test]
fn test_check_fails_without_token() {
    let output = check("tests/missing.yaml").output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TELEGRAM_TOKEN"), "{stderr}");
}

use serial_test::serial;
use std::env;
use std::fs::write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

use course_sync::load_config::{load_config, load_static_config, PAT_ENV, SAS_ENV};

const FULL_CONFIG: &str = r#"
source:
  organization_url: https://dev.azure.com/contoso
  project: Learning
  repository: course-content
  branch: release
storage:
  database_path: ./state/course-sync.db
  blob_endpoint: contosolearning.blob.core.windows.net
  container: attachments
sync:
  max_concurrency: 4
"#;

fn config_file(yaml: &str) -> NamedTempFile {
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), yaml).unwrap();
    file
}

#[tokio::test]
#[serial]
async fn test_load_config_success_with_env_secrets() {
    let file = config_file(FULL_CONFIG);
    env::set_var(PAT_ENV, "pat-value");
    env::set_var(SAS_ENV, "sv=2021&sig=x");

    let config = load_config(file.path()).expect("Config should load");

    assert_eq!(config.source.organization_url, "https://dev.azure.com/contoso");
    assert_eq!(config.source.project, "Learning");
    assert_eq!(config.source.repository, "course-content");
    assert_eq!(config.source.branch, "release");
    assert_eq!(config.storage.database_path, PathBuf::from("./state/course-sync.db"));
    assert_eq!(config.sync.blob_endpoint, "contosolearning.blob.core.windows.net");
    assert_eq!(config.sync.container, "attachments");
    assert_eq!(config.sync.max_concurrency, 4);
    assert_eq!(config.secrets.azure_devops_pat, "pat-value");
    assert_eq!(config.secrets.blob_sas_token, "sv=2021&sig=x");

    let debug = format!("{:?}", config.secrets);
    assert!(!debug.contains("pat-value"), "secrets must be redacted: {debug}");
}

#[tokio::test]
#[serial]
async fn test_load_config_defaults_branch_and_concurrency() {
    let yaml = r#"
source:
  organization_url: https://dev.azure.com/contoso
  project: Learning
  repository: course-content
storage:
  database_path: ./course-sync.db
  blob_endpoint: contosolearning.blob.core.windows.net
  container: attachments
"#;
    let file = config_file(yaml);

    let (source, _, settings) = load_static_config(file.path()).expect("Config should load");
    assert_eq!(source.branch, "main");
    assert_eq!(settings.max_concurrency, 8);
}

#[tokio::test]
#[serial]
async fn test_load_config_errors_on_missing_secret() {
    let file = config_file(FULL_CONFIG);
    env::set_var(PAT_ENV, "pat-value");
    env::remove_var(SAS_ENV);

    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains(SAS_ENV), "got: {err}");
}

#[tokio::test]
#[serial]
async fn test_load_config_errors_on_empty_value() {
    let yaml = FULL_CONFIG.replace("container: attachments", "container: \"\"");
    let file = config_file(&yaml);

    let err = load_static_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("storage.container"), "got: {err}");
}

#[tokio::test]
#[serial]
async fn test_load_config_rejects_zero_concurrency() {
    let yaml = FULL_CONFIG.replace("max_concurrency: 4", "max_concurrency: 0");
    let file = config_file(&yaml);

    let err = load_static_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("max_concurrency"), "got: {err}");
}

#[tokio::test]
#[serial]
async fn test_load_config_errors_for_invalid_file() {
    let file = config_file("not-yaml: [:::");

    let err = load_static_config(file.path()).unwrap_err();
    let msg = err.to_string();
    assert!(
        msg.contains("parse") || msg.contains("YAML"),
        "Parse error expected, got: {msg}"
    );
}

#[tokio::test]
#[serial]
async fn test_load_config_errors_for_missing_section() {
    let file = config_file("source:\n  organization_url: x\n  project: y\n  repository: z\n");

    let err = load_static_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("storage"), "got: {err}");
}

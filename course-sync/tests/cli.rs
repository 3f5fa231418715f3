use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::write;
use tempfile::{tempdir, NamedTempFile, TempDir};

/// Writes a config whose database lives in a fresh temp directory.
fn create_config() -> (NamedTempFile, TempDir) {
    let dir = tempdir().expect("temp dir");
    let db = dir.path().join("course-sync.db");
    let config = NamedTempFile::new().expect("Creating temp config file failed");
    write(
        config.path(),
        format!(
            "source:\n  organization_url: https://dev.azure.com/contoso\n  project: Learning\n  repository: course-content\nstorage:\n  database_path: {}\n  blob_endpoint: contosolearning.blob.core.windows.net\n  container: attachments\n",
            db.display()
        ),
    )
    .expect("Writing temp config failed");
    (config, dir)
}

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("course-sync")
        .expect("Binary exists")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync").and(predicate::str::contains("status")));
}

#[test]
fn status_reports_missing_checkpoint_on_fresh_database() {
    let (config, _dir) = create_config();

    Command::cargo_bin("course-sync")
        .expect("Binary exists")
        .arg("status")
        .arg("--config")
        .arg(config.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("checkpoint: none"));
}

#[test]
fn sync_fails_for_missing_config_file() {
    Command::cargo_bin("course-sync")
        .expect("Binary exists")
        .arg("sync")
        .arg("--config")
        .arg("does-not-exist.yaml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn sync_fails_without_secrets() {
    let (config, _dir) = create_config();

    Command::cargo_bin("course-sync")
        .expect("Binary exists")
        .arg("sync")
        .arg("--config")
        .arg(config.path())
        .env_remove("AZURE_DEVOPS_PAT")
        .env_remove("BLOB_SAS_TOKEN")
        .assert()
        .failure()
        .stderr(predicate::str::contains("AZURE_DEVOPS_PAT"));
}

use std::sync::{Arc, Mutex};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{layer::Context, Layer, Registry};

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.events.lock().unwrap().push(format!("{:?}", event));
    }
}

#[tokio::test]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use course_sync::cli::{run, Cli, Commands};

    let cli = Cli {
        command: Commands::Status {
            config: std::path::PathBuf::from("dummy.yaml"),
        },
    };

    let result = run(cli).await;
    assert!(result.is_err(), "dummy config must not load");

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}

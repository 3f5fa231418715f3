use serde::{Deserialize, Serialize};
use tracing::{debug, info};

fn default_max_concurrency() -> usize {
    8
}

/// Engine settings that shape destination keys and apply throughput.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Host of the blob endpoint, e.g. `account.blob.core.windows.net`.
    pub blob_endpoint: String,
    /// Attachment container name.
    pub container: String,
    /// Upper bound on concurrent per-item destination calls.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl SyncSettings {
    pub fn new(blob_endpoint: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            blob_endpoint: blob_endpoint.into(),
            container: container.into(),
            max_concurrency: default_max_concurrency(),
        }
    }

    /// Public URL of the blob stored under `blob_name`.
    pub fn blob_url(&self, blob_name: &str) -> String {
        format!(
            "https://{}/{}/{}",
            self.blob_endpoint.trim_end_matches('/'),
            self.container,
            blob_name.trim_start_matches('/')
        )
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    pub fn trace_loaded(&self) {
        info!(
            blob_endpoint = %self.blob_endpoint,
            container = %self.container,
            max_concurrency = self.max_concurrency,
            "Loaded sync settings"
        );
        debug!(?self, "Sync settings loaded (full debug)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_url_joins_endpoint_container_and_name() {
        let settings = SyncSettings::new("acct.blob.core.windows.net/", "attachments");
        assert_eq!(
            settings.blob_url("/Modules/intro/.attachments/a.png"),
            "https://acct.blob.core.windows.net/attachments/Modules/intro/.attachments/a.png"
        );
    }

    #[test]
    fn concurrency_is_never_zero() {
        let mut settings = SyncSettings::new("e", "c");
        settings.max_concurrency = 0;
        assert_eq!(settings.concurrency(), 1);
    }
}

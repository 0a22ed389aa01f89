//! Per-worker flow completion log.

use std::path::{Path, PathBuf};

use tokio::{fs, io::AsyncWriteExt};

/// Header line of every telemetry file.
pub const CSV_HEADER: &str = "FLOW_SIZE_bytes,FCT_us\n";

/// Returns the telemetry file of the worker at `index` under `dir`.
pub fn telemetry_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("flow_{index}.csv"))
}

/// Append-only CSV with one `size,fct` row per completed flow.
///
/// Write failures are logged and otherwise ignored: telemetry never stops a worker.
#[derive(Debug)]
pub struct FlowTelemetry {
    path: PathBuf,
    file: Option<fs::File>,
}

impl FlowTelemetry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), file: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a row, opening the file (and writing the header) on first use.
    pub async fn record(&mut self, size_bytes: u64, fct_us: u64) {
        if let Err(e) = self.try_record(size_bytes, fct_us).await {
            tracing::warn!(path = %self.path.display(), ?e, "failed to record flow telemetry");
            // Reopen on the next record.
            self.file = None;
        }
    }

    async fn try_record(&mut self, size_bytes: u64, fct_us: u64) -> std::io::Result<()> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => self.file.insert(Self::open(&self.path).await?),
        };

        file.write_all(format!("{size_bytes},{fct_us}\n").as_bytes()).await?;
        file.flush().await
    }

    async fn open(path: &Path) -> std::io::Result<fs::File> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::OpenOptions::new().create(true).append(true).open(path).await?;
        if file.metadata().await?.len() == 0 {
            file.write_all(CSV_HEADER.as_bytes()).await?;
        }

        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flowctl-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn header_written_once() {
        let dir = scratch_dir("telemetry");
        let path = telemetry_path(&dir, 3);

        let mut telemetry = FlowTelemetry::new(&path);
        telemetry.record(1_500, 42).await;
        telemetry.record(3_000, 80).await;
        drop(telemetry);

        // A second writer appends without repeating the header.
        let mut telemetry = FlowTelemetry::new(&path);
        telemetry.record(10, 1).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "FLOW_SIZE_bytes,FCT_us\n1500,42\n3000,80\n10,1\n");
        assert!(path.ends_with("flow_3.csv"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let dir = scratch_dir("telemetry-blocked");
        std::fs::create_dir_all(&dir).unwrap();
        // A directory where the file should be makes every open fail.
        let path = telemetry_path(&dir, 0);
        std::fs::create_dir_all(&path).unwrap();

        let mut telemetry = FlowTelemetry::new(&path);
        telemetry.record(1, 1).await;
        assert!(telemetry.file.is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}

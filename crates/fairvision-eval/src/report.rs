//! Destinations for the final metrics line.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use fairvision_core::Result;

/// Accepts one formatted line per completed pass.
pub trait ReportSink {
    fn append_line(&mut self, line: &str) -> Result<()>;
}

/// Appends lines to a file, creating it on first use.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for FileSink {
    fn append_line(&mut self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        tracing::debug!(path = %self.path.display(), "Appended report line");
        Ok(())
    }
}

/// In-memory sink, mostly for tests.
impl ReportSink for Vec<String> {
    fn append_line(&mut self, line: &str) -> Result<()> {
        self.push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("test.log");
        let mut sink = FileSink::new(&path);
        sink.append_line("first").unwrap();
        sink.append_line("second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_vec_sink_collects() {
        let mut sink: Vec<String> = Vec::new();
        sink.append_line("Accuracy: 1.0000").unwrap();
        assert_eq!(sink, vec!["Accuracy: 1.0000".to_string()]);
    }
}

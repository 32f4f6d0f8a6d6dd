use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::stats::Stats;

/// Line-oriented metrics file. Truncated when opened, flushed after every
/// line, closed when dropped.
pub struct MetricsLog {
    path: PathBuf,
    writer: LineWriter<File>,
}

impl MetricsLog {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: LineWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Epoch {epoch} | k: v ...`
    pub fn epoch(&mut self, epoch: usize, stats: &Stats) -> Result<()> {
        self.line(&format!("Epoch {epoch} | {stats}"))
    }

    pub fn line(&mut self, text: &str) -> Result<()> {
        writeln!(self.writer, "{text}").map_err(|e| Error::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_then_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/train.log");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "stale\n").unwrap();

        let mut log = MetricsLog::create(&path).unwrap();
        log.epoch(0, &Stats::new().with("loss", 0.5)).unwrap();
        log.line("done").unwrap();
        // visible before drop: flushed per line
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "Epoch 0 | loss: 0.500\ndone\n");
    }
}

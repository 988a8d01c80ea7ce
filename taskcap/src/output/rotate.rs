//! Hourly-rotated CSV files.
//!
//! One file per category per local-time hour, opened in append mode with a
//! large write buffer. The header goes in only when the file is empty, so
//! a restart within the hour appends to the existing file without a second
//! header.

use anyhow::{Context, Result};
use log::warn;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::timebase::HourStamp;

const WRITE_BUF_SIZE: usize = 256 * 1024;

pub struct HourlyWriter {
    dir: PathBuf,
    base: &'static str,
    header: &'static str,
    current: Option<(HourStamp, BufWriter<File>)>,
}

impl HourlyWriter {
    #[must_use]
    pub fn new(dir: &Path, base: &'static str, header: &'static str) -> Self {
        Self { dir: dir.to_path_buf(), base, header, current: None }
    }

    /// Append one row to the file for `hour`, rotating first if the hour
    /// changed. A failed rotation keeps the previous file open so rows are
    /// not lost to a transient filesystem error.
    pub fn write_row(&mut self, hour: HourStamp, row: &str) -> Result<()> {
        if self.current.as_ref().map_or(true, |(h, _)| *h != hour) {
            match self.open_for(hour) {
                Ok(file) => {
                    if let Some((_, mut old)) = self.current.take() {
                        let _ = old.flush();
                    }
                    self.current = Some((hour, file));
                }
                Err(e) => {
                    if self.current.is_some() {
                        warn!("rotation of {} failed, keeping previous file: {e:#}", self.base);
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        let (_, writer) = self.current.as_mut().expect("writer present after rotation");
        writer.write_all(row.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn open_for(&self, hour: HourStamp) -> Result<BufWriter<File>> {
        let path = self.path_for(hour);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(format!("Failed to open {}", path.display()))?;
        let empty = file.metadata().map(|m| m.len() == 0).unwrap_or(false);
        let mut writer = BufWriter::with_capacity(WRITE_BUF_SIZE, file);
        if empty {
            writer.write_all(self.header.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        Ok(writer)
    }

    #[must_use]
    pub fn path_for(&self, hour: HourStamp) -> PathBuf {
        self.dir.join(format!("{}_{}.csv", self.base, hour.file_suffix()))
    }

    /// Flush buffered rows to disk (end of tick and shutdown).
    pub fn flush(&mut self) -> Result<()> {
        if let Some((_, writer)) = self.current.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// The six per-category writers.
pub struct OutputFiles {
    pub samples: HourlyWriter,
    pub sc_completions: HourlyWriter,
    pub iorq_completions: HourlyWriter,
    pub kstacks: HourlyWriter,
    pub ustacks: HourlyWriter,
    pub cgroups: HourlyWriter,
}

impl OutputFiles {
    /// Create the output directory and the writers.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .context(format!("Failed to create output directory {}", dir.display()))?;
        use crate::output::{
            CGROUPS_HEADER, IORQ_COMPLETION_HEADER, KSTACKS_HEADER, SAMPLES_HEADER,
            SC_COMPLETION_HEADER, USTACKS_HEADER,
        };
        Ok(Self {
            samples: HourlyWriter::new(dir, "samples", SAMPLES_HEADER),
            sc_completions: HourlyWriter::new(dir, "sc_completion", SC_COMPLETION_HEADER),
            iorq_completions: HourlyWriter::new(dir, "iorq_completion", IORQ_COMPLETION_HEADER),
            kstacks: HourlyWriter::new(dir, "kstacks", KSTACKS_HEADER),
            ustacks: HourlyWriter::new(dir, "ustacks", USTACKS_HEADER),
            cgroups: HourlyWriter::new(dir, "cgroups", CGROUPS_HEADER),
        })
    }

    pub fn flush_all(&mut self) -> Result<()> {
        self.samples.flush()?;
        self.sc_completions.flush()?;
        self.iorq_completions.flush()?;
        self.kstacks.flush()?;
        self.ustacks.flush()?;
        self.cgroups.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn hour(h: u32) -> HourStamp {
        HourStamp { year: 2026, month: 8, day: 1, hour: h }
    }

    #[test]
    fn header_written_once_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = HourlyWriter::new(dir.path(), "samples", "A,B");
        w.write_row(hour(13), "1,2").unwrap();
        w.write_row(hour(13), "3,4").unwrap();
        w.flush().unwrap();

        let content = fs::read_to_string(w.path_for(hour(13))).unwrap();
        assert_eq!(content, "A,B\n1,2\n3,4\n");
    }

    #[test]
    fn hour_change_opens_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = HourlyWriter::new(dir.path(), "samples", "A,B");
        w.write_row(hour(13), "1,2").unwrap();
        w.write_row(hour(14), "5,6").unwrap();
        w.flush().unwrap();

        let first = fs::read_to_string(w.path_for(hour(13))).unwrap();
        let second = fs::read_to_string(w.path_for(hour(14))).unwrap();
        assert_eq!(first, "A,B\n1,2\n");
        assert_eq!(second, "A,B\n5,6\n");
    }

    #[test]
    fn filename_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let w = HourlyWriter::new(dir.path(), "iorq_completion", "X");
        let name = w.path_for(hour(7));
        assert!(name.to_string_lossy().ends_with("iorq_completion_2026-08-01.07.csv"));
    }

    #[test]
    fn restart_appends_without_second_header() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut w = HourlyWriter::new(dir.path(), "samples", "A,B");
            w.write_row(hour(13), "1,2").unwrap();
            w.flush().unwrap();
        }
        // new writer, same hour: simulates a sampler restart
        let mut w = HourlyWriter::new(dir.path(), "samples", "A,B");
        w.write_row(hour(13), "9,9").unwrap();
        w.flush().unwrap();

        let content = fs::read_to_string(w.path_for(hour(13))).unwrap();
        assert_eq!(content, "A,B\n1,2\n9,9\n");
    }

    #[test]
    fn create_makes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("out/capture");
        let mut files = OutputFiles::create(&nested).unwrap();
        files.samples.write_row(hour(1), "r").unwrap();
        files.flush_all().unwrap();
        assert!(nested.join("samples_2026-08-01.01.csv").exists());
    }
}

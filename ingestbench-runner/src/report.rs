//! Collection and output of measurement results.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytesize::ByteSize;
use ingestbench_types::{CaseResult, CaseStatus};
use yansi::Paint;

/// Receives measurement results as they are produced.
pub trait ResultsSink {
    /// Records a single result row.
    fn record(&mut self, result: &CaseResult) -> Result<()>;
}

/// A [`ResultsSink`] collecting all results in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Vec<CaseResult>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded results in order.
    pub fn results(&self) -> &[CaseResult] {
        &self.results
    }

    /// Consumes the sink and returns its results.
    pub fn into_results(self) -> Vec<CaseResult> {
        self.results
    }
}

impl ResultsSink for MemorySink {
    fn record(&mut self, result: &CaseResult) -> Result<()> {
        self.results.push(result.clone());
        Ok(())
    }
}

/// A [`ResultsSink`] appending rows to one CSV file per backend, worker count and location.
///
/// Files are named `<backend>_<workers>_workers_<remote|local>.csv`. A header row is written only
/// when a file is new or empty, so repeated sweeps extend the same files. Every row is flushed
/// immediately, so an interrupted sweep keeps all completed rows.
#[derive(Debug)]
pub struct CsvReport {
    dir: PathBuf,
    writers: HashMap<PathBuf, csv::Writer<File>>,
}

impl CsvReport {
    /// Creates a report writing below `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writers: HashMap::new(),
        }
    }

    /// Path of the report file receiving the given result.
    pub fn path(&self, result: &CaseResult) -> PathBuf {
        let location = if result.is_remote { "remote" } else { "local" };
        self.dir.join(format!(
            "{}_{}_workers_{location}.csv",
            result.backend, result.worker_count
        ))
    }

    fn open(path: &Path) -> Result<csv::Writer<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open report {}", path.display()))?;
        let is_empty = file.metadata()?.len() == 0;

        Ok(csv::WriterBuilder::new()
            .has_headers(is_empty)
            .from_writer(file))
    }
}

impl ResultsSink for CsvReport {
    fn record(&mut self, result: &CaseResult) -> Result<()> {
        let path = self.path(result);
        let writer = match self.writers.entry(path) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                std::fs::create_dir_all(&self.dir)?;
                let writer = Self::open(entry.key())?;
                entry.insert(writer)
            }
        };

        writer.serialize(result)?;
        writer.flush()?;
        Ok(())
    }
}

/// Records into several sinks at once.
impl<A, B> ResultsSink for (A, B)
where
    A: ResultsSink,
    B: ResultsSink,
{
    fn record(&mut self, result: &CaseResult) -> Result<()> {
        self.0.record(result)?;
        self.1.record(result)
    }
}

/// Prints a one-line human summary of a result.
pub fn print_result(result: &CaseResult) {
    let case = result.key();
    match result.status {
        CaseStatus::Ok => {
            let seconds = result.insert_duration_seconds.unwrap_or_default();
            let rate = result.records_per_second().unwrap_or_default();
            let size = ByteSize::b(result.table_size_bytes.unwrap_or_default());
            println!(
                "{} {} (workers: {}): {} records in {:.3}s ({:.0} rows/s), {}",
                result.backend.bold().blue(),
                case,
                result.worker_count.bold(),
                result.record_count,
                seconds,
                rate.bold(),
                size,
            );
        }
        status => {
            let label = match status {
                CaseStatus::TimedOut => "timed out",
                CaseStatus::Invalid => "invalid",
                _ => "failed",
            };
            println!(
                "{} {} (workers: {}): {} {}",
                result.backend.bold().blue(),
                case,
                result.worker_count.bold(),
                label.red().bold(),
                result.error.as_deref().unwrap_or_default(),
            );
        }
    }
}

/// Prints the totals of a finished sweep.
pub fn print_totals(results: &[CaseResult]) {
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let failed = results.len() - ok;
    let records: u64 = results
        .iter()
        .filter(|r| r.is_ok())
        .map(|r| r.record_count)
        .sum();

    let failed = if failed > 0 {
        failed.red()
    } else {
        failed.primary()
    };

    println!();
    println!("{}", "## TOTALS".bold());
    println!(
        "measurements: {}, succeeded: {}, failed: {}",
        results.len().bold(),
        ok.green(),
        failed
    );
    println!("records ingested: {}", records.bold());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(worker_count: usize, status: CaseStatus) -> CaseResult {
        let ok = status == CaseStatus::Ok;
        CaseResult {
            backend: "memory".into(),
            duration_minutes: 5,
            tag_count: 10,
            sampling_interval_seconds: 60,
            record_count: 50,
            table_size_bytes: ok.then_some(1024),
            insert_duration_seconds: ok.then_some(0.25),
            worker_count,
            is_remote: false,
            status,
            error: (!ok).then(|| "boom".to_owned()),
        }
    }

    #[test]
    fn appends_rows_with_single_header() {
        let tempdir = tempfile::tempdir().unwrap();

        let mut report = CsvReport::new(tempdir.path());
        report.record(&result(2, CaseStatus::Ok)).unwrap();
        report.record(&result(2, CaseStatus::Failed)).unwrap();
        drop(report);

        // a second report appends to the existing file
        let mut report = CsvReport::new(tempdir.path());
        report.record(&result(2, CaseStatus::TimedOut)).unwrap();
        drop(report);

        let path = tempdir.path().join("memory_2_workers_local.csv");
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(
            content,
            "duration_minutes,tag_count,sampling_interval_seconds,record_count,table_size_bytes,\
             insert_duration_seconds,worker_count,is_remote,status,error\n\
             5,10,60,50,1024,0.25,2,false,ok,\n\
             5,10,60,50,,,2,false,failed,boom\n\
             5,10,60,50,,,2,false,timed_out,boom\n"
        );
    }

    #[test]
    fn splits_files_by_workers_and_location() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut report = CsvReport::new(tempdir.path().join("results"));

        let mut remote = result(1, CaseStatus::Ok);
        remote.is_remote = true;
        report.record(&remote).unwrap();
        report.record(&result(4, CaseStatus::Ok)).unwrap();

        let dir = tempdir.path().join("results");
        assert!(dir.join("memory_1_workers_remote.csv").is_file());
        assert!(dir.join("memory_4_workers_local.csv").is_file());
    }

    #[test]
    fn tuple_records_into_both() {
        let mut sinks = (MemorySink::new(), MemorySink::new());
        sinks.record(&result(1, CaseStatus::Ok)).unwrap();
        assert_eq!(sinks.0.results().len(), 1);
        assert_eq!(sinks.1.into_results().len(), 1);
    }
}

use crate::{
    aggregate::AggregateMaintainer,
    config::LoaderConfig,
    dimension::DimensionResolver,
    error::{ConfigError, JournalError, LoadError, ValidationError},
    fact::{FactWriter, WriteOutcome},
    io::{ReadError, RecordReader},
    warehouse::{UnitOfWork, Warehouse},
    TransactionRecord,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// One item of the input stream. Decode failures stay attached to their
/// position so they can fail their own batch instead of the run.
pub type RecordInput = Result<TransactionRecord, ReadError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The record itself could not be loaded.
    Rejected { error: String, retryable: bool },
    /// The record loaded fine but its batch was rolled back.
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRecord {
    /// 1-based position in the input stream.
    pub position: usize,
    pub record: String,
    pub reason: FailureReason,
}

/// Outcome of one batch.
///
/// A committed batch has `inserted + skipped_duplicate == records`. A rolled
/// back one has `failed + not_attempted == records`, with one `Rejected`
/// entry for the record that aborted it and one `RolledBack` entry for every
/// record processed before it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch: usize,
    pub records: usize,
    pub committed: bool,
    pub inserted: usize,
    pub skipped_duplicate: usize,
    pub failed: usize,
    pub not_attempted: usize,
    pub created_dimensions: usize,
    pub failures: Vec<FailedRecord>,
}

impl BatchReport {
    fn empty(batch: usize, records: usize) -> Self {
        Self {
            batch,
            records,
            committed: false,
            inserted: 0,
            skipped_duplicate: 0,
            failed: 0,
            not_attempted: 0,
            created_dimensions: 0,
            failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub batches: Vec<BatchReport>,
}

impl RunReport {
    /// True when every batch committed.
    pub fn succeeded(&self) -> bool {
        self.batches.iter().all(|b| b.committed)
    }

    pub fn inserted(&self) -> usize {
        self.batches.iter().map(|b| b.inserted).sum()
    }

    pub fn skipped_duplicate(&self) -> usize {
        self.batches.iter().map(|b| b.skipped_duplicate).sum()
    }

    pub fn failed(&self) -> usize {
        self.batches.iter().map(|b| b.failed).sum()
    }

    pub fn failed_batches(&self) -> impl Iterator<Item = &BatchReport> {
        self.batches.iter().filter(|b| !b.committed)
    }
}

/// Lazily split `input` into vectors of `size` items; the last may be shorter.
fn batches<I: Iterator>(mut input: I, size: usize) -> impl Iterator<Item = Vec<I::Item>> {
    std::iter::from_fn(move || {
        let batch: Vec<_> = input.by_ref().take(size).collect();
        (!batch.is_empty()).then_some(batch)
    })
}

/// Drives records through resolve, write and commit, one atomic batch at a time.
///
/// Batches are independent: a rolled back batch is reported and loading
/// continues with the next one. Only a storage failure aborts the run, as
/// [`LoadError::RunAborted`] carrying the reports of the finished batches.
pub struct BatchIngestor {
    warehouse: Arc<Warehouse>,
    config: LoaderConfig,
    resolver: DimensionResolver,
    writer: FactWriter,
    aggregates: Option<Arc<AggregateMaintainer>>,
}

impl BatchIngestor {
    pub fn new(warehouse: Arc<Warehouse>, config: LoaderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            resolver: config.resolver(),
            writer: config.fact_writer(),
            warehouse,
            config,
            aggregates: None,
        })
    }

    /// Invalidate these aggregate views whenever a batch commits new rows.
    pub fn with_aggregates(mut self, aggregates: Arc<AggregateMaintainer>) -> Self {
        self.aggregates = Some(aggregates);
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn ingest<I>(&self, records: I) -> Result<RunReport, LoadError>
    where
        I: IntoIterator<Item = TransactionRecord>,
    {
        self.ingest_inputs(records.into_iter().map(Ok))
    }

    /// Load every record of an NDJSON input file.
    pub fn ingest_reader(&self, reader: RecordReader) -> Result<RunReport, LoadError> {
        self.ingest_inputs(reader)
    }

    pub fn ingest_inputs<I>(&self, inputs: I) -> Result<RunReport, LoadError>
    where
        I: IntoIterator<Item = RecordInput>,
    {
        let size = self.config.batch_size.max(1);
        let mut report = RunReport::default();

        for (index, batch) in batches(inputs.into_iter(), size).enumerate() {
            match self.process_batch(index, index * size + 1, batch) {
                Ok(batch_report) => report.batches.push(batch_report),
                Err(source) => return Err(LoadError::RunAborted { report, source }),
            }
        }

        Ok(report)
    }

    /// Load `records` with `workers` threads pulling batches from a shared queue.
    pub fn ingest_concurrent(
        &self,
        records: &[TransactionRecord],
        workers: usize,
    ) -> Result<RunReport, LoadError> {
        let size = self.config.batch_size.max(1);
        let chunks: Vec<&[TransactionRecord]> = records.chunks(size).collect();
        let next = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let reports = Mutex::new(Vec::with_capacity(chunks.len()));
        let fatal = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..workers.max(1) {
                scope.spawn(|| {
                    while !abort.load(Ordering::SeqCst) {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(chunk) = chunks.get(index) else {
                            break;
                        };
                        let batch = chunk.iter().cloned().map(Ok).collect();
                        match self.process_batch(index, index * size + 1, batch) {
                            Ok(report) => reports.lock().push(report),
                            Err(err) => {
                                abort.store(true, Ordering::SeqCst);
                                fatal.lock().get_or_insert(err);
                            }
                        }
                    }
                });
            }
        });

        let mut batches = reports.into_inner();
        batches.sort_by_key(|b| b.batch);
        let report = RunReport { batches };
        match fatal.into_inner() {
            Some(source) => Err(LoadError::RunAborted { report, source }),
            None => Ok(report),
        }
    }

    fn load_record(
        &self,
        uow: &mut UnitOfWork<'_>,
        input: RecordInput,
    ) -> Result<WriteOutcome, LoadError> {
        let record = match input {
            Ok(record) => record,
            Err(ReadError::Deserialization(err)) => {
                return Err(ValidationError::Malformed(err.to_string()).into())
            }
            Err(err) => return Err(LoadError::StorageUnavailable(JournalError::Read(err))),
        };

        let keys = self.resolver.resolve_record(uow, &record)?;
        self.writer.write(uow, keys, &record)
    }

    fn process_batch(
        &self,
        index: usize,
        first_position: usize,
        batch: Vec<RecordInput>,
    ) -> Result<BatchReport, JournalError> {
        let mut report = BatchReport::empty(index, batch.len());
        let mut attempted: Vec<(usize, String)> = Vec::with_capacity(batch.len());
        let mut uow = self.warehouse.begin();

        tracing::debug!(batch = index, records = batch.len(), tx = uow.tx(), "batch started");

        for (offset, input) in batch.into_iter().enumerate() {
            let position = first_position + offset;
            let identity = match &input {
                Ok(record) => record.identity(position),
                Err(_) => format!("#{position}"),
            };

            match self.load_record(&mut uow, input) {
                Ok(WriteOutcome::Inserted) => report.inserted += 1,
                Ok(WriteOutcome::SkippedDuplicate) => report.skipped_duplicate += 1,
                Err(LoadError::StorageUnavailable(source)) => {
                    tracing::error!(batch = index, error = %source, "storage unavailable, aborting run");
                    return Err(source);
                }
                Err(err) => {
                    uow.rollback();
                    tracing::warn!(
                        batch = index,
                        record = %identity,
                        error = %err,
                        "batch rolled back"
                    );
                    return Ok(Self::rolled_back(report, attempted, position, identity, &err));
                }
            }
            attempted.push((position, identity));
        }

        report.created_dimensions = uow.created_dimensions();
        if let Err(err) = uow.commit() {
            tracing::error!(batch = index, error = %err, "journal write failed, aborting run");
            return Err(err);
        }
        report.committed = true;

        tracing::info!(
            batch = index,
            inserted = report.inserted,
            skipped_duplicate = report.skipped_duplicate,
            created_dimensions = report.created_dimensions,
            "batch committed"
        );

        if report.inserted > 0 || report.created_dimensions > 0 {
            if let Some(aggregates) = &self.aggregates {
                aggregates.invalidate();
            }
        }
        Ok(report)
    }

    fn rolled_back(
        mut report: BatchReport,
        attempted: Vec<(usize, String)>,
        position: usize,
        identity: String,
        err: &LoadError,
    ) -> BatchReport {
        report.failed = attempted.len() + 1;
        report.not_attempted = report.records - report.failed;
        report.inserted = 0;
        report.skipped_duplicate = 0;

        report.failures = attempted
            .into_iter()
            .map(|(position, record)| FailedRecord {
                position,
                record,
                reason: FailureReason::RolledBack,
            })
            .collect();
        report.failures.push(FailedRecord {
            position,
            record: identity,
            reason: FailureReason::Rejected {
                error: err.to_string(),
                retryable: err.is_retryable(),
            },
        });
        report
    }
}

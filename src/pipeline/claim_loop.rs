use super::PipelineError;
use crate::batch::{project, BatchAccumulator};
use crate::broker::Claim;
use crate::config::types::BatchConfig;
use crate::config::Settings;
use crate::echo::{ConsoleEcho, RecordHook};
use crate::extract::{Extraction, FieldExtractor};
use crate::sink::{Sink, SinkWriter};
use std::fmt;
use std::sync::Arc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Read-only state shared by every claim loop.
pub struct PipelineContext {
    extractor: FieldExtractor,
    columns: Arc<[String]>,
    writer: SinkWriter,
    hook: Option<Arc<dyn RecordHook>>,
    batch: BatchConfig,
}

impl PipelineContext {
    pub fn new(
        extractor: FieldExtractor,
        columns: Arc<[String]>,
        writer: SinkWriter,
        batch: BatchConfig,
    ) -> Self {
        Self {
            extractor,
            columns,
            writer,
            hook: None,
            batch,
        }
    }

    pub fn from_settings(settings: &Settings, sink: Arc<dyn Sink>) -> Self {
        let writer = SinkWriter::new(sink, &settings.table, &settings.columns);
        let context = Self::new(
            FieldExtractor::from_settings(settings),
            settings.columns.clone(),
            writer,
            settings.batch.clone(),
        );
        match &settings.echo_template {
            Some(template) => context.with_hook(Arc::new(ConsoleEcho::new(template.clone()))),
            None => context,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn RecordHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn writer(&self) -> &SinkWriter {
        &self.writer
    }
}

/// Counters for one claim, or summed over the whole pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClaimStats {
    pub received: u64,
    pub written: u64,
    pub dropped: u64,
    pub failed_flushes: u64,
}

impl std::ops::AddAssign for ClaimStats {
    fn add_assign(&mut self, other: Self) {
        self.received += other.received;
        self.written += other.written;
        self.dropped += other.dropped;
        self.failed_flushes += other.failed_flushes;
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Size,
    Timeout,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Size => write!(f, "size"),
            Trigger::Timeout => write!(f, "timeout"),
        }
    }
}

/// Consume one partition claim until it ends or `shutdown` fires.
///
/// Records are buffered until the size limit is reached or the idle timer
/// expires, then written as one transaction. Offsets are acknowledged only
/// after a successful commit. A failed write keeps the buffer intact so the
/// same records are retried on the next trigger.
pub async fn run_claim<C: Claim>(
    mut claim: C,
    ctx: Arc<PipelineContext>,
    shutdown: CancellationToken,
) -> Result<ClaimStats, PipelineError> {
    let topic = claim.topic().to_string();
    let partition = claim.partition();
    let mut stats = ClaimStats::default();
    let mut buffer = BatchAccumulator::new(ctx.batch.size);
    let mut deadline = Instant::now() + ctx.batch.timeout;

    info!(topic = %topic, partition, "Claim loop started");

    loop {
        let trigger = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            record = claim.next_record() => {
                let Some(record) = record else {
                    info!(topic = %topic, partition, "Claim ended");
                    break;
                };
                stats.received += 1;

                let extraction = ctx.extractor.extract(&record.payload).map_err(|source| {
                    PipelineError::Extract {
                        topic: topic.clone(),
                        partition,
                        offset: record.offset,
                        source,
                    }
                })?;

                let row = match extraction {
                    Extraction::Fields(fields) => {
                        if let Some(hook) = &ctx.hook {
                            hook.on_record(&fields);
                        }
                        Some(project(&fields, &ctx.columns))
                    }
                    Extraction::Dropped(reason) => {
                        stats.dropped += 1;
                        debug!(
                            topic = %topic,
                            partition,
                            offset = record.offset,
                            reason = %reason,
                            "Dropped record"
                        );
                        None
                    }
                };

                if !buffer.push(record, row) {
                    continue;
                }
                Trigger::Size
            }

            _ = sleep_until(deadline) => Trigger::Timeout,
        };

        flush(&mut claim, &mut buffer, &ctx, trigger, &mut stats).await?;
        deadline = Instant::now() + ctx.batch.timeout;
    }

    if !buffer.is_empty() {
        info!(
            topic = %topic,
            partition,
            pending = buffer.len(),
            "Claim loop stopped with unflushed records; they will be redelivered"
        );
    }
    Ok(stats)
}

async fn flush<C: Claim>(
    claim: &mut C,
    buffer: &mut BatchAccumulator,
    ctx: &PipelineContext,
    trigger: Trigger,
    stats: &mut ClaimStats,
) -> Result<(), PipelineError> {
    let Some(batch) = buffer.batch() else {
        if !buffer.is_empty() {
            debug!(
                topic = claim.topic(),
                partition = claim.partition(),
                dropped = buffer.len(),
                "Buffer held only dropped records"
            );
            buffer.clear();
        }
        return Ok(());
    };
    let batch_id = batch.id;
    let result = ctx.writer.write(&batch).await;
    drop(batch);

    match result {
        Ok(rows) => {
            let newest = buffer.newest_timestamp();
            for record in buffer.written_records() {
                claim
                    .mark_acknowledged(record)
                    .map_err(|source| PipelineError::Acknowledge {
                        topic: claim.topic().to_string(),
                        partition: claim.partition(),
                        offset: record.offset,
                        source,
                    })?;
            }
            stats.written += rows as u64;
            info!(
                topic = claim.topic(),
                partition = claim.partition(),
                batch_id = %batch_id,
                rows,
                trigger = %trigger,
                newest = ?newest,
                sink = %ctx.writer.target(),
                "Batch committed"
            );
            buffer.clear();
        }
        Err(e) => {
            stats.failed_flushes += 1;
            error!(
                topic = claim.topic(),
                partition = claim.partition(),
                batch_id = %batch_id,
                buffered = buffer.len(),
                trigger = %trigger,
                sink = %ctx.writer.target(),
                error = %e,
                "Batch write failed, records kept for retry"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryClaim, MemoryPartition};
    use crate::config::types::MismatchStrategy;
    use crate::extract::{ExtractError, FieldMapping};
    use crate::sink::testing::RecordingSink;
    use regex::Regex;
    use std::sync::Mutex;
    use std::time::Duration;

    const ACCESS_PATTERN: &str = r#"^(\S+) - - \[([^]]+)] "([^"]*)" (\d+) (\d+)"#;

    fn context(sink: &RecordingSink, size: usize) -> PipelineContext {
        let extractor = FieldExtractor::new(
            Regex::new(ACCESS_PATTERN).unwrap(),
            ["ip", "time", "request", "status", "bytes"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            "log",
            MismatchStrategy::Fail,
        );
        let columns: Arc<[String]> = vec!["ip".to_string(), "status".to_string()].into();
        let writer = SinkWriter::new(Arc::new(sink.clone()), "access_log", &columns);
        PipelineContext::new(
            extractor,
            columns,
            writer,
            BatchConfig {
                size,
                timeout: Duration::from_secs(2),
            },
        )
    }

    fn access_line(ip: &str, status: u16) -> Vec<u8> {
        let line = format!(r#"{ip} - - [04/Jan/2024:11:07:23 +0800] "GET / HTTP/1.1" {status} 0"#);
        serde_json::json!({ "log": line }).to_string().into_bytes()
    }

    fn row(ip: &str, status: &str) -> Vec<String> {
        vec![ip.to_string(), status.to_string()]
    }

    fn spawn_claim(
        claim: MemoryClaim,
        ctx: PipelineContext,
    ) -> (
        CancellationToken,
        tokio::task::JoinHandle<Result<ClaimStats, PipelineError>>,
    ) {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_claim(claim, Arc::new(ctx), shutdown.clone()));
        (shutdown, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_then_idle_timeout() {
        let sink = RecordingSink::new();
        let (mut partition, claim) = MemoryPartition::new("nginx", 0);
        for i in 0..3 {
            partition.send(access_line(&format!("10.0.0.{i}"), 200)).unwrap();
        }

        let (shutdown, handle) = spawn_claim(claim, context(&sink, 2));

        // The first two records fill the batch and flush at once
        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(sink.commits(), 1);
        assert_eq!(sink.committed(), vec![row("10.0.0.0", "200"), row("10.0.0.1", "200")]);
        assert_eq!(partition.acknowledged(), vec![0, 1]);

        // The third waits for the idle timeout
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(sink.commits(), 2);
        assert_eq!(sink.committed()[2], row("10.0.0.2", "200"));
        assert_eq!(partition.acknowledged(), vec![0, 1, 2]);

        shutdown.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.written, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_with_empty_buffer_writes_nothing() {
        let sink = RecordingSink::new();
        let (_partition, claim) = MemoryPartition::new("nginx", 0);
        let (shutdown, handle) = spawn_claim(claim, context(&sink, 10));

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(sink.commits(), 0);
        assert!(sink.prepared().is_empty());

        shutdown.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), ClaimStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_retried_with_same_records() {
        let sink = RecordingSink::new();
        sink.set_failing(true);
        let (mut partition, claim) = MemoryPartition::new("nginx", 0);
        partition.send(access_line("10.0.0.1", 200)).unwrap();
        partition.send(access_line("10.0.0.2", 500)).unwrap();

        let (shutdown, handle) = spawn_claim(claim, context(&sink, 2));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.commits(), 0);
        assert!(partition.acknowledged().is_empty());

        // Sink recovers; the retained batch goes out on the next trigger
        sink.set_failing(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.commits(), 1);
        assert_eq!(sink.committed(), vec![row("10.0.0.1", "200"), row("10.0.0.2", "500")]);
        assert_eq!(partition.acknowledged(), vec![0, 1]);

        shutdown.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.written, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arrivals_past_the_limit_retry_a_failing_batch() {
        let sink = RecordingSink::new();
        sink.set_failing(true);
        let (mut partition, claim) = MemoryPartition::new("nginx", 0);
        partition.send(access_line("10.0.0.1", 200)).unwrap();
        partition.send(access_line("10.0.0.2", 200)).unwrap();

        let (shutdown, handle) = spawn_claim(claim, context(&sink, 2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.prepared().len(), 1);

        // A buffer already past the limit retries on every arrival
        partition.send(access_line("10.0.0.3", 503)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.prepared().len(), 2);
        assert_eq!(sink.commits(), 0);
        assert!(partition.acknowledged().is_empty());

        sink.set_failing(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.commits(), 1);
        assert_eq!(
            sink.committed(),
            vec![
                row("10.0.0.1", "200"),
                row("10.0.0.2", "200"),
                row("10.0.0.3", "503"),
            ]
        );
        // Each offset is acknowledged once; a repeat would end the claim
        assert_eq!(partition.acknowledged(), vec![0, 1, 2]);

        shutdown.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.failed_flushes, 2);
        assert_eq!(stats.written, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_records_are_never_acknowledged() {
        let sink = RecordingSink::new();
        let (mut partition, claim) = MemoryPartition::new("nginx", 0);
        partition.send(access_line("10.0.0.1", 200)).unwrap();
        partition.send(br#"{"stream":"stderr"}"#.to_vec()).unwrap();
        partition.send(access_line("10.0.0.3", 404)).unwrap();

        let (shutdown, handle) = spawn_claim(claim, context(&sink, 3));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.committed(), vec![row("10.0.0.1", "200"), row("10.0.0.3", "404")]);
        assert_eq!(partition.acknowledged(), vec![0, 2]);

        shutdown.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_of_only_dropped_records_is_cleared() {
        let sink = RecordingSink::new();
        let (mut partition, claim) = MemoryPartition::new("nginx", 0);
        partition.send(b"not json".to_vec()).unwrap();
        partition.send(br#"{"log":null}"#.to_vec()).unwrap();

        let (shutdown, handle) = spawn_claim(claim, context(&sink, 2));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(sink.prepared().is_empty());
        assert!(partition.acknowledged().is_empty());

        // The next record starts a fresh batch
        partition.send(access_line("10.0.0.9", 200)).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sink.committed(), vec![row("10.0.0.9", "200")]);
        assert_eq!(partition.acknowledged(), vec![2]);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pattern_mismatch_stops_the_loop() {
        let sink = RecordingSink::new();
        let (mut partition, claim) = MemoryPartition::new("nginx", 4);
        partition.send(access_line("10.0.0.1", 200)).unwrap();
        partition
            .send(serde_json::json!({ "log": "not an access line" }).to_string())
            .unwrap();

        let (_shutdown, handle) = spawn_claim(claim, context(&sink, 10));

        let err = handle.await.unwrap().unwrap_err();
        match err {
            PipelineError::Extract {
                partition,
                offset,
                source: ExtractError::PatternMismatch { .. },
                ..
            } => {
                assert_eq!(partition, 4);
                assert_eq!(offset, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(partition.acknowledged().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_buffer_unacknowledged() {
        let sink = RecordingSink::new();
        let (mut partition, claim) = MemoryPartition::new("nginx", 0);
        partition.send(access_line("10.0.0.1", 200)).unwrap();

        let (shutdown, handle) = spawn_claim(claim, context(&sink, 10));
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.cancel();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.written, 0);
        assert_eq!(sink.commits(), 0);
        assert!(partition.acknowledged().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_end_stops_loop() {
        let sink = RecordingSink::new();
        let (partition, claim) = MemoryPartition::new("nginx", 0);
        drop(partition);

        let (_shutdown, handle) = spawn_claim(claim, context(&sink, 10));
        assert_eq!(handle.await.unwrap().unwrap(), ClaimStats::default());
    }

    struct CountingHook(Mutex<Vec<String>>);

    impl RecordHook for CountingHook {
        fn on_record(&self, fields: &FieldMapping) {
            self.0.lock().unwrap().push(fields["ip"].clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_sees_each_extracted_record_once() {
        let sink = RecordingSink::new();
        sink.set_failing(true);
        let hook = Arc::new(CountingHook(Mutex::new(Vec::new())));
        let (mut partition, claim) = MemoryPartition::new("nginx", 0);
        partition.send(access_line("10.0.0.1", 200)).unwrap();
        partition.send(b"{}".to_vec()).unwrap();

        let ctx = context(&sink, 10).with_hook(hook.clone());
        let (shutdown, handle) = spawn_claim(claim, ctx);

        // Several failed flush attempts must not re-run the hook
        tokio::time::sleep(Duration::from_secs(9)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(*hook.0.lock().unwrap(), vec!["10.0.0.1".to_string()]);
    }
}

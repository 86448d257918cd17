use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageBuffer, Rgb, RgbImage};
use squash_core::app::PacingPolicy;
use squash_core::domain::CodecError;
use squash_core::ports::{Codec, Encoded};
use squash_core::{
    Dispatcher, DispatcherBuilder, EngineConfig, EventKind, ExportMode,
    SquashError, Subscription, TaskEvent, TaskId, TaskState,
};
use tempfile::{TempDir, tempdir};
use tokio::time::{sleep, timeout};
use tracing_test::traced_test;

/// Keeps the first 40% of the input.
///
/// Files starting with `corrupt` fail the probe; files starting with `panic`
/// make the encode panic.
struct TruncatingCodec {
    delay: Duration,
}

#[async_trait]
impl Codec for TruncatingCodec {
    async fn probe(&self, input: &Path) -> Result<String, CodecError> {
        let bytes = tokio::fs::read(input).await?;
        if bytes.starts_with(b"corrupt") {
            return Err(CodecError::Unreadable("not an image".into()));
        }
        Ok("PNG".into())
    }

    async fn encode(&self, input: &Path) -> Result<Encoded, CodecError> {
        sleep(self.delay).await;
        let mut bytes = tokio::fs::read(input).await?;
        if bytes.starts_with(b"panic") {
            panic!("codec bug on {}", input.display());
        }
        bytes.truncate(bytes.len() * 4 / 10);
        Ok(Encoded::new(bytes, "PNG"))
    }
}

fn config(pacing: PacingPolicy) -> EngineConfig {
    EngineConfig {
        pacing,
        ..EngineConfig::default()
    }
}

fn dispatcher(config: EngineConfig, codec_delay_ms: u64) -> Dispatcher {
    DispatcherBuilder::new(config)
        .codec(Arc::new(TruncatingCodec {
            delay: Duration::from_millis(codec_delay_ms),
        }))
        .build()
        .unwrap()
}

fn write_sources(dir: &TempDir, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            let body = if name.starts_with("corrupt") {
                b"corrupt".repeat(100)
            } else {
                name.as_bytes().repeat(500)
            };
            std::fs::write(&path, body).unwrap();
            path
        })
        .collect()
}

/// Receive until `terminal` tasks have finished.
async fn collect(sub: &mut Subscription, terminal: usize) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    let mut finished = 0;
    while finished < terminal {
        let event = timeout(Duration::from_secs(10), sub.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event bus closed");
        if event.kind.is_terminal() {
            finished += 1;
        }
        events.push(event);
    }
    events
}

fn by_task(events: &[TaskEvent]) -> HashMap<TaskId, Vec<EventKind>> {
    let mut map: HashMap<TaskId, Vec<EventKind>> = HashMap::new();
    for event in events {
        map.entry(event.task_id.clone())
            .or_default()
            .push(event.kind.clone());
    }
    map
}

#[tokio::test]
#[traced_test]
async fn same_path_is_admitted_once() {
    let dir = tempdir().unwrap();
    let sources = write_sources(&dir, &["a.png"]);
    let d = dispatcher(config(PacingPolicy::default()), 0);

    let dotted = dir.path().join(".").join("a.png");
    let first = d.submit([&sources[0], &sources[0], &dotted]).await;
    assert_eq!(first.accepted.len(), 1);
    assert_eq!(first.duplicates.len(), 2);

    let second = d.submit([&sources[0]]).await;
    assert!(second.accepted.is_empty());
    assert_eq!(second.duplicates, first.accepted);

    assert_eq!(d.snapshot().await.tasks.len(), 1);
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn unsupported_extension_is_rejected_at_submission() {
    let dir = tempdir().unwrap();
    let sources = write_sources(&dir, &["a.gif", "b.png"]);
    let d = dispatcher(config(PacingPolicy::instant()), 0);

    let report = d.submit(&sources).await;
    assert_eq!(report.accepted.len(), 1);
    assert_eq!(report.rejected.len(), 1);
    assert!(matches!(
        report.rejected[0].error,
        SquashError::UnsupportedFormat { .. }
    ));
    assert_eq!(d.counts().await.total, 1);
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn progress_is_monotonic_and_ends_at_100() {
    let dir = tempdir().unwrap();
    let sources = write_sources(&dir, &["a.png", "b.jpg", "c.webp"]);
    let d = dispatcher(config(PacingPolicy::instant()), 0);
    let mut sub = d.subscribe();

    d.submit(&sources).await;
    let events = collect(&mut sub, 3).await;

    for (task_id, kinds) in by_task(&events) {
        assert_eq!(kinds.first(), Some(&EventKind::Started), "{task_id}");
        let progress: Vec<u8> = kinds
            .iter()
            .filter_map(|k| match k {
                EventKind::Progress { percent } => Some(*percent),
                _ => None,
            })
            .collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{task_id}");
        assert_eq!(progress.last(), Some(&100), "{task_id}");

        // 100 immediately precedes the terminal event, which is last
        let n = kinds.len();
        assert_eq!(kinds[n - 2], EventKind::Progress { percent: 100 });
        assert!(matches!(kinds[n - 1], EventKind::Completed { .. }));
    }

    let snapshot = d.snapshot().await;
    assert!(
        snapshot
            .tasks
            .iter()
            .all(|t| t.state == TaskState::Completed && t.progress == 100)
    );
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn counters_are_consistent_in_every_event_and_snapshot() {
    let dir = tempdir().unwrap();
    let names: Vec<String> = (0..8).map(|i| format!("img{i}.png")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let sources = write_sources(&dir, &names);
    let d = dispatcher(
        config(PacingPolicy {
            steps: 20,
            step_delay_ms: 1,
        }),
        5,
    );
    let mut sub = d.subscribe();

    d.submit(&sources).await;
    let snapshots = {
        let mut taken = Vec::new();
        for _ in 0..5 {
            taken.push(d.snapshot().await);
            sleep(Duration::from_millis(3)).await;
        }
        taken
    };
    let events = collect(&mut sub, 8).await;

    assert!(events.iter().all(|e| e.counts.is_consistent()));
    for snapshot in snapshots {
        assert!(snapshot.counts.is_consistent());
        assert_eq!(snapshot.counts.total, snapshot.tasks.len());
    }
    let last = events.last().unwrap().counts;
    assert_eq!(last.completed, 8);
    assert!(last.is_idle());
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn nothing_follows_a_terminal_event() {
    let dir = tempdir().unwrap();
    let sources = write_sources(&dir, &["a.png", "corrupt.png", "b.png"]);
    let d = dispatcher(config(PacingPolicy::instant()), 0);
    let mut sub = d.subscribe();

    d.submit(&sources).await;
    let mut events = collect(&mut sub, 3).await;
    sleep(Duration::from_millis(50)).await;
    while let Some(late) = sub.try_recv() {
        events.push(late);
    }

    for (task_id, kinds) in by_task(&events) {
        let terminal: Vec<usize> = kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| k.is_terminal())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(terminal, vec![kinds.len() - 1], "{task_id}");
    }
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn one_corrupt_file_fails_alone() {
    let dir = tempdir().unwrap();
    let mut sources = Vec::new();
    for i in 0..4 {
        let path = dir.path().join(format!("photo{i}.png"));
        let img: RgbImage =
            ImageBuffer::from_fn(48, 48, |x, y| Rgb([(x * 5) as u8, (y * 5) as u8, i * 40]));
        img.save(&path).unwrap();
        sources.push(path);
    }
    let corrupt = dir.path().join("broken.png");
    std::fs::write(&corrupt, b"this is not a png").unwrap();
    sources.push(corrupt.clone());

    // the real image codec
    let d = DispatcherBuilder::new(config(PacingPolicy::instant()))
        .build()
        .unwrap();
    let mut sub = d.subscribe();
    d.submit(&sources).await;
    let events = collect(&mut sub, 5).await;

    let counts = events.last().unwrap().counts;
    assert_eq!(counts.completed, 4);
    assert_eq!(counts.failed, 1);
    assert!(counts.is_idle());

    let snapshot = d.snapshot().await;
    let failed: Vec<_> = snapshot
        .tasks
        .iter()
        .filter(|t| t.state == TaskState::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].input_path, corrupt);
    assert!(failed[0].progress < 100);
    assert!(failed[0].outcome.is_none());
    assert!(!dir.path().join("broken_compressed.png").exists());
    for i in 0..4 {
        assert!(dir.path().join(format!("photo{i}_compressed.png")).exists());
    }
    assert!(d.batch_ready());
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn archive_holds_every_completed_output() {
    let dir = tempdir().unwrap();
    let out = tempdir().unwrap();
    let sources = write_sources(&dir, &["a.png", "b.png", "c.jpg", "corrupt.png"]);
    let d = dispatcher(config(PacingPolicy::instant()), 0);
    let mut sub = d.subscribe();
    assert!(!d.batch_ready());

    d.submit(&sources).await;
    collect(&mut sub, 4).await;
    assert!(d.batch_ready());

    let report = d
        .export_batch(out.path(), ExportMode::Archive, |_| {})
        .await
        .unwrap();
    assert_eq!(report.items, 3);

    let mut archive = zip::ZipArchive::new(File::open(&report.destination).unwrap()).unwrap();
    assert_eq!(archive.len(), 3);
    for name in ["a_compressed.png", "b_compressed.png", "c_compressed.jpg"] {
        let mut bytes = Vec::new();
        archive
            .by_name(name)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(bytes, std::fs::read(dir.path().join(name)).unwrap());
    }
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn ratio_of_a_real_run() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("big.png");
    std::fs::write(&input, vec![1u8; 1_000_000]).unwrap();
    let d = dispatcher(config(PacingPolicy::instant()), 0);
    let mut sub = d.subscribe();

    let report = d.submit([&input]).await;
    collect(&mut sub, 1).await;

    let task = d.task(&report.accepted[0]).await.unwrap();
    let outcome = task.outcome.unwrap();
    assert_eq!(outcome.original_size, 1_000_000);
    assert_eq!(outcome.compressed_size, 400_000);
    assert_eq!(outcome.compression_ratio, 60.0);
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn clear_all_mid_flight_silences_everything() {
    let dir = tempdir().unwrap();
    let sources = write_sources(&dir, &["a.png", "b.png", "c.png"]);
    let d = dispatcher(
        config(PacingPolicy {
            steps: 100,
            step_delay_ms: 20,
        }),
        0,
    );
    let mut sub = d.subscribe();

    d.submit(&sources).await;
    // wait until every worker is running
    let mut started = 0;
    while started < 3 {
        let event = timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        if event.kind == EventKind::Started {
            started += 1;
        }
    }

    assert_eq!(d.clear_all().await, 3);
    // whatever was published before the clear
    while sub.try_recv().is_some() {}

    sleep(Duration::from_millis(200)).await;
    assert!(sub.try_recv().is_none());

    let snapshot = d.snapshot().await;
    assert!(snapshot.tasks.is_empty());
    assert_eq!(snapshot.counts.total, 0);
    assert!(!d.batch_ready());
    for name in ["a", "b", "c"] {
        assert!(!dir.path().join(format!("{name}_compressed.png")).exists());
    }

    // the same paths can be submitted again afterwards
    let again = d.submit(&sources).await;
    assert_eq!(again.accepted.len(), 3);
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn bounded_pool_keeps_the_rest_pending() {
    let dir = tempdir().unwrap();
    let sources = write_sources(&dir, &["a.png", "b.png", "c.png", "d.png"]);
    let d = dispatcher(
        EngineConfig {
            max_concurrency: Some(1),
            ..config(PacingPolicy {
                steps: 10,
                step_delay_ms: 2,
            })
        },
        0,
    );
    let mut sub = d.subscribe();

    d.submit(&sources).await;
    let events = collect(&mut sub, 4).await;

    assert!(events.iter().all(|e| e.counts.processing <= 1));
    assert!(events.iter().any(|e| e.counts.pending > 0));
    assert_eq!(events.last().unwrap().counts.completed, 4);
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn slow_codec_hits_the_deadline() {
    let dir = tempdir().unwrap();
    let sources = write_sources(&dir, &["slow.png"]);
    let d = dispatcher(
        EngineConfig {
            task_timeout_ms: Some(20),
            ..config(PacingPolicy::instant())
        },
        5_000,
    );
    let mut sub = d.subscribe();

    d.submit(&sources).await;
    let events = collect(&mut sub, 1).await;
    match &events.last().unwrap().kind {
        EventKind::Failed { reason, .. } => assert!(reason.contains("timed out")),
        other => panic!("expected failure, got {other:?}"),
    }
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn deadline_failure_leaves_no_output_behind() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("large.png");
    let img: RgbImage = ImageBuffer::from_fn(1200, 1200, |x, y| {
        Rgb([(x % 251) as u8, (y % 241) as u8, ((x * y) % 239) as u8])
    });
    img.save(&input).unwrap();

    // the real image codec, with a deadline no encode of this size can meet
    let d = DispatcherBuilder::new(EngineConfig {
        task_timeout_ms: Some(1),
        ..config(PacingPolicy::instant())
    })
    .build()
    .unwrap();
    let mut sub = d.subscribe();

    d.submit([&input]).await;
    let events = collect(&mut sub, 1).await;
    assert!(matches!(
        &events.last().unwrap().kind,
        EventKind::Failed { reason, .. } if reason.contains("timed out")
    ));

    // give the abandoned encode time to run to completion
    sleep(Duration::from_secs(2)).await;
    assert!(!dir.path().join("large_compressed.png").exists());
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn panicking_codec_fails_only_its_own_task() {
    let dir = tempdir().unwrap();
    let sources = write_sources(&dir, &["a.png", "panic.png", "b.png"]);
    let d = dispatcher(config(PacingPolicy::instant()), 0);
    let mut sub = d.subscribe();

    d.submit(&sources).await;
    let events = collect(&mut sub, 3).await;

    let counts = events.last().unwrap().counts;
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.failed, 1);
    assert!(counts.is_idle());

    let panicked = TaskId::from_path(&sources[1]).unwrap();
    let task = d.task(&panicked).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.error.unwrap().contains("codec panicked"));
    assert!(!dir.path().join("panic_compressed.png").exists());
    assert!(logs_contain("codec panicked"));
    d.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn single_retrieval_needs_a_completed_task() {
    let dir = tempdir().unwrap();
    let out = tempdir().unwrap();
    let sources = write_sources(&dir, &["a.png", "corrupt.png"]);
    let d = dispatcher(config(PacingPolicy::instant()), 0);
    let mut sub = d.subscribe();

    let report = d.submit(&sources).await;
    collect(&mut sub, 2).await;
    let (good, bad) = (&report.accepted[0], &report.accepted[1]);

    assert_eq!(
        d.output_path(good).await.unwrap(),
        dir.path().join("a_compressed.png")
    );
    let target = out.path().join("copy.png");
    d.export_one(good, &target).await.unwrap();
    assert_eq!(
        std::fs::read(&target).unwrap(),
        std::fs::read(dir.path().join("a_compressed.png")).unwrap()
    );

    assert!(matches!(
        d.output_path(bad).await,
        Err(SquashError::NotFound(_))
    ));
    let unknown = TaskId::from_path(dir.path().join("nope.png")).unwrap();
    assert!(matches!(
        d.export_one(&unknown, &target).await,
        Err(SquashError::NotFound(_))
    ));
    d.shutdown().await;
}

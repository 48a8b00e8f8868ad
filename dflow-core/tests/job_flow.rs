// End-to-end job lifecycle: create from a file, process, interrupt, resume.

use rand::rngs::StdRng;
use rand::SeedableRng;

use dflow_core::{
    CancelToken, ChunkMode, ChunkStatus, Dflow, Item, JobOptions, JobRegistry,
    ProcessingError, Workspace,
};

fn sum_items(items: &[Item]) -> Result<Vec<String>, ProcessingError> {
    let mut sum: i64 = 0;
    for item in items {
        let text = item
            .as_text()
            .ok_or_else(|| ProcessingError::new("expected text items"))?;
        sum += text
            .parse::<i64>()
            .map_err(|e| ProcessingError::new(e.to_string()))?;
    }
    Ok(vec![sum.to_string()])
}

fn opts(items_per_chunk: u64, queue_limit: usize) -> JobOptions {
    JobOptions {
        mode: ChunkMode::Line,
        delimiter: b"\n".to_vec(),
        items_per_chunk,
        queue_limit,
    }
}

#[test]
fn create_run_and_register() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::open(dir.path().join("ws")).unwrap();
    let file = dir.path().join("numbers.txt");
    std::fs::write(&file, b"1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n").unwrap();

    let mut job =
        Dflow::create_with_rng(&ws, &file, opts(3, 2), StdRng::seed_from_u64(42)).unwrap();
    assert_eq!(job.total_chunks(), 4);

    let mut registry = JobRegistry::load(dir.path().join("jobs.json")).unwrap();
    registry.add(job.entry().unwrap()).unwrap();

    let summary = job.run(&sum_items, &CancelToken::new()).unwrap();
    assert_eq!(summary.done, 4);
    assert_eq!(job.ledger().result(0), Some(&["6".to_string()][..]));
    assert_eq!(job.ledger().result(3), Some(&["10".to_string()][..]));

    // Registered entry round-trips and can rebuild the finished job.
    let registry = JobRegistry::load(dir.path().join("jobs.json")).unwrap();
    let entry = registry.get_by_fingerprint(job.fingerprint()).unwrap();
    let resumed = Dflow::from_entry(&ws, entry, 2).unwrap();
    assert_eq!(resumed.unused_len(), 0);
    assert_eq!(resumed.ledger().status_counts(), (0, 4, 0));
}

#[test]
fn interrupted_run_resumes_without_reprocessing() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::open(dir.path().join("ws")).unwrap();
    let file = dir.path().join("numbers.txt");
    let body: String = (1..=20).map(|n| format!("{n}\n")).collect();
    std::fs::write(&file, body).unwrap();

    let fingerprint;
    {
        let mut job =
            Dflow::create_with_rng(&ws, &file, opts(2, 3), StdRng::seed_from_u64(1)).unwrap();
        fingerprint = job.fingerprint().to_string();
        let cancel = CancelToken::new();
        let counter = std::cell::Cell::new(0usize);
        // Bail out after three chunks to simulate an interruption.
        let partial = |items: &[Item]| -> Result<Vec<String>, ProcessingError> {
            counter.set(counter.get() + 1);
            if counter.get() == 3 {
                cancel.cancel();
            }
            sum_items(items)
        };
        let summary = job.run(&partial, &cancel).unwrap();
        assert_eq!(summary.done, 3);
    }

    // Fresh controller: already-recorded chunks are excluded.
    let mut job =
        Dflow::create_with_rng(&ws, &file, opts(2, 3), StdRng::seed_from_u64(2)).unwrap();
    let recorded_before = job.ledger().recorded_indices().len();
    assert_eq!(job.unused_len(), 10 - recorded_before);

    let summary = job.run(&sum_items, &CancelToken::new()).unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(job.ledger().indices_by_status(ChunkStatus::Done).len(), 10);
    assert_eq!(job.ledger().status_counts(), (0, 10, 0));
    assert_eq!(job.fingerprint(), fingerprint);

    // Chunk results are intact across the restart.
    assert_eq!(job.ledger().result(0), Some(&["3".to_string()][..])); // 1+2
    assert_eq!(job.ledger().result(9), Some(&["39".to_string()][..])); // 19+20
}

#[test]
fn identical_files_share_one_index_and_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::open(dir.path().join("ws")).unwrap();
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.txt");
    std::fs::write(&a, b"x\ny\nz\n").unwrap();
    std::fs::write(&b, b"x\ny\nz\n").unwrap();

    let mut job_a =
        Dflow::create_with_rng(&ws, &a, opts(1, 3), StdRng::seed_from_u64(3)).unwrap();
    let echo = |items: &[Item]| -> Result<Vec<String>, ProcessingError> {
        Ok(items
            .iter()
            .filter_map(|i| i.as_text().map(str::to_string))
            .collect())
    };
    job_a.run(&echo, &CancelToken::new()).unwrap();

    // Same bytes at a different path: same fingerprint, same ledger, so the
    // second job sees everything already done.
    let job_b = Dflow::create_with_rng(&ws, &b, opts(1, 3), StdRng::seed_from_u64(4)).unwrap();
    assert_eq!(job_b.fingerprint(), job_a.fingerprint());
    assert_eq!(job_b.unused_len(), 0);
    assert_eq!(job_b.ledger().status_counts(), (0, 3, 0));
}

#[test]
fn out_of_range_request_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::open(dir.path().join("ws")).unwrap();
    let file = dir.path().join("ten.txt");
    std::fs::write(&file, b"1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n").unwrap();

    let index = ws
        .index_store()
        .load_or_build(&file, ChunkMode::Line, b"", 3)
        .unwrap();
    let mut reader = dflow_core::ChunkReader::open(&file).unwrap();
    assert!(reader.read_items(&index, 99).unwrap().is_empty());
}

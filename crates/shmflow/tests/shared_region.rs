use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use shmflow::{
    BlockKind, CollectingSink, FlowId, FlowKey, ManualClock, PutOutcome, Segment, ShardConfig,
    ShardPool, ShmflowConfig, ShmflowError, Side, StoreConfig, create_store, open_store,
};
use tempfile::TempDir;

fn flow(raw: u32) -> FlowId {
    FlowId::new(raw).expect("flow id fits in 31 bits")
}

fn file_config(dir: &TempDir, block_capacity: u32, max_blocks: u32) -> ShmflowConfig {
    ShmflowConfig {
        region_path: Some(dir.path().join("flows.shm")),
        store: StoreConfig {
            block_capacity,
            max_blocks,
            ..StoreConfig::default()
        },
        shards: ShardConfig::default(),
    }
}

fn region_path(config: &ShmflowConfig) -> &Path {
    config.region_path.as_deref().expect("file-backed config")
}

/// Format a store and close it again.
fn formatted(dir: &TempDir) -> ShmflowConfig {
    let config = file_config(dir, 256, 8);
    drop(create_store(&config).expect("create store"));
    config
}

fn overwrite(path: &Path, offset: u64, bytes: &[u8]) {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open region file");
    file.write_all_at(bytes, offset).expect("write region file");
}

fn attach_error(config: &ShmflowConfig) -> ShmflowError {
    open_store(config).expect_err("attach should reject the region")
}

// ---------------------------------------------------------------------------
// Cross-handle visibility
// ---------------------------------------------------------------------------

#[test]
fn test_writer_and_reader_share_blocks() {
    let dir = TempDir::new().expect("tempdir");
    let config = file_config(&dir, 256, 16);
    let clock = ManualClock::default();
    let writer = create_store(&config)
        .expect("create store")
        .with_clock(Arc::new(clock.clone()));
    let reader = open_store(&config)
        .expect("open store")
        .with_clock(Arc::new(clock.clone()));

    let outcome = writer
        .put(&Segment::new(flow(3), Side::Source, 500, b"shared bytes".to_vec()))
        .expect("put");
    assert_eq!(outcome, PutOutcome::NewBlock);

    // Nothing is drainable before the grace window.
    assert!(reader.get().expect("get").is_none());

    clock.advance(Duration::from_millis(150));
    assert_eq!(reader.mark_expired_blocks().expect("sweep"), 1);
    clock.advance(Duration::from_millis(101));

    let marker = reader.get().expect("get").expect("marker visible to reader");
    assert_eq!(marker.kind(), BlockKind::StartFlow);
    assert_eq!(marker.initial_seq(), Some(500));
    assert!(reader.erase(&marker.handle()).expect("erase"));

    let block = writer
        .lower_bound_block(FlowKey::range_start(flow(3), Side::Source))
        .expect("lookup")
        .expect("payload block");
    assert!(block.kind().is_payload());
    assert!(block.is_ready());
    let frames: Vec<_> = block.segments().collect();
    assert_eq!(frames, vec![(500, &b"shared bytes"[..])]);

    assert!(writer.erase(&block.handle()).expect("erase"));
    assert!(!reader.erase(&block.handle()).expect("erase twice"));
    assert_eq!(reader.stats().expect("stats").entries, 0);
}

#[test]
fn test_open_store_formats_missing_file() {
    let dir = TempDir::new().expect("tempdir");
    let config = file_config(&dir, 256, 4);
    assert!(!region_path(&config).exists());
    let store = open_store(&config).expect("open store");
    assert!(region_path(&config).exists());
    assert_eq!(store.stats().expect("stats").max_blocks, 4);
}

#[test]
fn test_open_store_keeps_existing_entries() {
    let dir = TempDir::new().expect("tempdir");
    let config = file_config(&dir, 256, 8);
    let first = open_store(&config).expect("open store");
    first
        .put(&Segment::new(flow(4), Side::Source, 10, b"kept".to_vec()))
        .expect("put");

    let second = open_store(&config).expect("reopen store");
    assert_eq!(second.stats().expect("stats").entries, 2);
}

#[test]
fn test_concurrent_open_shares_one_store() {
    let dir = TempDir::new().expect("tempdir");
    let config = Arc::new(file_config(&dir, 256, 8));
    let barrier = Arc::new(Barrier::new(4));

    let openers: Vec<_> = (0..4_u32)
        .map(|raw| {
            let config = Arc::clone(&config);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let store = open_store(&config).expect("open store");
                store
                    .put(&Segment::new(flow(raw + 1), Side::Source, 100, vec![7_u8; 16]))
                    .expect("put");
                store
            })
        })
        .collect();
    let stores: Vec<_> = openers
        .into_iter()
        .map(|opener| opener.join().expect("opener thread"))
        .collect();

    // Marker plus payload block per flow, all in one region.
    for store in &stores {
        assert_eq!(store.stats().expect("stats").entries, 8);
    }
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .map(|entry| entry.expect("dir entry").file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("flows.shm")]);
}

#[test]
fn test_attach_uses_header_geometry() {
    let dir = TempDir::new().expect("tempdir");
    let config = formatted(&dir);
    let mismatched = ShmflowConfig {
        store: StoreConfig {
            block_capacity: 512,
            max_blocks: 32,
            ..StoreConfig::default()
        },
        ..config
    };
    let stats = open_store(&mismatched)
        .expect("open store")
        .stats()
        .expect("stats");
    assert_eq!((stats.block_capacity, stats.max_blocks), (256, 8));
}

// ---------------------------------------------------------------------------
// Header validation
// ---------------------------------------------------------------------------

#[test]
fn test_bad_magic_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let config = formatted(&dir);
    overwrite(region_path(&config), 0, b"NOTSTORE");
    let err = attach_error(&config);
    assert!(matches!(err, ShmflowError::BadMagic), "{err}");
    assert!(err.is_layout_error());
}

#[test]
fn test_version_mismatch_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let config = formatted(&dir);
    overwrite(region_path(&config), 8, &99_u32.to_le_bytes());
    let err = attach_error(&config);
    assert!(
        matches!(err, ShmflowError::VersionMismatch { expected: 1, found: 99 }),
        "{err}"
    );
    assert!(err.is_layout_error());
}

#[test]
fn test_checksum_mismatch_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let config = formatted(&dir);
    // Block capacity is covered by the checksum.
    overwrite(region_path(&config), 12, &4096_u32.to_le_bytes());
    let err = attach_error(&config);
    assert!(matches!(err, ShmflowError::ChecksumMismatch), "{err}");
    assert!(err.is_layout_error());
}

#[test]
fn test_truncated_region_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let config = formatted(&dir);
    OpenOptions::new()
        .write(true)
        .open(region_path(&config))
        .expect("open region file")
        .set_len(1024)
        .expect("truncate");
    let err = attach_error(&config);
    assert!(matches!(err, ShmflowError::RegionTooSmall { .. }), "{err}");
    assert!(err.is_layout_error());
}

// ---------------------------------------------------------------------------
// Store exhaustion
// ---------------------------------------------------------------------------

#[test]
fn test_full_store_drops_then_recovers() {
    let dir = TempDir::new().expect("tempdir");
    let config = file_config(&dir, 256, 4);
    let store = create_store(&config).expect("create store");
    let put = |raw: u32, seq: u32| {
        store
            .put(&Segment::new(flow(raw), Side::Source, seq, vec![1_u8; 32]))
            .expect("put")
    };

    // Marker plus one payload block per flow.
    assert_eq!(put(1, 100), PutOutcome::NewBlock);
    assert_eq!(put(2, 100), PutOutcome::NewBlock);
    assert_eq!(store.stats().expect("stats").free_slots, 0);

    assert_eq!(put(3, 100), PutOutcome::Dropped);
    assert_eq!(put(1, 5000), PutOutcome::Dropped);
    // Contiguous data still fits the open block.
    assert_eq!(put(1, 132), PutOutcome::Appended);

    let first = store
        .lower_bound_block(FlowKey::range_start(flow(1), Side::Source))
        .expect("lookup")
        .expect("flow 1 marker");
    let second = store
        .next_block(&first.handle())
        .expect("next")
        .expect("flow 1 block");
    assert!(store.erase(&first.handle()).expect("erase"));
    assert!(store.erase(&second.handle()).expect("erase"));

    assert_eq!(put(3, 100), PutOutcome::NewBlock);
    assert_eq!(store.stats().expect("stats").entries, 4);
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

#[test]
fn test_shard_pool_drains_file_backed_store() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = file_config(&dir, 512, 128);
    config.shards = ShardConfig {
        handler_count: 2,
        idle_check_interval_us: 10_000,
        ..ShardConfig::default()
    };
    let store = Arc::new(open_store(&config).expect("open store"));
    let sink = CollectingSink::new();

    let mut expected = Vec::new();
    for raw in 1..=3_u32 {
        let mut stream = Vec::new();
        let mut seq = raw * 1_000;
        for chunk in 0..20_u8 {
            let payload = vec![chunk.wrapping_add(u8::try_from(raw).expect("small")); 97];
            store
                .put(&Segment::new(flow(raw), Side::Destination, seq, payload.clone()))
                .expect("put");
            seq = seq.wrapping_add(97);
            stream.extend(payload);
        }
        expected.push((flow(raw), stream));
    }
    let total: usize = expected.iter().map(|(_, s)| s.len()).sum();

    let pool = ShardPool::spawn(
        Arc::clone(&store),
        Arc::new(sink.clone()),
        config.shards.clone(),
    )
    .expect("spawn pool");
    let deadline = Instant::now() + Duration::from_secs(10);
    while sink.total_bytes() < total && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    pool.shutdown().expect("shutdown");

    assert_eq!(sink.total_bytes(), total);
    for (id, stream) in &expected {
        assert_eq!(&sink.stream(*id, Side::Destination), stream, "flow {id}");
    }
    let mut started = sink.started_flows();
    started.sort_unstable();
    assert_eq!(started, vec![flow(1), flow(2), flow(3)]);
    assert!(sink.gaps().is_empty());
}

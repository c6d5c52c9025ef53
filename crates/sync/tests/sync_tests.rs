//! End-to-end sync sessions between two in-memory chunk stores, wired over
//! in-process duplex pipes exactly like a real transport would be.

use coffer_core::shuffle::{Slot, StreamShuffler};
use coffer_core::{ChunkKey, Manifest, Permutation};
use coffer_store::{ChunkStore, File};
use coffer_sync::{Builder, SyncError, write_chunk_data};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

fn store_file(store: &ChunkStore, label: &str, data: &[u8]) -> File {
    let mut temp = store.create(label);
    temp.write(data).unwrap();
    temp.close().unwrap()
}

struct SessionOutcome {
    file: SyncResultFile,
    bytes_transferred: u64,
    final_bytes_to_transfer: u64,
}

type SyncResultFile = Result<File, SyncError>;

/// Run a full session: wishlist, chunk-body stream and reconstruction as
/// three concurrent tasks over duplex pipes.
async fn run_session(
    source: &File,
    receiver_store: &ChunkStore,
    perm: &Permutation,
    window_size: usize,
) -> SessionOutcome {
    let manifest = source.manifest(perm.clone());
    let builder = Arc::new(Builder::new(
        receiver_store.clone(),
        manifest,
        window_size,
        format!("recovered {}", source.label()),
    ));

    let (wishlist_rx, wishlist_tx) = tokio::io::duplex(4096);
    let (body_rx, body_tx) = tokio::io::duplex(4096);

    let wishlist_task = tokio::spawn({
        let builder = Arc::clone(&builder);
        async move { builder.write_wishlist(wishlist_tx).await }
    });

    let transferred = Arc::new(AtomicU64::new(0));
    let to_transfer = Arc::new(AtomicU64::new(0));
    let sender_task = tokio::spawn({
        let file = source.clone();
        let perm = perm.clone();
        let transferred = Arc::clone(&transferred);
        let to_transfer = Arc::clone(&to_transfer);
        async move {
            let mut status = |remaining: u64, sent: u64| {
                to_transfer.store(remaining, Ordering::SeqCst);
                transferred.store(sent, Ordering::SeqCst);
            };
            write_chunk_data(&file, wishlist_rx, &perm, body_tx, Some(&mut status)).await
        }
    });

    let file = builder.reconstruct(body_rx).await;
    wishlist_task.await.unwrap().unwrap();
    sender_task.await.unwrap().unwrap();

    SessionOutcome {
        file,
        bytes_transferred: transferred.load(Ordering::SeqCst),
        final_bytes_to_transfer: to_transfer.load(Ordering::SeqCst),
    }
}

/// After a session, nothing may stay locked once the files are dropped.
fn assert_store_drains(store: &ChunkStore) {
    store.free_cache();
    let usage = store.usage();
    assert_eq!(usage.locked, 0, "leaked handles: {usage}");
    assert_eq!(usage.used, 0, "undrainable store: {usage}");
}

#[tokio::test]
async fn test_identical_files_transfer_nothing() {
    let mut rng = StdRng::seed_from_u64(101);
    let data = random_bytes(&mut rng, 64 * 1024);
    let store_a = ChunkStore::new(8 * 1024 * 1024);
    let store_b = ChunkStore::new(8 * 1024 * 1024);

    let source = store_file(&store_a, "source", &data);
    let preloaded = store_file(&store_b, "preloaded", &data);

    let perm = Permutation::random(64, &mut rng);
    let outcome = run_session(&source, &store_b, &perm, 8).await;
    let rebuilt = outcome.file.unwrap();

    assert_eq!(&rebuilt.to_bytes()[..], &data[..]);
    assert_eq!(outcome.bytes_transferred, 0);
    assert_eq!(outcome.final_bytes_to_transfer, 0);

    drop((source, preloaded, rebuilt));
    assert_store_drains(&store_a);
    assert_store_drains(&store_b);
}

#[tokio::test]
async fn test_disjoint_files_transfer_everything() {
    let mut rng = StdRng::seed_from_u64(102);
    let data = random_bytes(&mut rng, 64 * 1024);
    let store_a = ChunkStore::new(8 * 1024 * 1024);
    let store_b = ChunkStore::new(8 * 1024 * 1024);

    let source = store_file(&store_a, "source", &data);
    let perm = Permutation::random(64, &mut rng);
    let outcome = run_session(&source, &store_b, &perm, 8).await;
    let rebuilt = outcome.file.unwrap();

    assert_eq!(&rebuilt.to_bytes()[..], &data[..]);
    assert_eq!(outcome.bytes_transferred, data.len() as u64);
    assert_eq!(outcome.final_bytes_to_transfer, data.len() as u64);

    drop((source, rebuilt));
    assert_store_drains(&store_a);
    assert_store_drains(&store_b);
}

#[tokio::test]
async fn test_partial_overlap_transfers_only_missing() {
    let mut rng = StdRng::seed_from_u64(103);
    let store_a = ChunkStore::new(64 * 1024 * 1024);
    let store_b = ChunkStore::new(64 * 1024 * 1024);

    // Source is a concatenation of segments; the receiver already holds
    // every other segment as a file of its own. Segments are much larger
    // than the average chunk, so the chunkings resynchronize inside each
    // shared segment and most of its chunks match.
    let mut source_data = Vec::new();
    let mut preloaded = Vec::new();
    for i in 0..24 {
        let segment_len = rng.random_range(32768..65536);
        let segment = random_bytes(&mut rng, segment_len);
        source_data.extend_from_slice(&segment);
        if i % 2 == 0 {
            preloaded.push(store_file(&store_b, "segment", &segment));
        }
    }
    let source = store_file(&store_a, "source", &source_data);

    let perm = Permutation::random(256, &mut rng);
    let outcome = run_session(&source, &store_b, &perm, 16).await;
    let rebuilt = outcome.file.unwrap();

    assert_eq!(&rebuilt.to_bytes()[..], &source_data[..]);
    assert!(outcome.bytes_transferred > 0);
    assert!(
        outcome.bytes_transferred < source_data.len() as u64,
        "expected cached segments to be skipped"
    );

    drop((source, rebuilt));
    drop(preloaded);
    assert_store_drains(&store_a);
    assert_store_drains(&store_b);
}

#[tokio::test]
async fn test_dispose_before_start() {
    let mut rng = StdRng::seed_from_u64(104);
    let store_a = ChunkStore::new(8 * 1024 * 1024);
    let store_b = ChunkStore::new(8 * 1024 * 1024);
    let source = store_file(&store_a, "source", &random_bytes(&mut rng, 32 * 1024));

    let builder = Builder::new(
        store_b.clone(),
        source.manifest(Permutation::random(10, &mut rng)),
        8,
        "disposed before start",
    );
    builder.dispose();

    let mut wishlist = Vec::new();
    assert!(matches!(
        builder.write_wishlist(&mut wishlist).await,
        Err(SyncError::Disposed)
    ));
    assert!(matches!(
        builder.reconstruct(&b""[..]).await,
        Err(SyncError::Disposed)
    ));
    assert!(wishlist.is_empty());
    assert_store_drains(&store_b);
}

#[tokio::test]
async fn test_dispose_unblocks_wishlist() {
    let mut rng = StdRng::seed_from_u64(105);
    let store_a = ChunkStore::new(8 * 1024 * 1024);
    let store_b = ChunkStore::new(8 * 1024 * 1024);
    let source = store_file(&store_a, "source", &random_bytes(&mut rng, 256 * 1024));

    // Nobody consuming memos: the wishlist task fills the window, blocks,
    // and must be unblocked by dispose().
    let builder = Arc::new(Builder::new(
        store_b.clone(),
        source.manifest(Permutation::random(4, &mut rng)),
        8,
        "blocked",
    ));
    let wishlist_task = tokio::spawn({
        let builder = Arc::clone(&builder);
        async move { builder.write_wishlist(Vec::new()).await }
    });

    tokio::task::yield_now().await;
    builder.dispose();
    assert!(matches!(
        wishlist_task.await.unwrap(),
        Err(SyncError::Disposed)
    ));

    drop(builder);
    drop(source);
    assert_store_drains(&store_a);
    assert_store_drains(&store_b);
}

#[tokio::test]
async fn test_trivial_permutation() {
    let mut rng = StdRng::seed_from_u64(106);
    let data = random_bytes(&mut rng, 96 * 1024);
    let store_a = ChunkStore::new(8 * 1024 * 1024);
    let store_b = ChunkStore::new(8 * 1024 * 1024);

    let source = store_file(&store_a, "source", &data);
    let outcome = run_session(&source, &store_b, &Permutation::trivial(), 8).await;
    assert_eq!(&outcome.file.unwrap().to_bytes()[..], &data[..]);
}

#[tokio::test]
async fn test_permutation_longer_than_manifest() {
    let mut rng = StdRng::seed_from_u64(107);
    let data = random_bytes(&mut rng, 20 * 1024);
    let store_a = ChunkStore::new(8 * 1024 * 1024);
    let store_b = ChunkStore::new(8 * 1024 * 1024);

    let source = store_file(&store_a, "source", &data);
    assert!(source.chunk_count() < 100);

    let perm = Permutation::random(100, &mut rng);
    let outcome = run_session(&source, &store_b, &perm, 8).await;
    assert_eq!(&outcome.file.unwrap().to_bytes()[..], &data[..]);
}

#[tokio::test]
async fn test_empty_file() {
    let mut rng = StdRng::seed_from_u64(108);
    let store_a = ChunkStore::new(1024 * 1024);
    let store_b = ChunkStore::new(1024 * 1024);

    let source = store_file(&store_a, "empty", b"");
    let perm = Permutation::random(16, &mut rng);
    let outcome = run_session(&source, &store_b, &perm, 4).await;
    let rebuilt = outcome.file.unwrap();
    assert_eq!(rebuilt.size(), 0);
    assert_eq!(outcome.bytes_transferred, 0);
}

#[tokio::test]
async fn test_repeated_content_is_requested_once() {
    let mut rng = StdRng::seed_from_u64(109);
    let store_a = ChunkStore::new(8 * 1024 * 1024);
    let store_b = ChunkStore::new(8 * 1024 * 1024);

    // A file that repeats the same block: duplicate chunks may only be
    // requested (and transmitted) once.
    let block = random_bytes(&mut rng, 256 * 1024);
    let mut data = Vec::new();
    for _ in 0..4 {
        data.extend_from_slice(&block);
    }
    let source = store_file(&store_a, "source", &data);

    let perm = Permutation::random(32, &mut rng);
    let outcome = run_session(&source, &store_b, &perm, 8).await;
    assert_eq!(&outcome.file.unwrap().to_bytes()[..], &data[..]);
    assert!(
        outcome.bytes_transferred < data.len() as u64,
        "duplicate chunks must not be retransmitted"
    );
    assert_eq!(outcome.bytes_transferred, store_b.usage().used);
}

#[tokio::test]
async fn test_wishlist_law() {
    let mut rng = StdRng::seed_from_u64(110);
    let store_a = ChunkStore::new(64 * 1024 * 1024);
    let store_b = ChunkStore::new(64 * 1024 * 1024);

    let mut source_data = Vec::new();
    let mut preloaded = Vec::new();
    for i in 0..40 {
        let segment_len = rng.random_range(4096..16384);
        let segment = random_bytes(&mut rng, segment_len);
        source_data.extend_from_slice(&segment);
        if i % 3 == 0 {
            preloaded.push(store_file(&store_b, "segment", &segment));
        }
    }
    let source = store_file(&store_a, "source", &source_data);
    let perm = Permutation::random(37, &mut rng);
    let manifest = source.manifest(perm.clone());

    // The i-th wishlist bit (shuffled order) must be set iff the chunk is
    // absent from the receiver's store and no earlier shuffled position
    // already claimed the same key. Compute that independently up front.
    let mut expected_bits = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut shuffler = StreamShuffler::new(&perm);
    let mut expect = |slot: Slot<coffer_core::ChunkInfo>,
                      seen: &mut std::collections::HashSet<ChunkKey>,
                      bits: &mut Vec<bool>| {
        if let Slot::Value(info) = slot {
            bits.push(!seen.contains(&info.key) && !store_b.contains(&info.key));
            seen.insert(info.key);
        }
    };
    for info in manifest.chunks.iter().copied() {
        let slot = shuffler.put(info);
        expect(slot, &mut seen, &mut expected_bits);
    }
    for slot in shuffler.end() {
        expect(slot, &mut seen, &mut expected_bits);
    }
    assert_eq!(expected_bits.len(), manifest.chunk_count());

    // Window larger than the memo count lets the wishlist run to completion
    // without a consumer.
    let builder = Builder::new(store_b.clone(), manifest, 8192, "law");
    let mut wishlist = Vec::new();
    builder.write_wishlist(&mut wishlist).await.unwrap();

    assert_eq!(wishlist.len(), expected_bits.len().div_ceil(8));
    for (i, &expected) in expected_bits.iter().enumerate() {
        let bit = wishlist[i / 8] & (0x80 >> (i % 8)) != 0;
        assert_eq!(bit, expected, "wishlist bit {i}");
    }
    // Padding bits are zero.
    for i in expected_bits.len()..wishlist.len() * 8 {
        assert_eq!(wishlist[i / 8] & (0x80 >> (i % 8)), 0);
    }
}

#[tokio::test]
async fn test_legacy_manifest_session() {
    let mut rng = StdRng::seed_from_u64(111);
    let data = random_bytes(&mut rng, 48 * 1024);
    let store_a = ChunkStore::new(8 * 1024 * 1024);
    let store_b = ChunkStore::new(8 * 1024 * 1024);
    let source = store_file(&store_a, "source", &data);

    // Ship the manifest in the legacy binary format; the receiver derives
    // the trivial permutation and the session still round-trips.
    let mut encoded = Vec::new();
    source
        .manifest(Permutation::trivial())
        .write_legacy_stream(&mut encoded)
        .unwrap();
    let manifest = Manifest::read_legacy_stream(&encoded[..]).unwrap();
    assert_eq!(manifest.perm, Permutation::trivial());

    let builder = Arc::new(Builder::new(store_b.clone(), manifest, 8, "legacy"));
    let (wishlist_rx, wishlist_tx) = tokio::io::duplex(4096);
    let (body_rx, body_tx) = tokio::io::duplex(4096);
    let wishlist_task = tokio::spawn({
        let builder = Arc::clone(&builder);
        async move { builder.write_wishlist(wishlist_tx).await }
    });
    let sender_task = tokio::spawn({
        let file = source.clone();
        async move {
            write_chunk_data(&file, wishlist_rx, &Permutation::trivial(), body_tx, None).await
        }
    });

    let rebuilt = builder.reconstruct(body_rx).await.unwrap();
    wishlist_task.await.unwrap().unwrap();
    sender_task.await.unwrap().unwrap();
    assert_eq!(&rebuilt.to_bytes()[..], &data[..]);
}

#[tokio::test]
async fn test_corrupted_body_fails_with_unexpected_chunk() {
    let mut rng = StdRng::seed_from_u64(112);
    let data = random_bytes(&mut rng, 32 * 1024);
    let store_a = ChunkStore::new(8 * 1024 * 1024);
    let store_b = ChunkStore::new(8 * 1024 * 1024);
    let source = store_file(&store_a, "source", &data);
    let manifest = source.manifest(Permutation::trivial());

    // Record the honest body stream, then flip a data byte.
    let builder = Builder::new(store_b.clone(), manifest.clone(), 8192, "honest");
    let mut wishlist = Vec::new();
    builder.write_wishlist(&mut wishlist).await.unwrap();
    let mut body = Vec::new();
    write_chunk_data(&source, &wishlist[..], &Permutation::trivial(), &mut body, None)
        .await
        .unwrap();
    drop(builder);
    store_b.free_cache();

    body[20] ^= 0xff;
    let builder = Arc::new(Builder::new(store_b.clone(), manifest, 8, "corrupted"));
    let wishlist_task = tokio::spawn({
        let builder = Arc::clone(&builder);
        async move { builder.write_wishlist(tokio::io::sink()).await }
    });
    let result = builder.reconstruct(&body[..]).await;
    assert!(matches!(result, Err(SyncError::UnexpectedChunk(_))));
    let _ = wishlist_task.await.unwrap();

    assert_store_drains(&store_b);
}

#[tokio::test]
async fn test_trailing_garbage_fails_as_unsolicited() {
    let mut rng = StdRng::seed_from_u64(113);
    let data = random_bytes(&mut rng, 16 * 1024);
    let store_a = ChunkStore::new(8 * 1024 * 1024);
    let store_b = ChunkStore::new(8 * 1024 * 1024);
    let source = store_file(&store_a, "source", &data);
    let manifest = source.manifest(Permutation::trivial());

    let builder = Builder::new(store_b.clone(), manifest.clone(), 8192, "record");
    let mut wishlist = Vec::new();
    builder.write_wishlist(&mut wishlist).await.unwrap();
    let mut body = Vec::new();
    write_chunk_data(&source, &wishlist[..], &Permutation::trivial(), &mut body, None)
        .await
        .unwrap();
    drop(builder);
    store_b.free_cache();

    body.push(0x00);
    let builder = Arc::new(Builder::new(store_b.clone(), manifest, 8192, "garbage"));
    let wishlist_task = tokio::spawn({
        let builder = Arc::clone(&builder);
        async move { builder.write_wishlist(tokio::io::sink()).await }
    });
    let result = builder.reconstruct(&body[..]).await;
    assert!(matches!(result, Err(SyncError::UnsolicitedChunkData)));
    let _ = wishlist_task.await.unwrap();
}

#[tokio::test]
async fn test_truncated_body_fails_as_unexpected_eof() {
    let mut rng = StdRng::seed_from_u64(114);
    let data = random_bytes(&mut rng, 16 * 1024);
    let store_a = ChunkStore::new(8 * 1024 * 1024);
    let store_b = ChunkStore::new(8 * 1024 * 1024);
    let source = store_file(&store_a, "source", &data);
    let manifest = source.manifest(Permutation::trivial());

    let builder = Builder::new(store_b.clone(), manifest.clone(), 8192, "record");
    let mut wishlist = Vec::new();
    builder.write_wishlist(&mut wishlist).await.unwrap();
    let mut body = Vec::new();
    write_chunk_data(&source, &wishlist[..], &Permutation::trivial(), &mut body, None)
        .await
        .unwrap();
    drop(builder);
    store_b.free_cache();

    body.truncate(body.len() - 1);
    let builder = Arc::new(Builder::new(store_b.clone(), manifest, 8192, "truncated"));
    let wishlist_task = tokio::spawn({
        let builder = Arc::clone(&builder);
        async move { builder.write_wishlist(tokio::io::sink()).await }
    });
    let result = builder.reconstruct(&body[..]).await;
    assert!(matches!(result, Err(SyncError::UnexpectedEof)));
    let _ = wishlist_task.await.unwrap();
}

#[tokio::test]
async fn test_short_wishlist_is_a_protocol_error() {
    let mut rng = StdRng::seed_from_u64(115);
    let data = random_bytes(&mut rng, 512 * 1024);
    let store_a = ChunkStore::new(8 * 1024 * 1024);
    let source = store_file(&store_a, "source", &data);
    assert!(source.chunk_count() > 8);

    // Fewer wishlist bytes than ceil(chunks / 8).
    let wishlist = vec![0xffu8];
    let result = write_chunk_data(
        &source,
        &wishlist[..],
        &Permutation::trivial(),
        Vec::new(),
        None,
    )
    .await;
    assert!(matches!(result, Err(SyncError::WishlistTooShort(8))));
}

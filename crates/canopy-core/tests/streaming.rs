//! Streaming construction: parity with in-memory builds, cache capture,
//! cancellation, and scratch hygiene.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use canopy_core::{
    prove_from_leaves, verify, Blake3Hasher, LevelCache, MerkleHash, MerkleTree, MerkleTreeConfig,
    Sha256Hasher, Sha512Hasher, StreamError, StreamingConfig, StreamingTreeBuilder,
};

fn ascii_leaves(prefix: &str, n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| format!("{prefix}{i}").into_bytes()).collect()
}

#[tokio::test]
async fn streaming_matches_in_memory() {
    let leaves = ascii_leaves("data_", 75);

    let tree = MerkleTree::build(Arc::new(Sha256Hasher), &leaves).unwrap();
    let streamed = StreamingTreeBuilder::new(Arc::new(Sha256Hasher))
        .build_iter(leaves.clone())
        .await
        .unwrap();

    assert_eq!(streamed.info, tree.info());

    // Proofs from each construction path agree step for step.
    let from_tree = tree.generate_proof(30).unwrap();
    let from_stream = prove_from_leaves(&Sha256Hasher, &leaves, 30, None).unwrap();
    assert_eq!(from_tree.steps, from_stream.steps);
    assert!(verify(&from_stream, &streamed.info.root, &Sha256Hasher));
}

#[tokio::test]
async fn streaming_matches_in_memory_other_hashes() {
    let leaves = ascii_leaves("hx_", 33);

    let sha512 = StreamingTreeBuilder::new(Arc::new(Sha512Hasher))
        .build_iter(leaves.clone())
        .await
        .unwrap();
    assert_eq!(
        sha512.info.root,
        *MerkleTree::build(Arc::new(Sha512Hasher), &leaves)
            .unwrap()
            .root_hash()
    );

    let blake3 = StreamingTreeBuilder::new(Arc::new(Blake3Hasher))
        .build_iter(leaves.clone())
        .await
        .unwrap();
    assert_eq!(
        blake3.info.root,
        *MerkleTree::build(Arc::new(Blake3Hasher), &leaves)
            .unwrap()
            .root_hash()
    );
}

#[tokio::test]
async fn streaming_single_and_double_leaf() {
    let builder = StreamingTreeBuilder::new(Arc::new(Sha256Hasher));

    let one = builder.build_iter(ascii_leaves("s_", 1)).await.unwrap();
    assert_eq!(one.info.height, 0);
    assert_eq!(one.info.leaf_count, 1);
    assert_eq!(one.info.root, Sha256Hasher.hash(b"s_0"));

    let two = builder.build_iter(ascii_leaves("s_", 2)).await.unwrap();
    assert_eq!(two.info.height, 1);
    assert_eq!(
        two.info.root,
        *MerkleTree::build(Arc::new(Sha256Hasher), &ascii_leaves("s_", 2))
            .unwrap()
            .root_hash()
    );
}

#[tokio::test]
async fn empty_producer_fails() {
    let builder = StreamingTreeBuilder::new(Arc::new(Sha256Hasher));
    let empty: Vec<Vec<u8>> = vec![];
    assert!(matches!(
        builder.build_iter(empty).await,
        Err(StreamError::EmptyInput)
    ));
}

#[tokio::test]
async fn producer_error_propagates() {
    let builder = StreamingTreeBuilder::new(Arc::new(Sha256Hasher));
    let items: Vec<Result<Vec<u8>, StreamError>> = vec![
        Ok(b"good".to_vec()),
        Err(StreamError::Producer("upstream went away".to_string())),
    ];
    let result = builder.build(futures::stream::iter(items)).await;
    assert!(matches!(result, Err(StreamError::Producer(_))));
}

#[tokio::test]
async fn cancellation_stops_the_build() {
    let flag = Arc::new(AtomicBool::new(true));
    let builder = StreamingTreeBuilder::with_config(
        Arc::new(Sha256Hasher),
        StreamingConfig::new().with_cancel_flag(flag),
    );

    let result = builder.build_iter(ascii_leaves("c_", 10)).await;
    assert!(matches!(result, Err(StreamError::Cancelled)));
}

#[tokio::test]
async fn scratch_directory_removed_on_success() {
    let parent = tempfile::tempdir().unwrap();
    let builder = StreamingTreeBuilder::with_config(
        Arc::new(Sha256Hasher),
        StreamingConfig::new().with_scratch_dir(parent.path()),
    );

    builder.build_iter(ascii_leaves("ok_", 50)).await.unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(parent.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "scratch left behind: {leftovers:?}");
}

#[tokio::test]
async fn scratch_directory_removed_on_cancellation() {
    let parent = tempfile::tempdir().unwrap();
    let flag = Arc::new(AtomicBool::new(false));
    let builder = StreamingTreeBuilder::with_config(
        Arc::new(Sha256Hasher),
        StreamingConfig::new()
            .with_scratch_dir(parent.path())
            .with_cancel_flag(flag.clone()),
    );

    // Cancel midway through the leaf phase.
    let leaves = ascii_leaves("mid_", 100);
    let trigger = flag.clone();
    let stream = futures::stream::iter(leaves.into_iter().enumerate().map(move |(i, leaf)| {
        if i == 40 {
            trigger.store(true, Ordering::Relaxed);
        }
        Ok::<Vec<u8>, StreamError>(leaf)
    }));

    let result = builder.build(stream).await;
    assert!(matches!(result, Err(StreamError::Cancelled)));

    let leftovers: Vec<_> = std::fs::read_dir(parent.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "scratch left behind: {leftovers:?}");
}

#[tokio::test]
async fn cache_accelerates_streamed_proofs() {
    let leaves: Vec<Vec<u8>> = (0..100).map(|i| format!("block_{i}").into_bytes()).collect();

    let builder = StreamingTreeBuilder::with_config(
        Arc::new(Sha256Hasher),
        StreamingConfig::new().with_top_levels(3),
    );
    let result = builder.build_iter(leaves.clone()).await.unwrap();
    let cache = result.cache.expect("cache was requested");

    // 100 leaves give height 7; the top three levels sit at 4..=6.
    assert_eq!(result.info.height, 7);
    assert_eq!(cache.band().start, 4);
    assert_eq!(cache.band().end, 6);
    assert!(cache.is_complete());

    let with_cache = prove_from_leaves(&Sha256Hasher, &leaves, 50, Some(&cache)).unwrap();
    let without = prove_from_leaves(&Sha256Hasher, &leaves, 50, None).unwrap();
    assert_eq!(with_cache, without);
    assert!(verify(&with_cache, &result.info.root, &Sha256Hasher));

    let stats = cache.stats();
    assert!(stats.hits > 0, "expected cache hits, got {stats:?}");
}

#[tokio::test]
async fn streamed_cache_equals_in_memory_cache() {
    let leaves = ascii_leaves("same_", 41);

    let streamed = StreamingTreeBuilder::with_config(
        Arc::new(Sha256Hasher),
        StreamingConfig::new().with_top_levels(3),
    )
    .build_iter(leaves.clone())
    .await
    .unwrap();

    let in_memory = MerkleTree::build_with(
        Arc::new(Sha256Hasher),
        &leaves,
        MerkleTreeConfig::new().with_top_levels(3),
    )
    .unwrap();

    assert_eq!(streamed.cache.as_ref(), in_memory.cache());
}

#[tokio::test]
async fn streamed_cache_survives_disk_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("streamed.mtc");
    let leaves = ascii_leaves("disk_", 64);

    let result = StreamingTreeBuilder::with_config(
        Arc::new(Sha256Hasher),
        StreamingConfig::new().with_top_levels(2),
    )
    .build_iter(leaves.clone())
    .await
    .unwrap();

    let cache = result.cache.unwrap();
    cache.save(&path).unwrap();

    let loaded = LevelCache::load(&path).unwrap();
    assert_eq!(loaded, cache);
    assert_eq!(loaded.stats().total_lookups, 0);

    // The reloaded cache serves proofs against the streamed root.
    let proof = prove_from_leaves(&Sha256Hasher, &leaves, 17, Some(&loaded)).unwrap();
    assert!(verify(&proof, &result.info.root, &Sha256Hasher));
    assert!(loaded.stats().hits > 0);
}

#[tokio::test]
async fn explicit_band_capture() {
    let leaves = ascii_leaves("band_", 20); // height 5

    let result = StreamingTreeBuilder::with_config(
        Arc::new(Sha256Hasher),
        StreamingConfig::new().with_cache_band(0, 2),
    )
    .build_iter(leaves.clone())
    .await
    .unwrap();

    let cache = result.cache.unwrap();
    assert_eq!(cache.band().start, 0);
    assert_eq!(cache.band().end, 2);
    assert!(cache.is_complete());

    // Leaf digests were captured verbatim.
    assert_eq!(cache.lookup(0, 3), Some(Sha256Hasher.hash(b"band_3")));
}

#[tokio::test]
async fn band_past_final_height_fails() {
    let leaves = ascii_leaves("short_", 4); // height 2

    let result = StreamingTreeBuilder::with_config(
        Arc::new(Sha256Hasher),
        StreamingConfig::new().with_cache_band(0, 9),
    )
    .build_iter(leaves)
    .await;

    assert!(matches!(result, Err(StreamError::Cache(_))));
}

//! Partial pulls of zstd:chunked layers.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::Arc;

use cstor_chunked::layers_cache::{CACHE_KEY, LAYER_DATA_KEY, MANIFEST_KEY};
use cstor_chunked::{
    ApplyOptions, ChunkedDiffer, ChunkedError, Digest, DifferOutput, DifferTuning, LayersCache,
    OutputFormat, PullOptions,
};

use crate::fixture::{Member, MemoryBlobSource, TestLayer, TestLayerStore, build_tar, zstd_chunked, zstd_chunked_with};
use crate::integration_test;

const CHUNK: usize = 4096;

/// Deterministic incompressible-ish bytes.
fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

fn apply_options() -> ApplyOptions {
    ApplyOptions {
        ignore_chown_errors: true,
        ..Default::default()
    }
}

fn pull_options() -> PullOptions {
    PullOptions {
        enable_partial_images: true,
        ..Default::default()
    }
}

fn tuning() -> DifferTuning {
    DifferTuning {
        auto_merge_threshold: 0,
        ..Default::default()
    }
}

/// Pull `layer` into a new layer `id` of `store`.
fn pull(
    store: &TestLayerStore,
    id: &str,
    layer: &TestLayer,
    source: Arc<MemoryBlobSource>,
    options: PullOptions,
    cache: Option<Arc<LayersCache>>,
    apply: &ApplyOptions,
) -> color_eyre::Result<DifferOutput> {
    let dest = store.stage(id)?;
    let mut differ = ChunkedDiffer::new(source, layer.info(), options, tuning(), cache)?;
    Ok(differ.apply_diff(&dest, apply)?)
}

fn base_layer(big: &[u8], sparse: &[u8]) -> color_eyre::Result<TestLayer> {
    let tar = build_tar(&[
        Member::Dir("etc"),
        Member::File("etc/hostname", b"box\n".to_vec()),
        Member::File("etc/empty", Vec::new()),
        Member::Dir("usr"),
        Member::File("usr/big", big.to_vec()),
        Member::File("usr/sparse", sparse.to_vec()),
        Member::Symlink("usr/link", "big"),
        Member::HardLink("usr/big2", "usr/big"),
    ])?;
    zstd_chunked(&tar, CHUNK)
}

fn sparse_content() -> Vec<u8> {
    let mut sparse = vec![0u8; 2 * CHUNK];
    sparse.extend(noise(100, 2));
    sparse
}

integration_test!(test_partial_pull_without_local_content, || {
    let big = noise(10_000, 1);
    let sparse = sparse_content();
    let layer = base_layer(&big, &sparse)?;
    let store = TestLayerStore::new()?;
    let source = MemoryBlobSource::new(layer.blob.clone(), None);

    let dest = store.stage("a")?;
    let mut differ = ChunkedDiffer::new(source.clone(), layer.info(), pull_options(), tuning(), None)?;
    assert!(!differ.is_converting());
    let out = differ.apply_diff(&dest, &apply_options())?;

    assert_eq!(out.uncompressed_digest, Some(layer.diff_id()));
    assert_eq!(out.size, Some(layer.tar.len() as u64));
    assert_eq!(out.toc_digest, layer.toc_digest());
    assert_eq!(out.compressed_digest, None);
    assert!(out.big_data.contains_key(MANIFEST_KEY));
    assert!(out.tar_split.is_some());
    assert_eq!(out.uids, vec![0]);
    assert_eq!(out.gids, vec![0]);

    assert_eq!(dest.read("etc/hostname")?, b"box\n");
    assert_eq!(dest.read("etc/empty")?, b"");
    assert_eq!(dest.read("usr/big")?, big);
    assert_eq!(dest.read("usr/sparse")?, sparse);
    let link = std::fs::read_link(store.path_in_layer("a", "usr/link"))?;
    assert_eq!(link.to_str(), Some("big"));
    let big_md = std::fs::metadata(store.path_in_layer("a", "usr/big"))?;
    let big2_md = std::fs::metadata(store.path_in_layer("a", "usr/big2"))?;
    assert_eq!(big_md.ino(), big2_md.ino());
    assert_eq!(big_md.permissions().mode() & 0o7777, 0o644);
    assert_eq!(big_md.mtime(), 1_700_000_000);

    let stats = &out.stats;
    assert_eq!(stats.files, 3);
    assert_eq!(stats.total_bytes, 4 + big.len() as u64 + sparse.len() as u64);
    // The zero chunks of the sparse file are never fetched.
    assert_eq!(stats.missing_bytes, stats.total_bytes - 2 * CHUNK as u64);
    assert!(stats.bytes_fetched > 0);
    // One request for the TOC and tar-split, one for the content.
    assert_eq!(source.requests().len(), 2);

    let again = differ.apply_diff(&dest, &apply_options());
    assert!(matches!(again, Err(ChunkedError::DifferAlreadyUsed)));
    Ok(())
});

integration_test!(test_files_reused_from_other_layers, || {
    let big = noise(10_000, 1);
    let sparse = sparse_content();
    let store = TestLayerStore::new()?;
    let first = base_layer(&big, &sparse)?;
    let out = pull(
        &store,
        "a",
        &first,
        MemoryBlobSource::new(first.blob.clone(), None),
        pull_options(),
        None,
        &apply_options(),
    )?;
    store.commit("a", &out, false)?;

    let tar = build_tar(&[
        Member::Dir("srv"),
        Member::File("srv/hostname", b"box\n".to_vec()),
        Member::File("srv/big", big.clone()),
        Member::File("srv/sparse", sparse.clone()),
        Member::File("srv/new", b"only here".to_vec()),
    ])?;
    let second = zstd_chunked(&tar, CHUNK)?;
    let cache = LayersCache::open(store.clone())?;
    assert_eq!(cache.len(), 1);
    let source = MemoryBlobSource::new(second.blob.clone(), None);
    let out = pull(&store, "b", &second, source.clone(), pull_options(), Some(cache), &apply_options())?;

    assert_eq!(out.uncompressed_digest, Some(second.diff_id()));
    assert_eq!(out.stats.files, 4);
    assert_eq!(out.stats.files_copied, 3);
    assert_eq!(out.stats.missing_bytes, b"only here".len() as u64);
    let requests = source.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].len(), 1);

    let dest = store.stage("b")?;
    assert_eq!(dest.read("srv/big")?, big);
    assert_eq!(dest.read("srv/sparse")?, sparse);
    assert_eq!(dest.read("srv/new")?, b"only here");
    // Copies, not links.
    let a = std::fs::metadata(store.path_in_layer("a", "usr/big"))?;
    let b = std::fs::metadata(store.path_in_layer("b", "srv/big"))?;
    assert_ne!(a.ino(), b.ino());
    // Writable layers get their cache written back.
    assert!(store.has_layer_data("a", CACHE_KEY));
    Ok(())
});

integration_test!(test_hard_links_to_other_layers, || {
    let big = noise(10_000, 3);
    let store = TestLayerStore::new()?;
    let first = base_layer(&big, &sparse_content())?;
    let out = pull(
        &store,
        "a",
        &first,
        MemoryBlobSource::new(first.blob.clone(), None),
        pull_options(),
        None,
        &apply_options(),
    )?;
    store.commit("a", &out, false)?;

    let tar = build_tar(&[
        Member::Dir("usr"),
        Member::File("usr/big", big.clone()),
        Member::File("usr/other", noise(300, 4)),
    ])?;
    let second = zstd_chunked(&tar, CHUNK)?;
    let options = PullOptions {
        use_hard_links: true,
        ..pull_options()
    };
    let cache = LayersCache::open(store.clone())?;
    let out = pull(
        &store,
        "b",
        &second,
        MemoryBlobSource::new(second.blob.clone(), None),
        options,
        Some(cache),
        &apply_options(),
    )?;

    assert_eq!(out.uncompressed_digest, Some(second.diff_id()));
    assert_eq!(out.stats.files_hard_linked, 1);
    let a = std::fs::metadata(store.path_in_layer("a", "usr/big"))?;
    let b = std::fs::metadata(store.path_in_layer("b", "usr/big"))?;
    assert_eq!(a.ino(), b.ino());
    Ok(())
});

integration_test!(test_chunks_reused_from_other_layers, || {
    let big = noise(3 * CHUNK, 5);
    let store = TestLayerStore::new()?;
    let tar = build_tar(&[Member::Dir("usr"), Member::File("usr/big", big.clone())])?;
    let first = zstd_chunked(&tar, CHUNK)?;
    let out = pull(
        &store,
        "a",
        &first,
        MemoryBlobSource::new(first.blob.clone(), None),
        pull_options(),
        None,
        &apply_options(),
    )?;
    store.commit("a", &out, false)?;

    // Same first two chunks, different tail.
    let mut edited = big[..2 * CHUNK].to_vec();
    edited.extend(noise(CHUNK, 6));
    let tar = build_tar(&[Member::Dir("opt"), Member::File("opt/edited", edited.clone())])?;
    let second = zstd_chunked(&tar, CHUNK)?;
    let cache = LayersCache::open(store.clone())?;
    let out = pull(
        &store,
        "b",
        &second,
        MemoryBlobSource::new(second.blob.clone(), None),
        pull_options(),
        Some(cache),
        &apply_options(),
    )?;

    assert_eq!(out.stats.files_copied, 0);
    assert_eq!(out.stats.chunks_from_local, 2);
    assert_eq!(out.stats.missing_bytes, CHUNK as u64);
    assert_eq!(out.uncompressed_digest, Some(second.diff_id()));
    assert_eq!(store.stage("b")?.read("opt/edited")?, edited);
    Ok(())
});

integration_test!(test_modified_local_chunks_are_fetched, || {
    let big = noise(3 * CHUNK, 5);
    let store = TestLayerStore::new()?;
    let tar = build_tar(&[Member::Dir("usr"), Member::File("usr/big", big.clone())])?;
    let first = zstd_chunked(&tar, CHUNK)?;
    let out = pull(
        &store,
        "a",
        &first,
        MemoryBlobSource::new(first.blob.clone(), None),
        pull_options(),
        None,
        &apply_options(),
    )?;
    store.commit("a", &out, false)?;

    // The cache still points at usr/big, but its first two chunks changed.
    let mut tampered = noise(2 * CHUNK, 7);
    tampered.extend_from_slice(&big[2 * CHUNK..]);
    std::fs::write(store.path_in_layer("a", "usr/big"), &tampered)?;

    let mut edited = big[..2 * CHUNK].to_vec();
    edited.extend(noise(CHUNK, 6));
    let tar = build_tar(&[Member::Dir("opt"), Member::File("opt/edited", edited.clone())])?;
    let second = zstd_chunked(&tar, CHUNK)?;
    let cache = LayersCache::open(store.clone())?;
    let source = MemoryBlobSource::new(second.blob.clone(), None);
    let out = pull(
        &store,
        "b",
        &second,
        source.clone(),
        pull_options(),
        Some(cache),
        &apply_options(),
    )?;

    assert_eq!(out.stats.chunks_from_local, 0);
    assert_eq!(out.stats.missing_bytes, 3 * CHUNK as u64);
    // TOC and tar-split, then every chunk of the file.
    assert_eq!(source.requests().len(), 2);
    assert_eq!(out.uncompressed_digest, Some(second.diff_id()));
    assert_eq!(store.stage("b")?.read("opt/edited")?, edited);
    Ok(())
});

integration_test!(test_rejected_multi_range_request_is_split, || {
    let files: Vec<Vec<u8>> = (0..3).map(|i| noise(700, 10 + i)).collect();
    let tar = build_tar(&[
        Member::File("one", files[0].clone()),
        Member::File("two", files[1].clone()),
        Member::File("three", files[2].clone()),
    ])?;
    let layer = zstd_chunked(&tar, CHUNK)?;
    let store = TestLayerStore::new()?;
    // Two ranges are needed for the TOC and tar-split.
    let source = MemoryBlobSource::new(layer.blob.clone(), Some(2));
    let out = pull(&store, "a", &layer, source.clone(), pull_options(), None, &apply_options())?;

    let shapes: Vec<usize> = source.requests().iter().map(Vec::len).collect();
    assert_eq!(shapes, vec![2, 3, 1]);
    assert_eq!(out.uncompressed_digest, Some(layer.diff_id()));
    let dest = store.stage("a")?;
    assert_eq!(dest.read("one")?, files[0]);
    assert_eq!(dest.read("three")?, files[2]);
    Ok(())
});

integration_test!(test_corrupt_file_digest_aborts, || {
    let tar = build_tar(&[Member::Dir("etc"), Member::File("etc/motd", b"hello\n".to_vec())])?;
    let layer = zstd_chunked_with(&tar, CHUNK, |entries| {
        for e in entries.iter_mut().filter(|e| e.name == "etc/motd") {
            e.digest = Some(Digest::sha256_of(b"goodbye\n").to_string());
        }
    })?;
    let store = TestLayerStore::new()?;
    let dest = store.stage("a")?;
    let source = MemoryBlobSource::new(layer.blob.clone(), None);
    let mut differ = ChunkedDiffer::new(source, layer.info(), pull_options(), tuning(), None)?;
    let r = differ.apply_diff(&dest, &apply_options());
    assert!(matches!(r, Err(ChunkedError::ChecksumMismatch { .. })), "{r:?}");
    Ok(())
});

integration_test!(test_flat_layout, || {
    let shared = noise(5000, 20);
    let tar = build_tar(&[
        Member::Dir("etc"),
        Member::File("etc/a", shared.clone()),
        Member::File("etc/b", shared.clone()),
        Member::File("etc/c", b"c\n".to_vec()),
    ])?;
    let layer = zstd_chunked(&tar, CHUNK)?;
    let store = TestLayerStore::new()?;
    let apply = ApplyOptions {
        format: OutputFormat::Flat,
        ..apply_options()
    };
    let out = pull(
        &store,
        "a",
        &layer,
        MemoryBlobSource::new(layer.blob.clone(), None),
        pull_options(),
        None,
        &apply,
    )?;

    assert_eq!(out.uncompressed_digest, Some(layer.diff_id()));
    let dest = store.stage("a")?;
    assert!(!dest.exists("etc"));
    for content in [&shared[..], &b"c\n"[..]] {
        let hex = Digest::sha256_of(content).encoded().to_string();
        assert_eq!(dest.read(format!("{}/{}", &hex[..2], &hex[2..]))?, content);
    }
    // Two distinct contents, one of them listed twice.
    assert_eq!(out.stats.files, 2);
    let layer_data: serde_json::Value = serde_json::from_slice(&out.big_data[LAYER_DATA_KEY])?;
    assert_eq!(layer_data["format"], "flat");
    Ok(())
});

integration_test!(test_insecure_mode_skips_layer_digest, || {
    let tar = build_tar(&[Member::File("motd", b"hi\n".to_vec())])?;
    let layer = zstd_chunked(&tar, CHUNK)?;
    let store = TestLayerStore::new()?;
    let options = PullOptions {
        insecure_allow_unpredictable_image_contents: true,
        ..pull_options()
    };
    let out = pull(
        &store,
        "a",
        &layer,
        MemoryBlobSource::new(layer.blob.clone(), None),
        options,
        None,
        &apply_options(),
    )?;
    assert_eq!(out.uncompressed_digest, None);
    assert_eq!(store.stage("a")?.read("motd")?, b"hi\n");
    Ok(())
});

integration_test!(test_read_only_layers_indexed_in_memory, || {
    let big = noise(6000, 30);
    let tar = build_tar(&[Member::File("big", big.clone())])?;
    let layer = zstd_chunked(&tar, CHUNK)?;
    let store = TestLayerStore::new()?;
    let out = pull(
        &store,
        "ro",
        &layer,
        MemoryBlobSource::new(layer.blob.clone(), None),
        pull_options(),
        None,
        &apply_options(),
    )?;
    store.commit("ro", &out, true)?;

    let cache = LayersCache::open(store.clone())?;
    assert_eq!(cache.len(), 1);
    assert!(!store.has_layer_data("ro", CACHE_KEY));

    let out = pull(
        &store,
        "b",
        &layer,
        MemoryBlobSource::new(layer.blob.clone(), None),
        pull_options(),
        Some(cache),
        &apply_options(),
    )?;
    assert_eq!(out.stats.files_copied, 1);
    assert_eq!(store.stage("b")?.read("big")?, big);
    Ok(())
});

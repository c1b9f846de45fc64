//! Integration tests for the wrap adapter and the factor side file.

use kv_remat::cache::{ActivationCache, ProjectionWeights, QuantWrapMemory, WeightMatrix};
use kv_remat::config::Config;
use kv_remat::graph::{f32_bytes, DType, Graph, Shape};
use kv_remat::memory::{is_quant_wrap, MemoryKind, SequenceMemory, StandardKvCache};
use kv_remat::svd::{self, SvdRanks};

const D: usize = 64;

fn test_config(n_layers: usize) -> Config {
    let mut cfg = Config::default();
    cfg.model.d_model = D;
    cfg.model.n_layers = n_layers;
    cfg.model.n_kv_heads = 1;
    cfg.model.head_dim = D;
    cfg
}

fn wrapped(n_layers: usize) -> QuantWrapMemory<StandardKvCache> {
    let store = ActivationCache::new(
        &test_config(n_layers),
        ProjectionWeights::identity(D, n_layers),
    )
    .unwrap();
    QuantWrapMemory::new(StandardKvCache::new(), store)
}

#[test]
fn test_kind_query_detects_adapter() {
    let wrap = wrapped(1);
    let base = StandardKvCache::new();

    assert_eq!(wrap.kind(), MemoryKind::QuantWrap);
    assert_eq!(base.kind(), MemoryKind::Standard);
    assert!(is_quant_wrap(&wrap));
    assert!(!is_quant_wrap(&base));
    assert!(wrap.is_active());
}

#[test]
fn test_sequence_ops_forward_to_base() {
    let mut wrap = wrapped(1);
    wrap.base_mut().advance(0, 10);

    assert_eq!(wrap.seq_pos_min(0), 0);
    assert_eq!(wrap.seq_pos_max(0), 9);
    assert!(wrap.can_shift());

    assert!(wrap.seq_rm(0, 6, -1));
    assert_eq!(wrap.seq_pos_max(0), 5);

    wrap.seq_cp(0, 1, 0, -1);
    assert_eq!(wrap.seq_pos_max(1), 5);

    wrap.seq_keep(1);
    assert_eq!(wrap.seq_pos_max(0), -1);
    assert_eq!(wrap.seq_pos_max(1), 5);
}

#[test]
fn test_clear_forwards_without_touching_the_store() {
    let mut wrap = wrapped(1);
    wrap.base_mut().advance(0, 4);

    let rows = vec![0.5f32; 3 * D];
    assert!(wrap.append_rows(0, &f32_bytes(&rows), 3, D, false));
    assert_eq!(wrap.store().n_kv(0), 3);

    // Lifecycle clear is a base-cache concern; the quantized store has its
    // own reset entry point.
    wrap.clear(true);
    assert_eq!(wrap.seq_pos_max(0), -1);
    assert_eq!(wrap.store().n_kv(0), 3);

    wrap.store_mut().clear();
    assert_eq!(wrap.store().n_kv(0), 0);
}

#[test]
fn test_state_io_roundtrips_through_adapter() {
    let mut wrap = wrapped(1);
    wrap.base_mut().advance(7, 12);

    let mut buf = Vec::new();
    wrap.state_write(&mut buf).unwrap();

    let mut restored = wrapped(1);
    restored.state_read(&mut buf.as_slice()).unwrap();
    assert_eq!(restored.seq_pos_max(7), 11);
}

#[test]
fn test_write_and_remat_through_adapter() {
    let mut wrap = wrapped(2);
    let mut g = Graph::new();

    let vals = vec![1.0f32; 2 * D];
    let x = g.leaf_with_data(DType::F32, Shape::d2(D, 2), f32_bytes(&vals));
    let q = wrap.write(&mut g, x, 1);
    g.compute(q).unwrap();
    wrap.apply(&g);
    assert_eq!(wrap.store().n_kv(1), 2);

    let wk = WeightMatrix::identity(D);
    let wv = WeightMatrix::identity(D);
    let result = wrap.remat_kv(&mut g, 1, 0, 2, &wk, &wv);
    assert!(result.ok);
    let k = result.k.unwrap();
    g.compute(k).unwrap();
    assert_eq!(g.shape(k), Shape::d2(D, 2));
}

#[test]
fn test_svd_load_matches_model() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("factors.xqsv");
    let layers = vec![SvdRanks { rank_k: 8, rank_v: 8 }; 2];
    svd::write_factors(&path, D as u32, &layers).unwrap();

    let mut wrap = wrapped(2);
    assert!(wrap.store_mut().load_svd(&path));
    assert_eq!(
        wrap.store().svd_ranks(1),
        Some(SvdRanks { rank_k: 8, rank_v: 8 })
    );
}

#[test]
fn test_svd_load_fails_closed_on_layer_mismatch() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("factors.xqsv");
    let layers = vec![SvdRanks { rank_k: 8, rank_v: 8 }; 3];
    svd::write_factors(&path, D as u32, &layers).unwrap();

    // Cache has two layers, file has three.
    let mut wrap = wrapped(2);
    assert!(!wrap.store_mut().load_svd(&path));
    assert_eq!(wrap.store().svd_ranks(0), None);
}

#[test]
fn test_svd_load_fails_closed_on_bad_file() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("garbage.xqsv");
    std::fs::write(&path, b"not a factor file").unwrap();

    let mut wrap = wrapped(1);
    assert!(!wrap.store_mut().load_svd(&path));
    assert_eq!(wrap.store().svd_ranks(0), None);

    // Missing file behaves the same.
    let missing = tmp.path().join("absent.xqsv");
    assert!(!wrap.store_mut().load_svd(&missing));
}

//! kv-remat demo driver.
//!
//! Builds a synthetic model, attaches the quantized activation cache in
//! front of a standard cache, and drives a prefill plus a decode loop:
//! stage writes, execute the compute graph, commit, rematerialize K/V.
//! Reports the quantized footprint against an FP16 K+V baseline.

use anyhow::Result;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use kv_remat::cache::{
    ActivationCache, LayerWeights, ProjectionWeights, QuantWrapMemory, WeightMatrix,
};
use kv_remat::config::{Cli, Config};
use kv_remat::graph::{f32_bytes, DType, Graph, Shape};
use kv_remat::memory::StandardKvCache;
use kv_remat::quant::bits_to_codec;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "kv_remat=debug"
    } else {
        "kv_remat=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-remat v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    let codec = bits_to_codec(config.quant.bits);
    let d = config.model.d_model;
    let n_layers = config.model.n_layers;

    info!(
        d_model = d,
        n_layers,
        n_kv_heads = config.model.n_kv_heads,
        head_dim = config.model.head_dim,
        codec = %codec,
        "Configuration loaded"
    );

    // Synthetic projection weights; a real integration borrows these from
    // the loaded model.
    let mut rng = StdRng::seed_from_u64(42);
    let mut layers = Vec::with_capacity(n_layers);
    for _ in 0..n_layers {
        let wk: Vec<f32> = (0..d * d).map(|_| rng.gen_range(-0.05f32..0.05)).collect();
        let wv: Vec<f32> = (0..d * d).map(|_| rng.gen_range(-0.05f32..0.05)).collect();
        layers.push(LayerWeights {
            wk: WeightMatrix::from_f16(d, d, &wk),
            wv: WeightMatrix::from_f16(d, d, &wv),
        });
    }

    let store = ActivationCache::new(&config, ProjectionWeights::new(layers))?;
    let mut mem = QuantWrapMemory::new(StandardKvCache::new(), store);

    if let Some(path) = config.quant.svd_path.clone() {
        let loaded = mem.store_mut().load_svd(&path);
        info!(loaded, path = %path.display(), "Low-rank factor file");
    }

    // Prefill: realized activations go straight into committed blocks.
    let prompt: Vec<f32> = (0..cli.prefill * d)
        .map(|_| rng.gen_range(-2.5f32..2.5))
        .collect();
    let prompt_bytes = f32_bytes(&prompt);
    for layer in 0..n_layers {
        if !mem.append_rows(layer, &prompt_bytes, cli.prefill, d, false) {
            anyhow::bail!("prefill append failed for layer {layer}");
        }
    }
    mem.base_mut().advance(0, cli.prefill as u32);
    info!(tokens = cli.prefill, "Prefill committed");

    // Decode loop: one token per step, one staged write per layer.
    for step in 0..cli.steps {
        let mut g = Graph::new();

        let mut staged = Vec::with_capacity(n_layers);
        for layer in 0..n_layers {
            let col: Vec<f32> = (0..d).map(|_| rng.gen_range(-2.5f32..2.5)).collect();
            let x = g.leaf_with_data(DType::F32, Shape::d1(d), f32_bytes(&col));
            staged.push(mem.write(&mut g, x, layer));
        }

        // Attention-side read: sees this step's staged writes before commit.
        let layer0_tokens = mem.store().n_kv(0);
        if let Some(k) = mem.store().get_k(&mut g, 0) {
            g.compute(k)?;
            debug!(
                step,
                n_kv = layer0_tokens,
                head_dim = g.shape(k).ne(0),
                heads = g.shape(k).ne(1),
                tokens = g.shape(k).ne(2),
                "Rematerialized layer 0 keys"
            );
        }

        // Execute the staged quantize nodes, then commit them.
        for &q in &staged {
            g.compute(q)?;
        }
        mem.apply(&g);
        mem.base_mut().advance(0, 1);
    }

    let total_tokens = cli.prefill + cli.steps;
    let quantized = mem.store().quantized_bytes();
    let fp16_kv = total_tokens * config.fp16_kv_bytes_per_token();
    info!(
        total_tokens,
        quantized_bytes = quantized,
        fp16_kv_bytes = fp16_kv,
        savings = format!("{:.2}x", fp16_kv as f64 / quantized.max(1) as f64),
        "Cache footprint vs FP16 K+V"
    );

    Ok(())
}

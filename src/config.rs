//! Runtime configuration for kv-remat.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. Model geometry and quantization knobs live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::quant::Codec;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-remat", about = "Quantized activation cache demo driver")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Prompt length for the prefill phase, in tokens.
    #[arg(long, default_value_t = 48)]
    pub prefill: usize,

    /// Number of single-token decode steps to drive.
    #[arg(long, default_value_t = 16)]
    pub steps: usize,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Model geometry.
    pub model: ModelConfig,

    /// Quantization settings.
    pub quant: QuantConfig,
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding width (hidden state size).
    pub d_model: usize,

    /// Number of layers in the model.
    pub n_layers: usize,

    /// Number of KV heads (for GQA/MQA).
    pub n_kv_heads: usize,

    /// Head dimension.
    pub head_dim: usize,

    /// Context size in tokens.
    pub context_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_model: 512,
            n_layers: 8,
            n_kv_heads: 8,
            head_dim: 64,
            context_size: 4096,
        }
    }
}

/// Quantization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantConfig {
    /// Requested bit width for cached activations (8 or 4).
    pub bits: u32,

    /// Optional path to a pre-computed low-rank factor file.
    pub svd_path: Option<PathBuf>,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            bits: 4,
            svd_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file is absent.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Bytes per token for a conventional FP16 K+V cache over all layers.
    pub fn fp16_kv_bytes_per_token(&self) -> usize {
        // K and V, each: n_kv_heads * head_dim * 2 bytes (FP16), per layer.
        self.model.n_kv_heads * self.model.head_dim * 2 * 2 * self.model.n_layers
    }

    /// Bytes per token for the quantized activation copy over all layers.
    pub fn x_bytes_per_token(&self, codec: Codec) -> usize {
        codec.row_size(self.model.d_model) * self.model.n_layers
    }
}

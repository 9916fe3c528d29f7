//! KV cache memory layout.
//!
//! The cache tensors themselves live with the forward-pass kernel; the core
//! only needs to know how many bytes a page costs so the pool can be sized
//! from a device-memory budget.
//!
//! Each layer holds a key and a value cache of shape
//! `[num_pages, page_size, num_kv_heads, head_dim]`.

use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Shape of the KV cache for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCacheLayout {
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Number of KV heads (for GQA, typically fewer than Q heads).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Element type of the cache tensors.
    #[serde(with = "dtype_name")]
    pub dtype: DType,
}

impl KvCacheLayout {
    pub fn new(num_layers: usize, num_kv_heads: usize, head_dim: usize, dtype: DType) -> Self {
        Self {
            num_layers,
            num_kv_heads,
            head_dim,
            dtype,
        }
    }

    /// Bytes of K plus V for one token across all layers.
    pub fn bytes_per_token(&self) -> usize {
        self.num_layers * 2 * self.num_kv_heads * self.head_dim * self.dtype.size_in_bytes()
    }

    /// Bytes for one page of `page_size` tokens.
    pub fn bytes_per_page(&self, page_size: usize) -> usize {
        self.bytes_per_token() * page_size
    }

    /// How many whole pages fit into `budget_bytes`.
    pub fn pages_for_budget(&self, budget_bytes: usize, page_size: usize) -> usize {
        match self.bytes_per_page(page_size) {
            0 => 0,
            per_page => budget_bytes / per_page,
        }
    }
}

mod dtype_name {
    use std::str::FromStr;

    use candle_core::DType;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dtype: &DType, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(dtype.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DType, D::Error> {
        let name = String::deserialize(deserializer)?;
        DType::from_str(&name).map_err(|e| serde::de::Error::custom(format!("{e:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_page() {
        // Qwen3-0.6B-like: 28 layers, 8 KV heads, head_dim 128, bf16.
        let layout = KvCacheLayout::new(28, 8, 128, DType::BF16);
        assert_eq!(layout.bytes_per_token(), 28 * 2 * 8 * 128 * 2);
        assert_eq!(layout.bytes_per_page(16), layout.bytes_per_token() * 16);
    }

    #[test]
    fn test_pages_for_budget() {
        let layout = KvCacheLayout::new(1, 1, 4, DType::F32);
        // 2 * 4 * 4 bytes = 32 bytes per token, 128 per page of 4.
        assert_eq!(layout.pages_for_budget(1000, 4), 7);
        assert_eq!(layout.pages_for_budget(0, 4), 0);
    }

    #[test]
    fn test_layout_json() {
        let layout = KvCacheLayout::new(2, 4, 64, DType::F16);
        let json = serde_json::to_string(&layout).unwrap();
        assert!(json.contains("\"f16\""));
        let back: KvCacheLayout = serde_json::from_str(&json).unwrap();
        assert_eq!(back, layout);
    }
}

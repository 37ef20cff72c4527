//! Typed key/value attention cache for the merged decoder.
//!
//! Entries are addressed by `(layer, side, slot)`. Exported ONNX graphs use
//! string names for the same tensors; [`past_name`] and [`present_name`]
//! produce them from the typed address.

use std::fmt;

use ndarray::{ArrayD, IxDyn};
use thiserror::Error;
use tracing::trace;

use crate::config::ModelLayout;

/// Self-attention over generated tokens, or cross-attention over the
/// encoder output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttentionSide {
    Decoder,
    Encoder,
}

impl AttentionSide {
    pub const ALL: [Self; 2] = [Self::Decoder, Self::Encoder];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Decoder => "decoder",
            Self::Encoder => "encoder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheSlot {
    Key,
    Value,
}

impl CacheSlot {
    pub const ALL: [Self; 2] = [Self::Key, Self::Value];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Value => "value",
        }
    }
}

/// Graph input name, e.g. `past_key_values.0.decoder.key`.
#[must_use]
pub fn past_name(layer: usize, side: AttentionSide, slot: CacheSlot) -> String {
    format!("past_key_values.{layer}.{}.{}", side.as_str(), slot.as_str())
}

/// Graph output name, e.g. `present.0.decoder.key`.
#[must_use]
pub fn present_name(layer: usize, side: AttentionSide, slot: CacheSlot) -> String {
    format!("present.{layer}.{}.{}", side.as_str(), slot.as_str())
}

/// Key and value tensors shaped `[batch, heads, sequence, head_dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: ArrayD<f32>,
    pub value: ArrayD<f32>,
}

impl KeyValue {
    /// Zero-length entry used before the first step.
    #[must_use]
    pub fn empty(batch: usize, heads: usize, head_dim: usize) -> Self {
        let shape = IxDyn(&[batch, heads, 0, head_dim]);
        Self {
            key: ArrayD::zeros(shape.clone()),
            value: ArrayD::zeros(shape),
        }
    }

    #[must_use]
    pub fn get(&self, slot: CacheSlot) -> &ArrayD<f32> {
        match slot {
            CacheSlot::Key => &self.key,
            CacheSlot::Value => &self.value,
        }
    }

    /// Cached sequence length, read from the key tensor.
    #[must_use]
    pub fn sequence_len(&self) -> usize {
        self.key.shape().get(2).copied().unwrap_or(0)
    }
}

/// Both attention sides of one decoder layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerCache {
    pub decoder: KeyValue,
    pub encoder: KeyValue,
}

impl LayerCache {
    #[must_use]
    pub fn get(&self, side: AttentionSide) -> &KeyValue {
        match side {
            AttentionSide::Decoder => &self.decoder,
            AttentionSide::Encoder => &self.encoder,
        }
    }
}

/// Raised when a backend returns a cache for a different layer count.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("backend returned {actual} cache layers, expected {expected}")]
pub struct CacheLayerMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Cache state owned by one generation run.
#[derive(Clone, PartialEq)]
pub struct KvCache {
    layers: Vec<LayerCache>,
}

impl KvCache {
    /// Empty entries for every decoder layer, as fed to the first step.
    #[must_use]
    pub fn empty(layout: &ModelLayout, batch: usize) -> Self {
        let decoder = KeyValue::empty(batch, layout.num_decoder_heads, layout.decoder_head_dim());
        let encoder = KeyValue::empty(batch, layout.num_encoder_heads, layout.encoder_head_dim());
        Self {
            layers: (0..layout.num_decoder_layers)
                .map(|_| LayerCache {
                    decoder: decoder.clone(),
                    encoder: encoder.clone(),
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn from_layers(layers: Vec<LayerCache>) -> Self {
        Self { layers }
    }

    #[must_use]
    pub fn layers(&self) -> &[LayerCache] {
        &self.layers
    }

    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn tensor(&self, layer: usize, side: AttentionSide, slot: CacheSlot) -> Option<&ArrayD<f32>> {
        self.layers.get(layer).map(|l| l.get(side).get(slot))
    }

    /// Every tensor with its address, in layer-major order.
    pub fn entries(&self) -> impl Iterator<Item = (usize, AttentionSide, CacheSlot, &ArrayD<f32>)> {
        self.layers.iter().enumerate().flat_map(|(layer, cache)| {
            AttentionSide::ALL.into_iter().flat_map(move |side| {
                CacheSlot::ALL
                    .into_iter()
                    .map(move |slot| (layer, side, slot, cache.get(side).get(slot)))
            })
        })
    }

    /// Absorbs a step's `present` output.
    ///
    /// Decoder entries are always replaced. Encoder entries are replaced
    /// only when the step ran without the cache, which is the first step;
    /// afterwards the backend's encoder output is discarded and the
    /// existing tensors are carried forward.
    ///
    /// # Errors
    ///
    /// Returns [`CacheLayerMismatch`] if `present` has a different number
    /// of layers.
    pub fn update(&mut self, present: Self, used_cache: bool) -> Result<(), CacheLayerMismatch> {
        if present.layers.len() != self.layers.len() {
            return Err(CacheLayerMismatch {
                expected: self.layers.len(),
                actual: present.layers.len(),
            });
        }
        for (cached, fresh) in self.layers.iter_mut().zip(present.layers) {
            cached.decoder = fresh.decoder;
            if !used_cache {
                cached.encoder = fresh.encoder;
            }
        }
        trace!(
            used_cache,
            decoder_len = self.layers.first().map_or(0, |l| l.decoder.sequence_len()),
            "cache updated"
        );
        Ok(())
    }
}

impl fmt::Debug for KvCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first = self.layers.first();
        f.debug_struct("KvCache")
            .field("layers", &self.layers.len())
            .field("decoder_len", &first.map(|l| l.decoder.sequence_len()))
            .field("encoder_len", &first.map(|l| l.encoder.sequence_len()))
            .finish()
    }
}

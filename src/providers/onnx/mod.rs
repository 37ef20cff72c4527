//! ONNX Runtime backend for the exported Florence-2 networks.
//!
//! Each network runs in its own session behind a mutex. A small TopK graph
//! is built in memory so ranking runs inside the runtime too. All sessions
//! share one set of run options, which is how an in-flight call is
//! interrupted.

mod artefact;
mod config;
mod errors;

pub use artefact::{OnnxArtefact, compute_sha256, normalise_hex};
pub use config::{
    DECODER_FILE, EMBED_TOKENS_FILE, ENCODER_FILE, OnnxBackendConfig, VISION_ENCODER_FILE,
};
pub use errors::OnnxBackendError;

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use ndarray::{Array3, ArrayD, ArrayView, ArrayView1, ArrayView2, ArrayView3, ArrayView4, Dimension, Ix3, IxDyn};
use ort::session::{RunOptions, Session, SessionInputValue, SessionOutputs};
use ort::tensor::PrimitiveTensorElementType;
use ort::value::Tensor;
use tracing::{info, warn};

use crate::config::ModelLayout;
use crate::generation::cache::{AttentionSide, CacheSlot, KeyValue, KvCache, LayerCache, past_name, present_name};
use crate::providers::{Backend, DecoderStepInput, DecoderStepOutput, TopK};

/// Serialised ONNX model with a single `TopK` node: inputs `x` (`f32`,
/// `[1, n]`) and `k` (`i64`, `[1]`), outputs `v` and `i`.
const TOP_K_GRAPH: &[u8] = &[
    8, 10, 18, 0, 58, 73, 10, 18, 10, 1, 120, 10, 1, 107, 18, 1, 118, 18, 1, 105, 34, 4, 84, 111,
    112, 75, 18, 1, 116, 90, 9, 10, 1, 120, 18, 4, 10, 2, 8, 1, 90, 15, 10, 1, 107, 18, 10, 10, 8,
    8, 7, 18, 4, 10, 2, 8, 1, 98, 9, 10, 1, 118, 18, 4, 10, 2, 8, 1, 98, 9, 10, 1, 105, 18, 4, 10,
    2, 8, 7, 66, 2, 16, 21,
];

type Inputs = Vec<(Cow<'static, str>, SessionInputValue<'static>)>;

/// Florence-2 over ONNX Runtime.
pub struct OnnxBackend {
    decoder: Mutex<Session>,
    embed_tokens: Mutex<Session>,
    encoder: Mutex<Session>,
    vision_encoder: Mutex<Session>,
    top_k: Mutex<Session>,
    run_options: Arc<RunOptions>,
    layout: ModelLayout,
}

impl OnnxBackend {
    /// Verifies every artefact and opens its session.
    ///
    /// # Errors
    ///
    /// Returns [`OnnxBackendError`] when artefact verification or ONNX
    /// initialisation fails.
    ///
    /// # Examples
    /// ```no_run
    /// use florence2::config::ModelLayout;
    /// use florence2::providers::onnx::{OnnxBackend, OnnxBackendConfig, OnnxBackendError};
    ///
    /// # fn main() -> Result<(), OnnxBackendError> {
    /// let config = OnnxBackendConfig::from_model_dir(
    ///     std::path::Path::new("/models/florence-2-base"),
    ///     ModelLayout::default(),
    /// );
    /// let backend = OnnxBackend::new(&config)?;
    /// # drop(backend);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(config: &OnnxBackendConfig) -> Result<Self, OnnxBackendError> {
        let top_k = Session::builder()
            .map_err(OnnxBackendError::CreateSessionBuilder)?
            .commit_from_memory(TOP_K_GRAPH)
            .map_err(OnnxBackendError::CreateTopKSession)?;
        let backend = Self {
            decoder: Mutex::new(open_session(&config.decoder)?),
            embed_tokens: Mutex::new(open_session(&config.embed_tokens)?),
            encoder: Mutex::new(open_session(&config.encoder)?),
            vision_encoder: Mutex::new(open_session(&config.vision_encoder)?),
            top_k: Mutex::new(top_k),
            run_options: Arc::new(RunOptions::new().map_err(OnnxBackendError::RunOptions)?),
            layout: config.layout,
        };
        info!(decoder = %config.decoder.path.display(), "loaded ONNX sessions");
        Ok(backend)
    }

    fn run<T>(
        &self,
        name: &'static str,
        session: &Mutex<Session>,
        inputs: Inputs,
        read: impl FnOnce(&SessionOutputs<'_, '_>) -> Result<T, OnnxBackendError>,
    ) -> Result<T, OnnxBackendError> {
        let mut session = lock(name, session)?;
        let outputs = session
            .run_with_options(inputs, &*self.run_options)
            .map_err(|source| OnnxBackendError::Inference {
                session: name,
                source,
            })?;
        read(&outputs)
    }
}

impl fmt::Debug for OnnxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxBackend")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl Backend for OnnxBackend {
    type Error = OnnxBackendError;

    fn embed(&self, input_ids: ArrayView2<'_, i64>) -> Result<Array3<f32>, Self::Error> {
        let inputs = vec![input("input_ids", input_ids)?];
        self.run("embed_tokens", &self.embed_tokens, inputs, |outputs| {
            extract_3d(outputs, "inputs_embeds")
        })
    }

    fn encode(
        &self,
        inputs_embeds: ArrayView3<'_, f32>,
        attention_mask: ArrayView2<'_, i64>,
    ) -> Result<Array3<f32>, Self::Error> {
        let inputs = vec![
            input("attention_mask", attention_mask)?,
            input("inputs_embeds", inputs_embeds)?,
        ];
        self.run("encoder_model", &self.encoder, inputs, |outputs| {
            extract_3d(outputs, "last_hidden_state")
        })
    }

    fn decode_step(&self, step: DecoderStepInput<'_>) -> Result<DecoderStepOutput, Self::Error> {
        let mut inputs = vec![
            input("inputs_embeds", step.inputs_embeds)?,
            input("encoder_attention_mask", step.encoder_attention_mask)?,
            input("encoder_hidden_states", step.encoder_hidden_states)?,
            input_owned("use_cache_branch", vec![1], vec![step.use_cache])?,
        ];
        for (layer, side, slot, tensor) in step.cache.entries() {
            inputs.push(input(past_name(layer, side, slot), tensor.view())?);
        }

        let layers = self.layout.num_decoder_layers;
        self.run("decoder_model_merged", &self.decoder, inputs, |outputs| {
            let logits = extract_3d(outputs, "logits")?;
            let present = (0..layers)
                .map(|layer| {
                    let key_value = |side: AttentionSide| -> Result<KeyValue, OnnxBackendError> {
                        Ok(KeyValue {
                            key: extract(outputs, &present_name(layer, side, CacheSlot::Key))?,
                            value: extract(outputs, &present_name(layer, side, CacheSlot::Value))?,
                        })
                    };
                    Ok(LayerCache {
                        decoder: key_value(AttentionSide::Decoder)?,
                        encoder: key_value(AttentionSide::Encoder)?,
                    })
                })
                .collect::<Result<Vec<_>, OnnxBackendError>>()?;
            Ok(DecoderStepOutput {
                logits,
                present: KvCache::from_layers(present),
            })
        })
    }

    fn vision_encode(&self, pixel_values: ArrayView4<'_, f32>) -> Result<Array3<f32>, Self::Error> {
        let inputs = vec![input("pixel_values", pixel_values)?];
        self.run("vision_encoder", &self.vision_encoder, inputs, |outputs| {
            extract_3d(outputs, "image_features")
        })
    }

    fn top_k(&self, values: ArrayView1<'_, f32>, k: usize) -> Result<TopK, Self::Error> {
        let k = i64::try_from(k.min(values.len())).unwrap_or(i64::MAX);
        let inputs = vec![
            input_owned("x", vec![1, values.len()], values.to_vec())?,
            input_owned("k", vec![1], vec![k])?,
        ];
        self.run("top_k", &self.top_k, inputs, |outputs| {
            let values = extract::<f32>(outputs, "v")?;
            let indices = extract::<i64>(outputs, "i")?;
            Ok(TopK {
                values: values.iter().copied().collect(),
                indices: indices.iter().copied().collect(),
            })
        })
    }

    fn begin_run(&self) -> Result<(), Self::Error> {
        self.run_options
            .unterminate()
            .map_err(OnnxBackendError::RunOptions)
    }

    fn interrupt_hook(&self) -> Option<Box<dyn FnOnce() + Send>> {
        let run_options = Arc::clone(&self.run_options);
        Some(Box::new(move || {
            if let Err(e) = run_options.terminate() {
                warn!(error = %e, "failed to interrupt ONNX run");
            }
        }))
    }
}

fn open_session(artefact: &OnnxArtefact) -> Result<Session, OnnxBackendError> {
    artefact.verify()?;
    Session::builder()
        .map_err(OnnxBackendError::CreateSessionBuilder)?
        .commit_from_file(&artefact.path)
        .map_err(|source| OnnxBackendError::CreateSession {
            path: artefact.path.clone(),
            source,
        })
}

fn lock<'a>(name: &'static str, session: &'a Mutex<Session>) -> Result<MutexGuard<'a, Session>, OnnxBackendError> {
    session
        .lock()
        .map_err(|_| OnnxBackendError::SessionPoisoned(name))
}

fn input<T, D>(
    name: impl Into<Cow<'static, str>>,
    array: ArrayView<'_, T, D>,
) -> Result<(Cow<'static, str>, SessionInputValue<'static>), OnnxBackendError>
where
    T: PrimitiveTensorElementType + Copy + fmt::Debug + 'static,
    D: Dimension,
{
    input_owned(name, array.shape().to_vec(), array.iter().copied().collect())
}

fn input_owned<T>(
    name: impl Into<Cow<'static, str>>,
    shape: Vec<usize>,
    data: Vec<T>,
) -> Result<(Cow<'static, str>, SessionInputValue<'static>), OnnxBackendError>
where
    T: PrimitiveTensorElementType + fmt::Debug + 'static,
{
    let name = name.into();
    let tensor = Tensor::from_array((shape, data)).map_err(|source| OnnxBackendError::EncodeTensor {
        name: name.to_string(),
        source,
    })?;
    Ok((name, tensor.into()))
}

fn extract<T>(outputs: &SessionOutputs<'_, '_>, name: &str) -> Result<ArrayD<T>, OnnxBackendError>
where
    T: PrimitiveTensorElementType + Clone + 'static,
{
    let value = outputs
        .get(name)
        .ok_or_else(|| OnnxBackendError::OutputMissing { name: name.to_owned() })?;
    let (shape, data) = value
        .try_extract_tensor::<T>()
        .map_err(|source| OnnxBackendError::ExtractOutput {
            name: name.to_owned(),
            source,
        })?;
    let unexpected = || OnnxBackendError::UnexpectedShape {
        name: name.to_owned(),
        shape: shape.to_vec(),
    };
    let dims = shape
        .iter()
        .map(|&d| usize::try_from(d))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| unexpected())?;
    ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec()).map_err(|_| unexpected())
}

fn extract_3d(outputs: &SessionOutputs<'_, '_>, name: &str) -> Result<Array3<f32>, OnnxBackendError> {
    let array = extract::<f32>(outputs, name)?;
    let shape = array.shape().iter().map(|&d| i64::try_from(d).unwrap_or(i64::MAX)).collect();
    array
        .into_dimensionality::<Ix3>()
        .map_err(|_| OnnxBackendError::UnexpectedShape {
            name: name.to_owned(),
            shape,
        })
}

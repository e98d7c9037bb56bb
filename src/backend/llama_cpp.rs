//! llama.cpp backend: GGUF model loading and inference via llama-cpp-2.
//!
//! The controller works on a fixed window that is rebuilt every step, so
//! this backend does not carry KV state between calls: each `infer` clears
//! the cache, decodes every occupied position of the window and returns the
//! logits of the last one.
//!
//! Tokenization stays on our side. The GGUF vocabulary must match the
//! `tokenizer.json` the controller was built with.

#[cfg(feature = "llama-cpp")]
mod inner {
    use crate::backend::{BackendError, InferenceBackend, Logits, ModelConfig};
    use crate::context::ContextBuffer;

    use llama_cpp_2::context::params::LlamaContextParams;
    use llama_cpp_2::context::LlamaContext;
    use llama_cpp_2::llama_backend::LlamaBackend;
    use llama_cpp_2::llama_batch::LlamaBatch;
    use llama_cpp_2::model::params::LlamaModelParams;
    use llama_cpp_2::model::LlamaModel;
    use llama_cpp_2::token::LlamaToken;

    use std::num::NonZeroU32;
    use std::path::Path;

    /// llama.cpp backend wrapping the llama-cpp-2 crate.
    ///
    /// Field ordering matters: ctx drops before model drops before backend.
    /// The context borrows from model, so model must outlive context.
    pub struct LlamaCppBackend {
        // ctx must be declared BEFORE model so it drops first.
        ctx: LlamaContext<'static>,
        _model: Box<LlamaModel>,
        _backend: Box<LlamaBackend>,
        config: ModelConfig,
    }

    impl LlamaCppBackend {
        /// Load a GGUF model.
        ///
        /// `n_gpu_layers`: layers to offload (`u32::MAX` for all, `0` for CPU).
        /// `ctx_size`: context window; should equal the controller's
        /// `max_sequence_length`.
        pub fn load_gguf(path: &str, n_gpu_layers: u32, ctx_size: u32) -> Result<Self, BackendError> {
            if !Path::new(path).exists() {
                return Err(BackendError::ModelLoadFailed(format!(
                    "GGUF file not found: {}",
                    path
                )));
            }

            let backend = Box::new(
                LlamaBackend::init()
                    .map_err(|e| BackendError::ModelLoadFailed(format!("backend init: {}", e)))?,
            );

            let model_params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers);

            let model = Box::new(
                LlamaModel::load_from_file(&backend, path, &model_params)
                    .map_err(|e| BackendError::ModelLoadFailed(format!("{}", e)))?,
            );

            // The whole window is decoded in one batch.
            let ctx_params = LlamaContextParams::default()
                .with_n_ctx(NonZeroU32::new(ctx_size))
                .with_n_batch(ctx_size)
                .with_n_seq_max(1);

            // SAFETY: model is in a Box (heap-allocated, stable address) stored
            // in the same struct, and ctx drops first (field declaration order).
            let ctx = {
                let model_ref: &'static LlamaModel =
                    unsafe { &*(&*model as *const LlamaModel) };
                model_ref
                    .new_context(&backend, ctx_params)
                    .map_err(|e| BackendError::ModelLoadFailed(format!("context: {}", e)))?
            };

            let config = ModelConfig {
                vocab_size: model.n_vocab() as usize,
                max_seq_len: ctx_size as usize,
                name: Path::new(path)
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.to_string()),
            };

            tracing::info!(
                model = %config.name,
                vocab = config.vocab_size,
                ctx = config.max_seq_len,
                "model loaded"
            );

            Ok(Self {
                ctx,
                _model: model,
                _backend: backend,
                config,
            })
        }

        /// Get model config.
        pub fn model_config(&self) -> &ModelConfig {
            &self.config
        }
    }

    impl InferenceBackend for LlamaCppBackend {
        fn vocab_size(&self) -> usize {
            self.config.vocab_size
        }

        fn infer(&mut self, input: &ContextBuffer) -> Result<Logits, BackendError> {
            let positions: Vec<(usize, u32)> = input
                .ids()
                .iter()
                .zip(input.mask())
                .enumerate()
                .filter(|(_, (_, &m))| m == 1)
                .map(|(pos, (&tok, _))| (pos, tok))
                .collect();

            let Some(&(last_pos, _)) = positions.last() else {
                return Err(BackendError::Inference("empty context window".into()));
            };

            self.ctx.clear_kv_cache();

            let mut batch = LlamaBatch::new(positions.len(), 1);
            for &(pos, tok) in &positions {
                batch
                    .add(LlamaToken(tok as i32), pos as i32, &[0], pos == last_pos)
                    .map_err(|e| BackendError::Inference(format!("batch add: {}", e)))?;
            }

            self.ctx
                .decode(&mut batch)
                .map_err(|e| BackendError::Inference(format!("decode: {}", e)))?;

            let logits = self.ctx.get_logits_ith((positions.len() - 1) as i32);
            Ok(Logits::last_position(logits.to_vec()))
        }
    }
}

#[cfg(feature = "llama-cpp")]
pub use inner::LlamaCppBackend;

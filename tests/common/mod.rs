//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use companion_infer::tokenizer::bytes_to_unicode;
use companion_infer::{
    BackendError, ContextBuffer, GenerationConfig, GenerationController, InferenceBackend, Logits,
    TokenId, Tokenizer,
};
use serde_json::{json, Map, Value};

pub const USER: TokenId = 259;
pub const ASSISTANT: TokenId = 260;
pub const END: TokenId = 261;
pub const SYSTEM: TokenId = 262;
pub const VOCAB: usize = 263;

/// Route library logs to the test harness. Set RUST_LOG to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A tiny tokenizer.json: byte symbols, three merges, four chat markers.
pub fn tokenizer_json() -> String {
    let mut vocab = Map::new();
    for (b, c) in bytes_to_unicode().iter().enumerate() {
        vocab.insert(c.to_string(), json!(b));
    }
    vocab.insert("He".into(), json!(256));
    vocab.insert("\u{120}m".into(), json!(257));
    vocab.insert("\u{120}me".into(), json!(258));

    let json = json!({
        "version": "1.0",
        "model": {
            "type": "BPE",
            "vocab": Value::Object(vocab),
            "merges": ["H e", ["\u{120}", "m"], "\u{120}m e"],
        },
        "added_tokens": [
            { "id": USER, "content": "<|user|>", "special": true },
            { "id": ASSISTANT, "content": "<|assistant|>", "special": true },
            { "id": END, "content": "<|end|>", "special": true },
            { "id": SYSTEM, "content": "<|system|>", "special": true },
        ],
    });
    json.to_string()
}

pub fn tokenizer() -> Arc<Tokenizer> {
    Arc::new(Tokenizer::from_json_str(&tokenizer_json()).unwrap())
}

pub fn config() -> GenerationConfig {
    GenerationConfig {
        eos_token_ids: vec![END],
        seed: Some(11),
        ..Default::default()
    }
}

pub fn controller(config: GenerationConfig) -> GenerationController {
    init_tracing();
    GenerationController::new(tokenizer(), config).unwrap()
}

/// One-hot logits: `token` gets all the probability mass.
pub fn one_hot(token: TokenId, vocab: usize) -> Logits {
    let mut scores = vec![f32::NEG_INFINITY; vocab];
    scores[token as usize] = 0.0;
    Logits::last_position(scores)
}

/// Replays a script of ids, then emits `<|end|>` forever.
pub struct Scripted {
    script: Vec<TokenId>,
    pub calls: usize,
    /// Snapshot of the occupied window at each call.
    pub seen: Vec<Vec<TokenId>>,
}

impl Scripted {
    pub fn new(script: &[TokenId]) -> Self {
        Self {
            script: script.to_vec(),
            calls: 0,
            seen: Vec::new(),
        }
    }

    pub fn text(text: &str) -> Self {
        let ids: Vec<TokenId> = text.bytes().map(TokenId::from).collect();
        Self::new(&ids)
    }
}

impl InferenceBackend for Scripted {
    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn infer(&mut self, input: &ContextBuffer) -> Result<Logits, BackendError> {
        self.seen.push(input.occupied_ids().to_vec());
        let token = self.script.get(self.calls).copied().unwrap_or(END);
        self.calls += 1;
        Ok(one_hot(token, VOCAB))
    }
}

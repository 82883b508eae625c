// embedder/onnx.rs
// Local sentence-transformer embeddings through ONNX Runtime
// Inference blocks, so each call runs on the blocking pool behind a session mutex

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndarray::Array2;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Value;
use tokenizers::Tokenizer;

use super::{EmbeddingProvider, l2_normalize};
use crate::error::{BackendError, PipelineError};

pub struct OnnxEmbedder {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<Tokenizer>,
    model: String,
}

impl OnnxEmbedder {
    pub fn new(model_path: &str, tokenizer_path: &str, model: String) -> Result<Self, PipelineError> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| PipelineError::config(format!("failed to load tokenizer: {}", e)))?;

        let session = Session::builder()
            .map_err(|e| PipelineError::config(format!("session builder error: {:?}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| PipelineError::config(format!("optimization error: {:?}", e)))?
            .with_intra_threads(2)
            .map_err(|e| PipelineError::config(format!("thread config error: {:?}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| PipelineError::config(format!("model load error: {:?}", e)))?;

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            model,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OnnxEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let session = Arc::clone(&self.session);
        let tokenizer = Arc::clone(&self.tokenizer);
        let text = text.to_string();

        tokio::task::spawn_blocking(move || run_inference(&session, &tokenizer, &text))
            .await
            .map_err(|e| BackendError::Transient(format!("inference task failed: {}", e)))?
    }
}

fn run_inference(
    session: &Mutex<Session>,
    tokenizer: &Tokenizer,
    text: &str,
) -> Result<Vec<f32>, BackendError> {
    let encoding = tokenizer
        .encode(text, true)
        .map_err(|e| BackendError::MalformedOutput(format!("tokenization failed: {:?}", e)))?;

    let len = encoding.len();
    let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
    let attention_mask: Vec<i64> = encoding
        .get_attention_mask()
        .iter()
        .map(|&m| m as i64)
        .collect();
    let token_type_ids: Vec<i64> = encoding.get_type_ids().iter().map(|&t| t as i64).collect();

    let shape_err = |e: ndarray::ShapeError| BackendError::MalformedOutput(format!("shape error: {:?}", e));
    let value_err = |e: ort::Error| BackendError::MalformedOutput(format!("value creation error: {:?}", e));

    let input_ids_value =
        Value::from_array(Array2::from_shape_vec((1, len), input_ids).map_err(shape_err)?)
            .map_err(value_err)?;
    let attention_mask_value =
        Value::from_array(Array2::from_shape_vec((1, len), attention_mask.clone()).map_err(shape_err)?)
            .map_err(value_err)?;
    let token_type_ids_value =
        Value::from_array(Array2::from_shape_vec((1, len), token_type_ids).map_err(shape_err)?)
            .map_err(value_err)?;

    let mut session = session
        .lock()
        .map_err(|_| BackendError::Transient("onnx session lock poisoned".to_string()))?;

    let outputs = session
        .run(ort::inputs![
            "input_ids" => &input_ids_value,
            "attention_mask" => &attention_mask_value,
            "token_type_ids" => &token_type_ids_value
        ])
        .map_err(|e| BackendError::Transient(format!("ONNX inference error: {:?}", e)))?;

    let (output_shape, output_data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| BackendError::MalformedOutput(format!("tensor extraction error: {:?}", e)))?;
    if output_shape.len() != 3 {
        return Err(BackendError::MalformedOutput(format!(
            "expected rank-3 output, got rank {}",
            output_shape.len()
        )));
    }
    let embedding_dim = output_shape[2] as usize;

    // Mean pooling over the attended tokens
    let mut pooled = vec![0.0f32; embedding_dim];
    let mut count = 0usize;
    for (j, &mask) in attention_mask.iter().enumerate() {
        if mask == 1 {
            let offset = j * embedding_dim;
            for (k, value) in pooled.iter_mut().enumerate() {
                *value += output_data[offset + k];
            }
            count += 1;
        }
    }
    if count > 0 {
        for value in &mut pooled {
            *value /= count as f32;
        }
    }

    l2_normalize(&mut pooled);
    Ok(pooled)
}

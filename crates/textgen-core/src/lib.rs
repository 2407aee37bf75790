use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use derivative::Derivative;
use flume::{Receiver, Sender};
use salvo::oapi::ToSchema;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::RwLock,
    time::{Duration, Instant},
};
use web_rwkv::{
    runtime::model::{ModelInfo, Quant},
    tokenizer::Tokenizer,
};

use crate::{
    reload::{AdapterOption, Precision},
    run::RwkvOracle,
    sampler::sequence::{GenerationRequest, SequenceSampler},
};

pub mod cache;
pub mod error;
pub mod oracle;
pub mod reload;
pub mod run;
pub mod sampler;

pub use error::{GenerateError, OracleError};
pub use sampler::{sequence::GenerationLimits, SamplerParams};

#[derive(Debug, Default, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenCounter {
    #[serde(alias = "prompt_tokens")]
    pub prompt: usize,
    #[serde(alias = "completion_tokens")]
    pub completion: usize,
    #[serde(alias = "total_tokens")]
    pub total: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub enum ThreadRequest {
    /// Acquire a list of current available adapters.
    Adapter(Sender<AdapterList>),
    /// Get the current runtime info.
    Info(Sender<RuntimeInfo>),
    /// Request the runtime to continue a prompt.
    Generate {
        request: Box<GenerateRequest>,
        sender: Sender<Result<GenerateResponse, GenerateError>>,
    },
    /// Reload the runtime with custom config.
    Reload {
        request: Box<ReloadRequest>,
        sender: Option<Sender<bool>>,
    },
    /// Unload the runtime.
    Unload,
}

/// Everything that lives as long as a loaded model.
#[derive(Debug, Clone)]
pub struct Runtime {
    reload: Arc<ReloadRequest>,
    tokenizer: Arc<Tokenizer>,
    oracle: Arc<RwkvOracle>,
}

#[derive(Default)]
pub enum Environment {
    Loaded(Runtime),
    #[default]
    None,
}

#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub reload: Arc<ReloadRequest>,
    pub model: ModelInfo,
}

#[derive(Debug, Default, Clone)]
pub struct AdapterList(pub Vec<String>);

/// A text-level generation request.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize, ToSchema)]
#[derivative(Default)]
#[serde(default)]
pub struct GenerateRequest {
    /// The prompt for the model.
    pub prompt: String,
    /// Number of tokens to generate.
    #[serde(alias = "max_tokens")]
    #[derivative(Default(value = "10"))]
    pub length: usize,
    /// Number of independent continuations of the prompt.
    #[serde(alias = "n")]
    #[derivative(Default(value = "1"))]
    pub num_samples: usize,
    /// Sampler parameters.
    pub sampler: SamplerParams,
    /// Seed of the random stream, for reproducible sampling.
    pub seed: Option<u64>,
}

#[derive(Debug, Default, Clone, Serialize, ToSchema)]
pub struct GenerateResponse {
    /// Decoded continuation of each sample, without the prompt.
    pub choices: Vec<String>,
    #[serde(rename = "usage")]
    pub counter: TokenCounter,
}

#[derive(Debug, Derivative, Clone, Serialize, Deserialize, ToSchema)]
#[derivative(Default)]
#[serde(default)]
pub struct ReloadRequest {
    /// Path to the model.
    #[salvo(schema(value_type = String))]
    pub model_path: PathBuf,
    /// Specify layers that needs to be quantized.
    pub quant: usize,
    /// Quantization type (`Int8` or `NF4`).
    #[salvo(schema(value_type = sealed::Quant))]
    pub quant_type: Quant,
    /// Precision for intermediate tensors (`Fp16` or `Fp32`).
    pub precision: Precision,
    /// Maximum tokens to be processed in parallel at once.
    #[derivative(Default(value = "128"))]
    pub token_chunk_size: usize,
    /// Number of scored sequences whose model state is kept for reuse.
    #[derivative(Default(value = "16"))]
    pub max_cache_items: usize,
    /// Path to the tokenizer.
    #[salvo(schema(value_type = String))]
    pub tokenizer_path: PathBuf,
    /// Adapter selection.
    pub adapter: AdapterOption,
    /// Upper bounds on generation requests served by this model.
    pub limits: GenerationLimits,
}

impl Runtime {
    pub async fn load(reload: ReloadRequest) -> Result<Self> {
        let tokenizer = run::load_tokenizer(&reload.tokenizer_path).await?;
        let oracle = run::load_oracle(&reload).await?;
        Ok(Self {
            reload: Arc::new(reload),
            tokenizer: Arc::new(tokenizer),
            oracle: Arc::new(oracle),
        })
    }

    pub fn info(&self) -> RuntimeInfo {
        RuntimeInfo {
            reload: self.reload.clone(),
            model: self.oracle.info().clone(),
        }
    }

    /// Encode the prompt, run the sampler and decode what it generated.
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, GenerateError> {
        let instant = Instant::now();
        let GenerateRequest {
            prompt,
            length,
            num_samples,
            sampler,
            seed,
        } = request;

        let prompt = self
            .tokenizer
            .encode(prompt.as_bytes())
            .map_err(|err| GenerateError::Tokenizer(err.into()))?;
        let request = GenerationRequest {
            prompt,
            length,
            num_samples,
            params: sampler,
            seed,
        };
        let sequences = SequenceSampler::new(&*self.oracle)
            .with_limits(self.reload.limits)
            .sample(&request)
            .await?;

        let prompt_len = request.prompt.len();
        let mut choices = Vec::with_capacity(sequences.len());
        for sequence in &sequences {
            let bytes = self
                .tokenizer
                .decode(&sequence[prompt_len..])
                .map_err(|err| GenerateError::Tokenizer(err.into()))?;
            choices.push(String::from_utf8_lossy(&bytes).into_owned());
        }

        let completion = length * num_samples;
        let counter = TokenCounter {
            prompt: prompt_len,
            completion,
            total: prompt_len + completion,
            duration: instant.elapsed(),
        };
        log::info!(
            "[generate][prompt: {prompt_len}][completion: {completion}][duration: {:?}]",
            counter.duration
        );
        Ok(GenerateResponse { choices, counter })
    }
}

pub async fn model_route(receiver: Receiver<ThreadRequest>) -> Result<()> {
    let env: Arc<RwLock<Environment>> = Default::default();

    loop {
        let Ok(request) = receiver.recv_async().await else {
            log::info!("core exit");
            break Ok(());
        };

        match request {
            ThreadRequest::Adapter(sender) => {
                tokio::spawn(async move {
                    let _ = sender.send(run::list_adapters().await);
                });
            }
            ThreadRequest::Info(sender) => {
                let env = env.clone();
                tokio::spawn(async move {
                    let env = &(*env.read().await);
                    if let Environment::Loaded(runtime) = env {
                        let _ = sender.send(runtime.info());
                    }
                });
            }
            ThreadRequest::Reload {
                request,
                sender: reload_sender,
            } => {
                let env = env.clone();
                let reload = async move {
                    let mut env = env.write().await;
                    // release the previous model before materializing the new one
                    let _ = std::mem::take(&mut *env);
                    let runtime = Runtime::load(*request).await?;
                    *env = Environment::Loaded(runtime);
                    anyhow::Ok(())
                };
                let callback = move |result: bool| {
                    if let Some(sender) = reload_sender {
                        let _ = sender.send(result);
                    }
                };
                tokio::spawn(async move {
                    match reload.await {
                        Ok(_) => {
                            callback(true);
                            log::info!("model loaded")
                        }
                        Err(err) => {
                            callback(false);
                            log::error!("load runtime failed: {}", err);
                        }
                    };
                });
            }
            ThreadRequest::Unload => {
                let env = env.clone();
                tokio::spawn(async move {
                    let mut env = env.write().await;
                    let _ = std::mem::take(&mut *env);
                    log::info!("runtime unloaded");
                });
            }
            ThreadRequest::Generate { request, sender } => {
                let env = env.clone();
                tokio::spawn(async move {
                    let runtime = match &*env.read().await {
                        Environment::Loaded(runtime) => runtime.clone(),
                        Environment::None => {
                            log::warn!("generate request dropped: runtime not loaded");
                            return;
                        }
                    };
                    let result = runtime.generate(*request).await;
                    if let Err(err) = &result {
                        log::error!("generate failed: {err}");
                    }
                    let _ = sender.send(result);
                });
            }
        };
    }
}

#[allow(dead_code)]
mod sealed {
    use salvo::oapi::ToSchema;

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
    pub enum Quant {
        /// No quantization.
        #[default]
        None,
        /// Use `Int8` quantization.
        Int8,
        /// Use `NF4` quantization.
        NF4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_request_defaults_follow_predict() {
        let request: GenerateRequest = serde_json::from_str(r#"{ "prompt": "Hello" }"#).unwrap();
        assert_eq!(request.prompt, "Hello");
        assert_eq!(request.length, 10);
        assert_eq!(request.num_samples, 1);
        assert_eq!(request.sampler, SamplerParams::default());
        assert_eq!(request.seed, None);
    }

    #[test]
    fn generate_request_reads_partial_sampler() {
        let request: GenerateRequest = serde_json::from_str(
            r#"{
                "prompt": "Hi",
                "max_tokens": 4,
                "n": 2,
                "sampler": { "top_k": 5, "temperature": 0.0 },
                "seed": 9
            }"#,
        )
        .unwrap();
        assert_eq!(request.length, 4);
        assert_eq!(request.num_samples, 2);
        assert_eq!(request.sampler.top_k, 5);
        assert_eq!(request.sampler.temperature, 0.0);
        assert_eq!(request.sampler.top_p, 0.9);
        assert_eq!(request.seed, Some(9));
    }

    #[tokio::test]
    async fn generate_without_runtime_closes_the_channel() {
        let (sender, receiver) = flume::unbounded();
        tokio::spawn(model_route(receiver));

        let (result_sender, result_receiver) = flume::unbounded();
        let _ = sender.send(ThreadRequest::Generate {
            request: Box::new(GenerateRequest::default()),
            sender: result_sender,
        });
        assert!(result_receiver.recv_async().await.is_err());
    }
}

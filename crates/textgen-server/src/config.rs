use std::net::{IpAddr, Ipv4Addr};

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use textgen_core::{
    reload::{AdapterOption, Model, Tokenizer},
    GenerationLimits, ReloadRequest, SamplerParams,
};

use crate::build_path;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: Model,
    pub tokenizer: Tokenizer,
    pub adapter: AdapterOption,
    pub listen: ListenerOption,
    pub predict: PredictOption,
    pub limits: GenerationLimits,
}

impl TryFrom<Config> for ReloadRequest {
    type Error = anyhow::Error;

    fn try_from(value: Config) -> Result<Self, Self::Error> {
        let Config {
            model:
                Model {
                    name,
                    path,
                    quant,
                    quant_type,
                    precision,
                    token_chunk_size,
                    max_cache_items,
                },
            tokenizer: Tokenizer {
                path: tokenizer_path,
            },
            adapter,
            limits,
            ..
        } = value;

        let model_path = build_path(&path, name)?;

        Ok(Self {
            model_path,
            quant,
            quant_type,
            precision,
            token_chunk_size,
            max_cache_items,
            tokenizer_path,
            adapter,
            limits,
        })
    }
}

#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ListenerOption {
    /// Ip to listen to.
    #[derivative(Default(value = "IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))"))]
    pub ip: IpAddr,
    /// Binding port.
    #[derivative(Default(value = "65530u16"))]
    pub port: u16,
}

/// Defaults used by `/api/predict`, which only receives a prompt.
#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct PredictOption {
    /// Number of tokens to generate.
    #[derivative(Default(value = "10"))]
    pub length: usize,
    /// Sampler parameters.
    pub sampler: SamplerParams,
    /// Put between the prompt and the generated text in the response.
    #[derivative(Default(value = "String::from(\" - \")"))]
    pub separator: String,
}

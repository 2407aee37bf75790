use std::{path::Path, sync::Arc};

use anyhow::{bail, Result};
use derivative::Derivative;
use half::f16;
use memmap2::Mmap;
use safetensors::SafeTensors;
use tokio::{
    fs::File,
    io::{AsyncReadExt, BufReader},
    sync::Mutex,
};
use web_rwkv::{
    context::{Context, ContextBuilder, InstanceExt},
    runtime::{
        infer::{Rnn, RnnInput, RnnInputBatch, RnnOption, RnnOutputBatch},
        loader::Loader,
        model::{Bundle, ContextAutoLimits, ModelBuilder, ModelInfo, ModelVersion, State},
        v4, v5, v6, Runtime, TokioRuntime,
    },
    tensor::TensorCpu,
    tokenizer::Tokenizer,
    wgpu::{Backends, PowerPreference},
};

use crate::{
    cache::PrefixCache,
    oracle::ScoreOracle,
    reload::{AdapterOption, Precision},
    AdapterList, ReloadRequest,
};

/// The oracle runs a single sequence at a time in this batch slot.
const BATCH: usize = 0;

/// A [`ScoreOracle`] backed by an RWKV model running on web-rwkv.
///
/// RWKV is recurrent, so scoring a sequence only needs the state left by its longest already-scored prefix.
/// The oracle keeps the last few `(sequence, state)` pairs around and only runs the uncached suffix.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RwkvOracle {
    info: ModelInfo,
    #[derivative(Debug = "ignore")]
    runtime: Arc<dyn Runtime<Rnn> + Send + Sync>,
    #[derivative(Debug = "ignore")]
    state: Arc<dyn State + Send + Sync>,
    token_chunk_size: usize,
    #[derivative(Debug = "ignore")]
    cache: Mutex<PrefixCache<TensorCpu<f32>>>,
}

impl RwkvOracle {
    pub fn new(
        info: ModelInfo,
        runtime: Arc<dyn Runtime<Rnn> + Send + Sync>,
        state: Arc<dyn State + Send + Sync>,
        reload: &ReloadRequest,
    ) -> Self {
        Self {
            info,
            runtime,
            state,
            token_chunk_size: reload.token_chunk_size.max(1),
            cache: Mutex::new(PrefixCache::new(reload.max_cache_items)),
        }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Run `suffix` on top of `state` and return the last output and the resulting state.
    async fn infer(&self, state: TensorCpu<f32>, suffix: Vec<u32>) -> Result<(Vec<f32>, TensorCpu<f32>)> {
        self.state.load(state, BATCH)?;

        let mut input = RnnInput::new(
            vec![RnnInputBatch::new(suffix, RnnOption::Last)],
            self.token_chunk_size,
        );
        let mut scores = None;
        while input.num_token() > 0 {
            let (next, output) = self.runtime.infer(input).await?;
            input = next;

            for (_, RnnOutputBatch(output)) in output
                .iter()
                .enumerate()
                .filter(|(batch, output)| *batch == BATCH && !output.is_empty())
            {
                scores = Some(output.to_vec());
            }
        }

        let Some(scores) = scores else {
            bail!("model produced no output");
        };
        let state = self.state.back(BATCH).await?;
        Ok((scores, state))
    }
}

impl ScoreOracle for RwkvOracle {
    fn num_vocab(&self) -> usize {
        self.info.num_vocab
    }

    async fn next_token_scores(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            bail!("cannot score an empty sequence");
        }

        let mut cache = self.cache.lock().await;
        if let Some(output) = cache.output(tokens) {
            log::debug!("[oracle][hit][len: {}]", tokens.len());
            return Ok(output.to_vec());
        }

        let (state, len) = match cache.longest_prefix(tokens) {
            Some((state, len)) => (state.clone(), len),
            None => (self.state.init(), 0),
        };
        log::debug!("[oracle][prefix: {len}][suffix: {}]", tokens.len() - len);

        let (output, state) = self.infer(state, tokens[len..].to_vec()).await?;
        cache.insert(tokens.to_vec(), state, output.clone());
        Ok(output)
    }
}

pub async fn list_adapters() -> AdapterList {
    let backends = Backends::all();
    let instance = web_rwkv::wgpu::Instance::default();
    let list = instance
        .enumerate_adapters(backends)
        .await
        .into_iter()
        .map(|adapter| adapter.get_info())
        .map(|info| format!("{} ({:?})", info.name, info.backend))
        .collect();
    AdapterList(list)
}

async fn create_context(adapter: AdapterOption, info: &ModelInfo) -> Result<Context> {
    let backends = Backends::all();
    let instance = web_rwkv::wgpu::Instance::default();
    let adapter = match adapter {
        AdapterOption::Auto => instance.adapter(PowerPreference::HighPerformance).await,
        AdapterOption::Economical => instance.adapter(PowerPreference::LowPower).await,
        AdapterOption::Manual(selection) => Ok(instance
            .enumerate_adapters(backends)
            .await
            .into_iter()
            .nth(selection)
            .ok_or(web_rwkv::context::ContextError::RequestAdapterFailed)?),
    }?;
    let context = ContextBuilder::new(adapter)
        .auto_limits(info)
        .build()
        .await?;
    Ok(context)
}

pub async fn load_tokenizer(path: impl AsRef<Path>) -> Result<Tokenizer> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut contents = String::new();
    reader.read_to_string(&mut contents).await?;
    Ok(Tokenizer::new(&contents)?)
}

/// Materialize the model at `reload.model_path` into a ready-to-use oracle.
pub async fn load_oracle(reload: &ReloadRequest) -> Result<RwkvOracle> {
    let file = File::open(&reload.model_path).await?;
    let data = unsafe { Mmap::map(&file)? };

    let model = SafeTensors::deserialize(&data)?;
    let info = Loader::info(&model)?;
    log::info!("loading model {:?}", reload.model_path);
    log::info!("{:#?}", info);

    let context = create_context(reload.adapter, &info).await?;
    log::info!("{:#?}", context.adapter.get_info());

    let quant = (0..reload.quant)
        .map(|layer| (layer, reload.quant_type))
        .collect();
    let builder = ModelBuilder::new(&context, model).quant(quant);

    macro_rules! match_safe_tensors {
        (($v:expr, $p:expr), { $(($version:path, $precision:path, $build:ident, $bundle:ty)),+ }) => {
            match ($v, $p) {
                $(
                    ($version, $precision) => {
                        let model = builder.$build().await?;
                        let bundle = <$bundle>::new(model, 1);
                        let state: Arc<dyn State + Send + Sync> = Arc::new(bundle.state());
                        let runtime: Arc<dyn Runtime<Rnn> + Send + Sync> =
                            Arc::new(TokioRuntime::new(bundle).await);
                        (runtime, state)
                    }
                )+
                (version, _) => bail!("unsupported version: {:?}", version)
            }
        }
    }
    let (runtime, state) = match_safe_tensors!(
        (info.version, reload.precision),
        {
            (ModelVersion::V4, Precision::Fp16, build_v4, v4::Bundle::<f16>),
            (ModelVersion::V5, Precision::Fp16, build_v5, v5::Bundle::<f16>),
            (ModelVersion::V6, Precision::Fp16, build_v6, v6::Bundle::<f16>),
            (ModelVersion::V4, Precision::Fp32, build_v4, v4::Bundle::<f32>),
            (ModelVersion::V5, Precision::Fp32, build_v5, v5::Bundle::<f32>),
            (ModelVersion::V6, Precision::Fp32, build_v6, v6::Bundle::<f32>)
        }
    );

    Ok(RwkvOracle::new(info, runtime, state, reload))
}

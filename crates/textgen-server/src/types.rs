use std::path::PathBuf;

use salvo::oapi::ToSchema;
use serde::{Deserialize, Serialize};
use textgen_core::ThreadRequest;

use crate::config::PredictOption;

#[derive(Debug, Default, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum Array<T> {
    #[default]
    None,
    Item(T),
    Vec(Vec<T>),
}

impl<T> From<Array<T>> for Vec<T> {
    fn from(value: Array<T>) -> Self {
        match value {
            Array::None => vec![],
            Array::Item(item) => vec![item],
            Array::Vec(vec) => vec,
        }
    }
}

pub type ThreadSender = flume::Sender<ThreadRequest>;

/// Injected into every request.
#[derive(Debug, Clone)]
pub struct ThreadState {
    pub sender: ThreadSender,
    /// Folder that models may be loaded from.
    pub path: PathBuf,
    /// Configured tokenizer. Reloads may only pick tokenizers next to it.
    pub tokenizer: PathBuf,
    pub predict: PredictOption,
}

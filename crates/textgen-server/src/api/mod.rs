use anyhow::Result;
use salvo::http::StatusCode;
use textgen_core::{GenerateError, GenerateRequest, GenerateResponse, RuntimeInfo, ThreadRequest};

use crate::types::ThreadSender;

pub mod adapter;
pub mod model;
pub mod predict;

pub use adapter::adapters;
pub use model::{info, load, unload};
pub use predict::generate;

pub async fn try_request_info(sender: ThreadSender) -> Result<RuntimeInfo> {
    let (info_sender, info_receiver) = flume::unbounded();
    let _ = sender.send(ThreadRequest::Info(info_sender));
    let runtime_info = info_receiver.recv_async().await?;
    Ok(runtime_info)
}

/// Run one generation on the model thread.
///
/// Returns `None` if no model is loaded.
pub async fn request_generate(
    sender: ThreadSender,
    request: GenerateRequest,
) -> Option<Result<GenerateResponse, GenerateError>> {
    let (result_sender, result_receiver) = flume::bounded(1);
    let _ = sender.send(ThreadRequest::Generate {
        request: Box::new(request),
        sender: result_sender,
    });
    result_receiver.recv_async().await.ok()
}

pub fn status_of(err: &GenerateError) -> StatusCode {
    match err {
        GenerateError::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
        GenerateError::Oracle(_)
        | GenerateError::DegenerateDistribution
        | GenerateError::Tokenizer(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

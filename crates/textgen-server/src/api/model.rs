use std::sync::Arc;

use salvo::{oapi::extract::JsonBody, prelude::*};
use serde::Serialize;
use textgen_core::{ReloadRequest, RuntimeInfo, ThreadRequest};
use web_rwkv::runtime::model::ModelInfo;

use super::*;
use crate::{confine_reload, types::ThreadState};

#[derive(Debug, Clone, Serialize)]
struct InfoResponse {
    reload: Arc<ReloadRequest>,
    model: ModelInfo,
}

/// Report the current runtime info.
///
/// `/api/models/info`.
#[handler]
pub async fn info(depot: &mut Depot, res: &mut Response) -> StatusCode {
    let Ok(ThreadState { sender, .. }) = depot.obtain::<ThreadState>() else {
        return StatusCode::INTERNAL_SERVER_ERROR;
    };
    let Ok(RuntimeInfo { reload, model, .. }) = try_request_info(sender.clone()).await else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    res.render(Json(InfoResponse { reload, model }));
    StatusCode::OK
}

/// Load a model, replacing the current one.
///
/// `/admin/models/load`.
#[endpoint]
pub async fn load(depot: &mut Depot, req: JsonBody<ReloadRequest>) -> StatusCode {
    let Ok(ThreadState {
        sender,
        path,
        tokenizer,
        ..
    }) = depot.obtain::<ThreadState>()
    else {
        return StatusCode::INTERNAL_SERVER_ERROR;
    };
    let (result_sender, result_receiver) = flume::unbounded();
    let mut request = req.0;

    // make sure that we are not visiting un-permitted path.
    if confine_reload(&mut request, path, tokenizer).is_err() {
        return StatusCode::NOT_FOUND;
    }

    let _ = sender.send(ThreadRequest::Reload {
        request: Box::new(request),
        sender: Some(result_sender),
    });
    match result_receiver.recv_async().await {
        Ok(true) => StatusCode::OK,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Unload the current model.
///
/// `/admin/models/unload`.
#[endpoint]
pub async fn unload(depot: &mut Depot) -> StatusCode {
    let Ok(ThreadState { sender, .. }) = depot.obtain::<ThreadState>() else {
        return StatusCode::INTERNAL_SERVER_ERROR;
    };
    let _ = sender.send(ThreadRequest::Unload);
    StatusCode::OK
}

use salvo::prelude::*;
use textgen_core::{AdapterList, ThreadRequest};

use crate::types::ThreadState;

/// `/api/adapters`.
#[endpoint]
pub async fn adapters(depot: &mut Depot) -> Json<Vec<String>> {
    let Ok(ThreadState { sender, .. }) = depot.obtain::<ThreadState>() else {
        return Json(vec![]);
    };
    let (list_sender, list_receiver) = flume::unbounded();
    let _ = sender.send(ThreadRequest::Adapter(list_sender));
    let AdapterList(list) = list_receiver.recv_async().await.unwrap_or_default();
    Json(list)
}

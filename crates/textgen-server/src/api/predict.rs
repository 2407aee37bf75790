use salvo::{
    oapi::{extract::JsonBody, ToResponse, ToSchema},
    prelude::*,
};
use serde::{Deserialize, Serialize};
use textgen_core::{GenerateRequest, GenerateResponse};

use super::*;
use crate::{
    config::PredictOption,
    types::{Array, ThreadState},
};

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct PredictRequest {
    /// Text to continue. With an array payload only the first item is used.
    #[serde(alias = "data")]
    prompt: Array<String>,
}

#[derive(Debug, Serialize, ToSchema, ToResponse)]
pub struct PredictResponse {
    response: String,
}

#[derive(Debug, Serialize, ToSchema, ToResponse)]
pub struct ErrorResponse {
    error: String,
}

impl PredictRequest {
    fn into_request(self, option: &PredictOption) -> GenerateRequest {
        let prompt = Vec::from(self.prompt)
            .into_iter()
            .next()
            .unwrap_or_default();
        GenerateRequest {
            prompt,
            length: option.length,
            sampler: option.sampler,
            ..Default::default()
        }
    }
}

/// Join the prompt and the generated continuation into one reply.
pub fn format_response(prompt: &str, text: &str, separator: &str) -> String {
    format!("{prompt}{separator}{text}")
}

async fn respond(
    depot: &mut Depot,
    request: GenerateRequest,
    res: &mut Response,
) -> Result<GenerateResponse, StatusCode> {
    let Ok(ThreadState { sender, .. }) = depot.obtain::<ThreadState>() else {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };
    match request_generate(sender.clone(), request).await {
        Some(Ok(response)) => Ok(response),
        Some(Err(err)) => {
            let status = status_of(&err);
            res.render(Json(ErrorResponse {
                error: err.to_string(),
            }));
            Err(status)
        }
        None => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// Continue a prompt with the configured defaults and reply with prompt and continuation joined.
///
/// `/api/predict`.
#[endpoint(
    responses(
        (status_code = 200, description = "The prompt followed by its continuation.", body = PredictResponse),
        (status_code = 500, description = "Generation failed.", body = ErrorResponse)
    )
)]
pub async fn predict(
    depot: &mut Depot,
    req: JsonBody<PredictRequest>,
    res: &mut Response,
) -> StatusCode {
    let Ok(ThreadState { predict: option, .. }) = depot.obtain::<ThreadState>() else {
        return StatusCode::INTERNAL_SERVER_ERROR;
    };
    let option = option.clone();
    let request = req.0.into_request(&option);
    let prompt = request.prompt.clone();

    match respond(depot, request, res).await {
        Ok(GenerateResponse { choices, .. }) => {
            let text = choices.into_iter().next().unwrap_or_default();
            let response = format_response(&prompt, &text, &option.separator);
            res.render(Json(PredictResponse { response }));
            StatusCode::OK
        }
        Err(status) => status,
    }
}

/// Generate `num_samples` continuations with explicit sampler parameters.
///
/// `/api/generate`.
#[endpoint(
    responses(
        (status_code = 200, description = "Generated continuations and token usage.", body = GenerateResponse),
        (status_code = 400, description = "Invalid sampler configuration.", body = ErrorResponse),
        (status_code = 500, description = "Generation failed.", body = ErrorResponse)
    )
)]
pub async fn generate(
    depot: &mut Depot,
    req: JsonBody<GenerateRequest>,
    res: &mut Response,
) -> StatusCode {
    match respond(depot, req.0, res).await {
        Ok(response) => {
            res.render(Json(response));
            StatusCode::OK
        }
        Err(status) => status,
    }
}

use actix_multipart::Multipart;
use actix_web::{HttpResponse, web};
use futures::StreamExt;
use log::{error, info, warn};
use shared::ErrorResponse;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::diagnosis::{InferenceError, InferenceService, Prediction};

pub const XRAY_FIELD: &str = "xray";
pub const AUDIO_FIELD: &str = "audio";

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/predict").route(web::post().to(handle_predict)));
}

#[derive(Default)]
struct Uploads {
    xray: Option<Vec<u8>>,
    audio: Option<Vec<u8>>,
}

impl Uploads {
    fn into_pair(self) -> Result<(Vec<u8>, Vec<u8>), InferenceError> {
        match (self.xray, self.audio) {
            (Some(xray), Some(audio)) => Ok((xray, audio)),
            (xray, audio) => {
                let missing: Vec<&str> = [(XRAY_FIELD, xray.is_none()), (AUDIO_FIELD, audio.is_none())]
                    .into_iter()
                    .filter_map(|(name, absent)| absent.then_some(name))
                    .collect();
                Err(InferenceError::MissingInput(missing.join(", ")))
            }
        }
    }
}

async fn read_uploads(mut payload: Multipart, limit: usize) -> Result<Uploads, InferenceError> {
    let mut uploads = Uploads::default();

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| InferenceError::MalformedRequest(e.to_string()))?;
        let name = field.name().unwrap_or_default().to_string();

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| InferenceError::MalformedRequest(e.to_string()))?;
            if data.len() + chunk.len() > limit {
                return Err(InferenceError::PayloadTooLarge { field: name, limit });
            }
            data.extend_from_slice(&chunk);
        }

        match name.as_str() {
            XRAY_FIELD => uploads.xray = Some(data),
            AUDIO_FIELD => uploads.audio = Some(data),
            other => log::debug!("Ignoring unexpected form field '{}'", other),
        }
    }

    Ok(uploads)
}

async fn run_prediction(
    service: &InferenceService,
    config: &ServiceConfig,
    payload: Multipart,
) -> Result<Prediction, InferenceError> {
    let (xray, audio) = read_uploads(payload, config.max_upload_bytes).await?.into_pair()?;

    let service = service.clone();
    let job = web::block(move || service.predict(&xray, &audio));
    match tokio::time::timeout(config.inference_timeout(), job).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(InferenceError::Internal(format!("blocking task failed: {}", e))),
        Err(_) => {
            // web::block jobs cannot be cancelled; this one keeps the model
            // lock until it finishes.
            warn!(
                "Inference exceeded {}s; the detached job is still running and holds the model",
                config.inference_timeout_secs
            );
            Err(InferenceError::Timeout(config.inference_timeout_secs))
        }
    }
}

async fn handle_predict(
    service: web::Data<InferenceService>,
    config: web::Data<ServiceConfig>,
    payload: Multipart,
) -> HttpResponse {
    let request_id = Uuid::new_v4();

    match run_prediction(&service, &config, payload).await {
        Ok(prediction) => {
            let response = prediction.into_response();
            info!(
                "[{}] healthy={:.2} pneumonia={:.2} -> {}",
                request_id,
                response.healthy,
                response.pneumonia,
                response.most_likely()
            );
            HttpResponse::Ok().json(response)
        }
        Err(e) => error_response(request_id, &e),
    }
}

fn error_response(request_id: Uuid, err: &InferenceError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.public_message(),
    };
    match err {
        InferenceError::PayloadTooLarge { .. } => {
            warn!("[{}] {}", request_id, err);
            HttpResponse::PayloadTooLarge().json(body)
        }
        _ if err.is_client_error() => {
            warn!("[{}] {}", request_id, err);
            HttpResponse::BadRequest().json(body)
        }
        _ => {
            error!("[{}] Prediction failed: {}", request_id, err);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

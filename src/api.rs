//! HTTP facade binding the update pipeline to actix-web.
//!
//! Streams the multipart firmware upload chunk-by-chunk into the active
//! [`Updater`] session; every session error is converted into an HTTP error
//! response with the reason echoed verbatim in the body, never into an
//! unhandled fault.

use crate::{
    connectivity::{ConnectivityManager, ConnectivityState},
    session::{ProgressSnapshot, UpdateError, Updater},
    templates,
};
use actix_multipart::{Field, Multipart};
use actix_web::{HttpRequest, HttpResponse, Responder, http::StatusCode, web};
use futures_util::{Stream, TryStreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;

/// Name of the multipart field carrying the firmware image.
const FIRMWARE_FIELD: &str = "firmware";

/// Header the upload page sets to the exact image size, letting the session
/// verify the byte count independently of multipart framing overhead.
const SIZE_HEADER: &str = "x-firmware-size";

/// Upper bound on multipart boundary/header overhead accepted on top of the
/// region capacity when pre-checking Content-Length.
const MULTIPART_OVERHEAD_ALLOWANCE: u64 = 16 * 1024;

#[derive(Clone)]
pub struct Api {
    pub updater: Arc<Updater>,
    pub connectivity: Arc<ConnectivityManager>,
    pub restart_tx: broadcast::Sender<()>,
    pub idle_timeout: Duration,
    pub restart_grace: Duration,
}

#[derive(Serialize)]
struct StatusResponse {
    connectivity: ConnectivityState,
    update: Option<ProgressSnapshot>,
    last_error: Option<String>,
}

impl Api {
    pub async fn index() -> impl Responder {
        HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(templates::UPLOAD_PAGE)
    }

    pub async fn version() -> impl Responder {
        HttpResponse::Ok().body(env!("CARGO_PKG_VERSION"))
    }

    /// Machine-readable status: connectivity diagnostics plus the active
    /// session's progress and the last terminal failure, if any.
    pub async fn status(api: web::Data<Api>) -> impl Responder {
        HttpResponse::Ok().json(StatusResponse {
            connectivity: api.connectivity.state(),
            update: api.updater.snapshot(),
            last_error: api.updater.last_failure().map(|e| e.to_string()),
        })
    }

    /// Operator-initiated restart through the same channel used after a
    /// successful update.
    pub async fn reboot(api: web::Data<Api>) -> impl Responder {
        info!("reboot requested");
        schedule_restart(api.get_ref().clone());
        HttpResponse::Ok().body("rebooting")
    }

    /// Streamed firmware upload: exactly one `firmware` file field.
    pub async fn update(
        req: HttpRequest,
        mut payload: Multipart,
        api: web::Data<Api>,
    ) -> impl Responder {
        debug!("update() called");

        if api.updater.in_progress() {
            return error_response(&UpdateError::AlreadyInProgress);
        }

        // Refuse uploads the region can never hold before streaming a byte.
        // Content-Length includes multipart framing, so it only serves as an
        // upper bound here; the exact check is the declared size below.
        if let Some(content_length) = header_u64(&req, "content-length") {
            if content_length > api.updater.capacity() + MULTIPART_OVERHEAD_ALLOWANCE {
                return error_response(&UpdateError::StorageFull);
            }
        }
        let declared = header_u64(&req, SIZE_HEADER);

        let mut field = match firmware_field(&mut payload).await {
            Ok(field) => field,
            Err(response) => return response,
        };

        if let Err(e) = api.updater.open(declared) {
            error!("failed to open update session: {e}");
            return error_response(&e);
        }
        info!("firmware upload started (declared size: {declared:?})");

        let streamed = stream_body(&api, &mut field).await;
        let outcome = match streamed {
            Ok(()) => api.updater.finalize(),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                info!(
                    "firmware update applied, restarting in {:?}",
                    api.restart_grace
                );
                schedule_restart(api.get_ref().clone());
                HttpResponse::Ok().body("update successful, device restarting")
            }
            Err(e) => {
                // Covers the paths where the session is still open (timeout,
                // client disconnect); a no-op after terminal outcomes.
                api.updater.abort(e.clone());
                error!("firmware update failed: {e}");
                error_response(&e)
            }
        }
    }
}

/// Consume chunks as they arrive, bounded by the per-chunk idle timeout.
///
/// Generic over the byte stream so any transport failure maps the same way;
/// in production the stream is the multipart firmware [`Field`].
async fn stream_body<S, E>(api: &Api, body: &mut S) -> Result<(), UpdateError>
where
    S: Stream<Item = Result<web::Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        match tokio::time::timeout(api.idle_timeout, body.try_next()).await {
            Err(_) => return Err(UpdateError::Timeout),
            Ok(Err(e)) => {
                warn!("upload stream interrupted: {e}");
                return Err(UpdateError::ClientDisconnected);
            }
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(chunk))) => api.updater.consume(&chunk)?,
        }
    }
}

/// Locate the firmware file field, skipping any unrelated form fields.
async fn firmware_field(payload: &mut Multipart) -> Result<Field, HttpResponse> {
    loop {
        match payload.try_next().await {
            Ok(Some(field)) if field.name() == Some(FIRMWARE_FIELD) => return Ok(field),
            Ok(Some(field)) => {
                debug!("skipping unexpected upload field {:?}", field.name());
            }
            Ok(None) => {
                return Err(HttpResponse::BadRequest().body("missing firmware field"));
            }
            Err(e) => {
                warn!("malformed upload: {e}");
                return Err(HttpResponse::BadRequest().body(format!("malformed upload: {e}")));
            }
        }
    }
}

fn header_u64(req: &HttpRequest, name: &str) -> Option<u64> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn error_response(e: &UpdateError) -> HttpResponse {
    let status = match e {
        UpdateError::AlreadyInProgress => StatusCode::CONFLICT,
        UpdateError::SizeMismatch { .. } | UpdateError::IntegrityMismatch => {
            StatusCode::BAD_REQUEST
        }
        UpdateError::StorageFull => StatusCode::INSUFFICIENT_STORAGE,
        UpdateError::Timeout => StatusCode::REQUEST_TIMEOUT,
        UpdateError::StorageWrite(_) | UpdateError::ClientDisconnected => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    HttpResponse::build(status).body(e.to_string())
}

/// Signal the host restart channel once the grace period has elapsed, so the
/// response reaches the client before the device goes down.
fn schedule_restart(api: Api) {
    tokio::spawn(async move {
        tokio::time::sleep(api.restart_grace).await;
        if api.restart_tx.send(()).is_err() {
            error!("restart channel closed, cannot restart");
        }
    });
}

/// Route table, shared by the binary and the integration tests.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(Api::index))
        .route("/ota", web::get().to(Api::index))
        .route("/update", web::post().to(Api::update))
        .route("/api/status", web::get().to(Api::status))
        .route("/version", web::get().to(Api::version))
        .route("/reboot", web::post().to(Api::reboot));
}

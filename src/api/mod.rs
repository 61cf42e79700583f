use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use color_eyre::Result;
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    govee::{
        command::{ControlRequest, RawControlBody},
        device::DeviceRef,
        error::GatewayError,
    },
    settings::ApiSettings,
    sync::coordinator::SyncCoordinator,
};

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ApiError {
    fn new(error: impl Into<String>) -> Self {
        ApiError {
            error: error.into(),
            details: None,
        }
    }

    fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        ApiError {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitedResponse {
    error: &'static str,
    retry_after: u64,
}

#[derive(Debug, Deserialize)]
struct BatchStateRequest {
    devices: Vec<DeviceRef>,
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Body>> {
    let json = serde_json::to_string(body)?;

    let mut response = Response::new(Body::from(json));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    Ok(response)
}

fn query_param(req: &Request<Body>, name: &str) -> Option<String> {
    let query = req.uri().query()?;

    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

async fn get_devices(coordinator: &SyncCoordinator) -> Result<Response<Body>> {
    let devices = coordinator.gateway().list_devices().await;

    json_response(StatusCode::OK, &devices)
}

async fn get_device_state(coordinator: &SyncCoordinator, req: &Request<Body>) -> Result<Response<Body>> {
    let (Some(device), Some(model)) = (query_param(req, "device"), query_param(req, "model")) else {
        return json_response(StatusCode::BAD_REQUEST, &ApiError::new("Missing device or model"));
    };

    match coordinator.gateway().read_state(&device, &model).await {
        Ok(properties) => json_response(StatusCode::OK, &properties),
        Err(e) => {
            warn!("Failed to fetch state for {}: {}", device, e);

            if let GatewayError::RateLimited { retry_after } = e {
                coordinator.enter_cooldown(retry_after.unwrap_or(coordinator.default_retry_after()));
            }

            json_response(StatusCode::OK, &serde_json::Value::Null)
        }
    }
}

async fn post_device_states(coordinator: &SyncCoordinator, req: Request<Body>) -> Result<Response<Body>> {
    let body = hyper::body::to_bytes(req.into_body()).await?;

    let Ok(request) = serde_json::from_slice::<BatchStateRequest>(&body) else {
        return json_response(StatusCode::BAD_REQUEST, &ApiError::new("Invalid input"));
    };

    match coordinator.gateway().read_states(&request.devices).await {
        Ok(entries) => json_response(StatusCode::OK, &entries),
        Err(GatewayError::RateLimited { retry_after }) => {
            let retry_after = retry_after.unwrap_or(coordinator.default_retry_after());
            coordinator.enter_cooldown(retry_after);

            json_response(
                StatusCode::TOO_MANY_REQUESTS,
                &RateLimitedResponse {
                    error: "Too Many Requests",
                    retry_after,
                },
            )
        }
        Err(e) => {
            error!("Batch state read failed: {}", e);
            json_response(StatusCode::INTERNAL_SERVER_ERROR, &ApiError::new("Server error"))
        }
    }
}

async fn put_control(coordinator: &SyncCoordinator, req: Request<Body>) -> Result<Response<Body>> {
    let body = hyper::body::to_bytes(req.into_body()).await?;

    let Ok(raw) = serde_json::from_slice::<RawControlBody>(&body) else {
        return json_response(StatusCode::BAD_REQUEST, &ApiError::new("Invalid JSON body"));
    };

    let request = match ControlRequest::try_from(raw) {
        Ok(request) => request,
        Err(e) => return json_response(StatusCode::BAD_REQUEST, &ApiError::new(e.to_string())),
    };

    match coordinator.gateway().send_command(&request).await {
        Ok(response) => json_response(StatusCode::OK, &response),
        Err(GatewayError::Client { status, message }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let reason = status.canonical_reason().unwrap_or("Unknown");

            json_response(
                status,
                &ApiError::with_details(format!("Govee API error: {reason}"), message),
            )
        }
        Err(GatewayError::RateLimited { retry_after }) => {
            coordinator.enter_cooldown(retry_after.unwrap_or(coordinator.default_retry_after()));

            json_response(
                StatusCode::TOO_MANY_REQUESTS,
                &ApiError::with_details("Govee API error: Too Many Requests", ""),
            )
        }
        Err(GatewayError::Validation(message)) => {
            json_response(StatusCode::BAD_REQUEST, &ApiError::new(message))
        }
        Err(GatewayError::Transport(message)) => {
            error!("Control request failed: {}", message);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ApiError::new("Internal Server Error"),
            )
        }
    }
}

/// Dispatches one proxy request to its handler.
pub async fn route(coordinator: &SyncCoordinator, req: Request<Body>) -> Result<Response<Body>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/api/devices") => get_devices(coordinator).await,
        (&Method::GET, "/api/devices/state") => get_device_state(coordinator, &req).await,
        (&Method::POST, "/api/devices/state") => post_device_states(coordinator, req).await,
        (&Method::PUT, "/api/control") => put_control(coordinator, req).await,
        _ => json_response(StatusCode::NOT_FOUND, &ApiError::new("Not Found")),
    }
}

async fn handle(coordinator: Arc<SyncCoordinator>, req: Request<Body>) -> Response<Body> {
    match route(&coordinator, req).await {
        Ok(response) => response,
        Err(e) => {
            error!("Error while handling API request: {:?}", e);

            let mut response = Response::new(Body::from("Internal Server Error"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

pub fn start_api_server(settings: &ApiSettings, coordinator: &Arc<SyncCoordinator>) -> Result<()> {
    let addr: SocketAddr = settings.bind.parse()?;
    let coordinator = coordinator.clone();

    let make_svc = make_service_fn(move |_conn| {
        let coordinator = coordinator.clone();

        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let coordinator = coordinator.clone();
                async move { Ok::<_, Infallible>(handle(coordinator, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!("API server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("API server terminated: {}", e);
        }
    });

    Ok(())
}

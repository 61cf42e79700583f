use std::time::Duration;

use color_eyre::Result;
use eyre::eyre;
use hyper::{
    body::Bytes,
    header::{CONTENT_TYPE, RETRY_AFTER},
    Method, Request, StatusCode, Uri,
};
use hyper_rustls::HttpsConnectorBuilder;
use log::debug;
use serde::Deserialize;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::{govee::error::GatewayError, settings::GoveeSettings};

pub type HyperHttpsClient = hyper::Client<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>;

const API_KEY_HEADER: &str = "Govee-API-Key";

pub fn mk_hyper_https_client(settings: &GoveeSettings) -> Result<HyperHttpsClient> {
    // Allow overriding the trusted CA certificates, e.g. when running behind a
    // TLS intercepting proxy
    let builder = match &settings.ca_cert {
        Some(cert) => {
            let certs = rustls_pemfile::certs(&mut cert.as_bytes())?;

            let mut roots = RootCertStore::empty();
            let (added, _) = roots.add_parsable_certificates(&certs);
            if added == 0 {
                return Err(eyre!("No usable certificates found in govee.ca_cert"));
            }

            let tls_config = ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots)
                .with_no_client_auth();

            HttpsConnectorBuilder::new().with_tls_config(tls_config)
        }
        None => HttpsConnectorBuilder::new().with_native_roots(),
    };

    let https = builder.https_or_http().enable_http1().build();

    // Build the hyper client
    let client = hyper::Client::builder().build(https);

    Ok(client)
}

/// Client trusting no certificates at all, for talking plain HTTP to mock servers.
#[cfg(test)]
pub fn mk_test_client() -> HyperHttpsClient {
    let tls_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();

    let https = HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .build();

    hyper::Client::builder().build(https)
}

/// Performs one request/response exchange with the remote service and
/// classifies the outcome: 429 is a rate limit, any other non-2xx a client
/// error, and anything that prevents reading a response (including the
/// timeout) a transport error.
async fn mk_request(
    client: &HyperHttpsClient,
    settings: &GoveeSettings,
    method: Method,
    uri: &Uri,
    body: Option<String>,
) -> Result<Bytes, GatewayError> {
    debug!("{} {}", method, uri);

    let request = Request::builder()
        .method(method)
        .header(API_KEY_HEADER, &settings.api_key)
        .header(CONTENT_TYPE, "application/json")
        .uri(uri)
        .body(body.map(hyper::Body::from).unwrap_or_else(hyper::Body::empty))?;

    let exchange = async {
        let response = client.request(request).await?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body_bytes = hyper::body::to_bytes(response.into_body()).await?;

        Ok::<_, GatewayError>((status, retry_after, body_bytes))
    };

    let timeout = Duration::from_secs(settings.request_timeout_seconds);
    let (status, retry_after, body_bytes) = tokio::time::timeout(timeout, exchange).await??;

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(GatewayError::RateLimited { retry_after });
    }

    if !status.is_success() {
        return Err(GatewayError::Client {
            status: status.as_u16(),
            message: String::from_utf8_lossy(&body_bytes).into_owned(),
        });
    }

    Ok(body_bytes)
}

fn deserialize_body<T: for<'a> Deserialize<'a>>(body_bytes: &[u8]) -> Result<T, GatewayError> {
    let de = &mut serde_json::Deserializer::from_slice(body_bytes);
    let response: T = serde_path_to_error::deserialize(de)?;

    Ok(response)
}

pub async fn mk_get_request<T: for<'a> Deserialize<'a>>(
    client: &HyperHttpsClient,
    settings: &GoveeSettings,
    uri: &Uri,
) -> Result<T, GatewayError> {
    let body_bytes = mk_request(client, settings, Method::GET, uri, None).await?;

    deserialize_body(&body_bytes)
}

/// Sends an already serialized JSON body with the given method (PUT for the
/// legacy API, POST for the capability API).
pub async fn mk_json_request<ResponseBody>(
    client: &HyperHttpsClient,
    settings: &GoveeSettings,
    method: Method,
    uri: &Uri,
    body: String,
) -> Result<ResponseBody, GatewayError>
where
    ResponseBody: for<'a> Deserialize<'a>,
{
    let body_bytes = mk_request(client, settings, method, uri, Some(body)).await?;

    deserialize_body(&body_bytes)
}

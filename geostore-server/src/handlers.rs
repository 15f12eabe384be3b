//! HTTP request handlers for the geostore server

use bytes::Bytes;
use chrono::{DateTime, Utc};
use geostore_core::*;
use geostore_engine::{BucketOptions, Storage};
use http_body_util::BodyExt;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, error, info};

use crate::server::{json_response, BoxBody};

/// Resource addressed by a request path
#[derive(Debug, PartialEq)]
enum Route {
    Health,
    Bucket(BucketName),
    Feature(Key),
    History(Key),
}

type Query = HashMap<String, String>;

/// Error carried to the client as `{"error": ...}`
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<GeoStoreError> for ApiError {
    fn from(err: GeoStoreError) -> Self {
        ApiError {
            status: status_for(&err),
            message: err.to_string(),
        }
    }
}

type ApiResult = std::result::Result<Response<BoxBody>, ApiError>;

/// HTTP status for a storage error
pub fn status_for(err: &GeoStoreError) -> StatusCode {
    match err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        e if e.is_conflict() => StatusCode::CONFLICT,
        e if e.is_invalid_input() => StatusCode::BAD_REQUEST,
        GeoStoreError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
        GeoStoreError::StorageClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Main request handler
pub async fn handle_request(
    req: Request<hyper::body::Incoming>,
    storage: Storage,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let method = parts.method;
    let path = parts.uri.path().to_string();
    let query = parse_query(parts.uri.query());
    let body = body.collect().await?.to_bytes();

    debug!("Handling {} {}", method, path);

    let result = match parse_route(&path) {
        Ok(Some(route)) => dispatch(&method, route, query, body, storage).await,
        Ok(None) => Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: "Not found".to_string(),
        }),
        Err(err) => Err(err.into()),
    };

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            if err.status.is_server_error() {
                error!("Handler error for {} {}: {}", method, path, err.message);
            }
            json_response(err.status, &json!({ "error": err.message }))
        }
    };

    info!("{} {} -> {}", method, path, response.status());
    Ok(response)
}

async fn dispatch(
    method: &Method,
    route: Route,
    query: Query,
    body: Bytes,
    storage: Storage,
) -> ApiResult {
    match (method, route) {
        (&Method::GET, Route::Health) => handle_health(),

        (&Method::PUT, Route::Bucket(bucket)) => {
            handle_create_bucket(storage, bucket, &query).await
        }
        (&Method::GET, Route::Bucket(bucket)) => handle_bucket_info(storage, bucket, &query).await,
        (&Method::DELETE, Route::Bucket(bucket)) => handle_delete_bucket(storage, bucket).await,
        (&Method::POST, Route::Bucket(bucket)) => {
            let key = Key::in_bucket(bucket, None)?;
            handle_put_feature(storage, key, &query, body, StatusCode::CREATED).await
        }

        (&Method::PUT, Route::Feature(key)) => {
            handle_put_feature(storage, key, &query, body, StatusCode::OK).await
        }
        (&Method::GET, Route::Feature(key)) => handle_get_feature(storage, key, &query).await,
        (&Method::DELETE, Route::Feature(key)) => handle_delete_feature(storage, key, &query).await,

        (&Method::GET, Route::History(key)) => handle_history(storage, key).await,

        _ => Err(ApiError {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: format!("{} not allowed here", method),
        }),
    }
}

/// Run a storage call off the async workers
async fn blocking<T, F>(f: F) -> std::result::Result<T, ApiError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(err) => Err(GeoStoreError::internal(format!("storage task failed: {}", err)).into()),
    }
}

/// Health check handler
fn handle_health() -> ApiResult {
    Ok(json_response(
        StatusCode::OK,
        &json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "service": "geostore"
        }),
    ))
}

async fn handle_create_bucket(storage: Storage, bucket: BucketName, query: &Query) -> ApiResult {
    let mut options = BucketOptions::default();
    if let Some(srid) = number_param(query, "srid")? {
        options = options.with_srid(srid);
    }
    if let Some(cap) = number_param(query, "revision_cap")? {
        options = options.with_revision_cap(cap);
    }
    let overwrite = flag_param(query, "overwrite")?;

    let info =
        blocking(move || Ok(storage.create_bucket(&bucket, overwrite, options)?.info())).await?;
    Ok(json_response(StatusCode::CREATED, &json!(info)))
}

async fn handle_bucket_info(storage: Storage, bucket: BucketName, query: &Query) -> ApiResult {
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let limit = number_param::<usize>(query, "limit")?;

    let (info, names) = blocking(move || {
        let bucket = storage.get_bucket(&bucket)?;
        Ok((bucket.info(), bucket.names(&prefix, limit)?))
    })
    .await?;

    Ok(json_response(
        StatusCode::OK,
        &json!({ "bucket": info, "names": names }),
    ))
}

async fn handle_delete_bucket(storage: Storage, bucket: BucketName) -> ApiResult {
    let name = bucket.to_string();
    let deleted = blocking(move || storage.delete_bucket(&bucket)).await?;
    Ok(json_response(
        StatusCode::OK,
        &json!({ "bucket": name, "deleted": deleted }),
    ))
}

async fn handle_put_feature(
    storage: Storage,
    key: Key,
    query: &Query,
    body: Bytes,
    status: StatusCode,
) -> ApiResult {
    let parent = revision_param(query, "parent")?;
    let srid = number_param::<i32>(query, "srid")?;
    let document = String::from_utf8(body.to_vec())
        .map_err(|_| ApiError::bad_request("request body is not UTF-8"))?;

    debug!("Putting feature: key={}, size={}", key, document.len());

    let response = blocking(move || {
        let entry = storage.entry(&key)?;
        let srid = srid.unwrap_or(entry.bucket().info().srid);
        let feature = Feature::from_geojson(key.clone(), &document, Some(srid))?;
        entry.put_feature(&key, &feature, parent.as_ref())
    })
    .await?;

    Ok(json_response(status, &json!(response)))
}

async fn handle_get_feature(storage: Storage, key: Key, query: &Query) -> ApiResult {
    let revision = revision_param(query, "revision")?;
    let at = time_param(query, "at")?;
    if revision.is_some() && at.is_some() {
        return Err(ApiError::bad_request("use either revision or at, not both"));
    }

    let (commit, feature) = blocking(move || {
        let entry = storage.entry(&key)?;
        match at {
            Some(instant) => entry.get_feature_at(&key, &instant),
            None => entry.get_feature(&key, revision.as_ref()),
        }
    })
    .await?;

    Ok(json_response(
        StatusCode::OK,
        &json!({ "commit": commit, "feature": feature.to_geojson()? }),
    ))
}

async fn handle_delete_feature(storage: Storage, key: Key, query: &Query) -> ApiResult {
    let parent = revision_param(query, "parent")?;
    let response = blocking(move || storage.delete_feature(&key, parent.as_ref())).await?;
    Ok(json_response(StatusCode::OK, &json!(response)))
}

async fn handle_history(storage: Storage, key: Key) -> ApiResult {
    let name = key.to_string();
    let revisions = blocking(move || storage.entry(&key)?.history(&key)).await?;
    Ok(json_response(
        StatusCode::OK,
        &json!({ "key": name, "revisions": revisions }),
    ))
}

/// Parse paths like "/v1/{bucket}", "/v1/{bucket}/{name}" and
/// "/v1/{bucket}/{name}/history". Unknown shapes give `None`.
fn parse_route(path: &str) -> Result<Option<Route>> {
    if path == "/health" {
        return Ok(Some(Route::Health));
    }

    let rest = match path.strip_prefix("/v1/") {
        Some(rest) => rest.trim_end_matches('/'),
        None => return Ok(None),
    };
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Ok(None);
    }

    let route = match parts.as_slice() {
        [bucket] => Route::Bucket(BucketName::new(bucket)?),
        [bucket, name] => Route::Feature(Key::new(bucket, Some(name))?),
        [bucket, name, "history"] => Route::History(Key::new(bucket, Some(name))?),
        _ => return Ok(None),
    };
    Ok(Some(route))
}

fn parse_query(query: Option<&str>) -> Query {
    form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .into_owned()
        .collect()
}

fn revision_param(query: &Query, name: &str) -> std::result::Result<Option<Revision>, ApiError> {
    match query.get(name) {
        Some(value) => Ok(Some(Revision::new(value)?)),
        None => Ok(None),
    }
}

fn number_param<T: FromStr>(query: &Query, name: &str) -> std::result::Result<Option<T>, ApiError> {
    match query.get(name) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("invalid {} '{}'", name, value))),
        None => Ok(None),
    }
}

fn flag_param(query: &Query, name: &str) -> std::result::Result<bool, ApiError> {
    match query.get(name).map(String::as_str) {
        None | Some("false") | Some("0") => Ok(false),
        Some("") | Some("true") | Some("1") => Ok(true),
        Some(other) => Err(ApiError::bad_request(format!("invalid {} '{}'", name, other))),
    }
}

fn time_param(query: &Query, name: &str) -> std::result::Result<Option<DateTime<Utc>>, ApiError> {
    match query.get(name) {
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| ApiError::bad_request(format!("invalid {} '{}': {}", name, value, e))),
        None => Ok(None),
    }
}

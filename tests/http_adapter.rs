use assert_matches::assert_matches;
use axum::extract::{Multipart, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

use trip_sync::{
    ApiError, HttpRemoteApi, ImageUpload, RemoteApi, StaticCredentials, TripDraft, TripId,
    TripPatch,
};

const TOKEN: &str = "t0k3n";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid token" })),
    )
        .into_response()
}

async fn list(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!([
        {
            "id": "1",
            "title": "Rome",
            "destination": "Italy",
            "startDate": "2025-05-01",
            "endDate": "2025-05-07",
            "description": "",
            "userId": "u-9"
        },
        { "id": "2", "title": "Kyoto", "destination": "Japan" }
    ]))
    .into_response()
}

async fn create(headers: HeaderMap, Json(mut body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if body["title"] == "reject me" {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "title is not allowed" })),
        )
            .into_response();
    }
    body["id"] = json!("101");
    (StatusCode::CREATED, Json(body)).into_response()
}

async fn update(headers: HeaderMap, Path(id): Path<String>, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if id == "missing" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "trip not found" })),
        )
            .into_response();
    }
    let mut trip = json!({ "id": id, "title": "Rome", "destination": "Italy" });
    if let (Some(trip), Some(patch)) = (trip.as_object_mut(), body.as_object()) {
        for (key, value) in patch {
            trip.insert(key.clone(), value.clone());
        }
    }
    Json(trip).into_response()
}

async fn delete(headers: HeaderMap, Path(id): Path<String>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if id == "broken" {
        return (StatusCode::INTERNAL_SERVER_ERROR, "oops").into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn upload(headers: HeaderMap, mut multipart: Multipart) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let size = field.bytes().await.map(|b| b.len()).unwrap_or(0);
        return Json(json!({
            "url": format!("https://cdn.test/{content_type}/{size}/{name}")
        }))
        .into_response();
    }
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "missing file" })),
    )
        .into_response()
}

async fn serve() -> String {
    let app = Router::new()
        .route("/trips", get(list).post(create))
        .route("/trips/{id}", put(update).delete(delete))
        .route("/uploads", post(upload));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(base: &str) -> HttpRemoteApi {
    HttpRemoteApi::new(base, Arc::new(StaticCredentials::new(TOKEN))).unwrap()
}

#[tokio::test]
async fn lists_trips_and_keeps_unknown_fields() {
    let api = client(&serve().await);

    let trips = api.list_trips().await.unwrap();
    assert_eq!(trips.len(), 2);
    assert_eq!(trips[0].start_date, "2025-05-01");
    assert_eq!(trips[0].extra["userId"], "u-9");
    assert_eq!(trips[1].description, "");
}

#[tokio::test]
async fn get_trip_is_derived_from_list() {
    let api = client(&serve().await);

    let trip = api.get_trip(&TripId::new("2")).await.unwrap().unwrap();
    assert_eq!(trip.title, "Kyoto");
    assert!(api.get_trip(&TripId::new("404")).await.unwrap().is_none());
}

#[tokio::test]
async fn creates_and_updates() {
    let api = client(&serve().await);

    let created = api
        .create_trip(&TripDraft::new("Lisbon", "Portugal"))
        .await
        .unwrap();
    assert_eq!(created.id, TripId::new("101"));
    assert_eq!(created.destination, "Portugal");

    let updated = api
        .update_trip(&TripId::new("7"), &TripPatch::title("Rome Trip"))
        .await
        .unwrap();
    assert_eq!(updated.id, TripId::new("7"));
    assert_eq!(updated.title, "Rome Trip");
    assert_eq!(updated.destination, "Italy");
}

#[tokio::test]
async fn server_message_is_carried_verbatim() {
    let api = client(&serve().await);

    let err = api
        .create_trip(&TripDraft::new("reject me", "Nowhere"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ApiError::ServerRejected {
            status: 422,
            message: "title is not allowed".into()
        }
    );

    let err = api
        .update_trip(&TripId::new("missing"), &TripPatch::title("x"))
        .await
        .unwrap_err();
    assert_matches!(err, ApiError::ServerRejected { status: 404, ref message } if message == "trip not found");
}

#[tokio::test]
async fn missing_error_body_uses_operation_default() {
    let api = client(&serve().await);

    let err = api.delete_trip(&TripId::new("broken")).await.unwrap_err();
    assert_eq!(
        err,
        ApiError::ServerRejected {
            status: 500,
            message: "failed to delete trip".into()
        }
    );
    api.delete_trip(&TripId::new("3")).await.unwrap();
}

#[tokio::test]
async fn rejected_or_missing_credential_is_auth_required() {
    let base = serve().await;

    let wrong = HttpRemoteApi::new(&base, Arc::new(StaticCredentials::new("nope"))).unwrap();
    assert_eq!(wrong.list_trips().await.unwrap_err(), ApiError::AuthRequired);

    let none = HttpRemoteApi::new(&base, Arc::new(StaticCredentials::none())).unwrap();
    assert_eq!(
        none.create_trip(&TripDraft::new("Rome", "Italy"))
            .await
            .unwrap_err(),
        ApiError::AuthRequired
    );
}

#[tokio::test]
async fn uploads_multipart_file_with_bearer() {
    let api = client(&serve().await);

    let url = api
        .upload_image(ImageUpload::from_uri(
            "file:///data/cache/IMG_0042.png",
            vec![0u8; 16],
        ))
        .await
        .unwrap();
    assert_eq!(url, "https://cdn.test/image/png/16/IMG_0042.png");

    let url = api
        .upload_image(ImageUpload::from_uri("content://media/external/99", vec![1u8; 4]))
        .await
        .unwrap();
    assert_eq!(url, "https://cdn.test/image/jpeg/4/99");
}

#[tokio::test]
async fn closed_port_is_network_unreachable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let api = client(&format!("http://127.0.0.1:{port}"));
    let err = api.list_trips().await.unwrap_err();
    assert!(err.is_network(), "unexpected error {err:?}");
}

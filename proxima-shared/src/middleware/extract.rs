//! Extractors whose rejections are rendered as `AppError` bodies instead of
//! axum's plain-text defaults.

use axum::extract::{FromRequest, FromRequestParts};

use crate::errors::AppError;

#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(AppError))]
pub struct ApiPath<T>(pub T);

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use serde::Deserialize;

    use crate::errors::ErrorCode;

    #[derive(Debug, Deserialize)]
    struct Point {
        #[allow(dead_code)]
        latitude: f64,
    }

    #[tokio::test]
    async fn missing_json_field_is_a_validation_error() {
        let request = Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let err = ApiJson::<Point>::from_request(request, &()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert!(err.public_message().contains("latitude"));
    }

    #[tokio::test]
    async fn malformed_query_is_a_validation_error() {
        let request = Request::builder().uri("/?latitude=north").body(()).unwrap();
        let (mut parts, _) = request.into_parts();
        let err = ApiQuery::<Point>::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }
}

use axum::{
    body::Body,
    http::Request,
    response::{IntoResponse, Response},
};

use crate::error::{Error, ErrorDetails};

pub async fn handle_404(req: Request<Body>) -> Response {
    let path = req.uri().path().to_string();
    let method = req.method().to_string();

    Error::new(ErrorDetails::RouteNotFound { path, method }).into_response()
}

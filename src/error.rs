// src/error.rs
use crate::lookup::LookupError;
use log::{error, warn};
use rust_decimal::Decimal;
use serde::Serialize;
use std::convert::Infallible;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;
use warp::{Rejection, Reply};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    NotFound(String),

    #[error("insufficient funds: purchase costs {needed}, cash is {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("insufficient shares: requested {requested}, holding {held}")]
    InsufficientShares { requested: i64, held: i64 },

    #[error("price lookup failed: {0}")]
    Lookup(#[from] LookupError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        AppError::Auth(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_)
            | AppError::NotFound(_)
            | AppError::InsufficientFunds { .. }
            | AppError::InsufficientShares { .. }
            | AppError::Lookup(_) => StatusCode::BAD_REQUEST,
            AppError::Auth(_) => StatusCode::FORBIDDEN,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the client. Lookup failures read as an unknown
    /// symbol and server-side failures never expose their cause.
    pub fn public_message(&self) -> String {
        match self {
            AppError::InsufficientFunds { .. } => "insufficient funds for purchase".to_string(),
            AppError::InsufficientShares { .. } => "insufficient shares to sell".to_string(),
            AppError::Lookup(_) => "invalid symbol".to_string(),
            AppError::Database(_) | AppError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl Reject for AppError {}

pub fn reject(err: AppError) -> Rejection {
    warp::reject::custom(err)
}

#[derive(Debug, Serialize)]
pub struct Apology {
    pub code: u16,
    pub message: String,
}

/// Renders every rejection as an apology body with a matching status.
pub async fn recover(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(app) = err.find::<AppError>() {
        if app.status().is_server_error() {
            error!("Request failed: {}", app);
        } else {
            warn!("Request rejected: {}", app);
        }
        (app.status(), app.public_message())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported media type".to_string(),
        )
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::LENGTH_REQUIRED, "length required".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "payload too large".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed".to_string(),
        )
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal server error".to_string(),
        )
    };

    let body = Apology {
        code: status.as_u16(),
        message,
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

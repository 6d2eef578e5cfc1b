use crate::import::ImportError;
use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::{Request, Response};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::{RefOr, Response as OpenApiResponse, Responses};
use rocket_okapi::response::OpenApiResponderInner;
use serde::Serialize;
use std::io::Cursor;

#[derive(Debug)]
pub enum ApiError {
    DatabaseError(sqlx::Error),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    InternalError(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let (status, error_type, message) = match self {
            ApiError::DatabaseError(e) => {
                log::error!("database error: {}", e);
                (
                    Status::InternalServerError,
                    "DatabaseError",
                    "A database error occurred".to_string(),
                )
            }
            ApiError::NotFound(msg) => {
                log::debug!("not found: {}", msg);
                (Status::NotFound, "NotFound", msg)
            }
            ApiError::BadRequest(msg) => {
                log::debug!("bad request: {}", msg);
                (Status::BadRequest, "BadRequest", msg)
            }
            ApiError::Conflict(msg) => {
                log::debug!("conflict: {}", msg);
                (Status::Conflict, "Conflict", msg)
            }
            ApiError::InternalError(msg) => {
                log::error!("internal error: {}", msg);
                (Status::InternalServerError, "InternalError", msg)
            }
        };

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message,
        };

        let json = serde_json::to_string(&error_response).unwrap_or_else(|_| {
            r#"{"error":"SerializationError","message":"Failed to serialize error"}"#.to_string()
        });

        Response::build()
            .status(status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(json.len(), Cursor::new(json))
            .ok()
    }
}

impl OpenApiResponderInner for ApiError {
    fn responses(_generator: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        let mut responses = Responses::default();
        for (code, description) in [
            ("400", "The request was malformed."),
            ("404", "The import job or resource does not exist."),
            ("409", "An import with the same progress id is already running."),
            ("500", "The import failed or the server hit an internal error."),
        ] {
            responses.responses.insert(
                code.to_string(),
                RefOr::Object(OpenApiResponse {
                    description: description.to_string(),
                    ..Default::default()
                }),
            );
        }
        Ok(responses)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            _ => ApiError::DatabaseError(err),
        }
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::AlreadyRunning(_) => ApiError::Conflict(err.to_string()),
            ImportError::Read(_) => ApiError::BadRequest(err.to_string()),
            ImportError::InvalidTable(_) | ImportError::Cancelled => {
                ApiError::InternalError(err.to_string())
            }
            ImportError::KnownCustomers(_) => {
                ApiError::InternalError("Import failed: could not load existing customers".to_string())
            }
            ImportError::Panicked(_) => {
                ApiError::InternalError("Import failed: unexpected internal error".to_string())
            }
        }
    }
}

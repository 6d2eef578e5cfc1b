use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Data, Request, Response};
use std::time::Instant;

/// Logs one line per HTTP request with its status and duration.
///
/// POST requests also log their content type. Bodies are never logged.
pub struct RequestLogger;

struct RequestStart(Instant);

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        request.local_cache(|| RequestStart(Instant::now()));
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let RequestStart(started) = request.local_cache(|| RequestStart(Instant::now()));
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let status = response.status();

        match request.content_type().filter(|_| request.method() == rocket::http::Method::Post) {
            Some(content_type) => log::info!(
                "{} {} [{}] -> {} ({:.2}ms)",
                request.method(),
                request.uri(),
                content_type,
                status.code,
                elapsed_ms
            ),
            None => log::info!(
                "{} {} -> {} ({:.2}ms)",
                request.method(),
                request.uri(),
                status.code,
                elapsed_ms
            ),
        }

        if status.code >= 500 {
            log::warn!("{} {} failed with {}", request.method(), request.uri(), status);
        }
    }
}

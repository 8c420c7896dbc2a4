//! HTTP route handlers for the lending API.
//!
//! Handlers are thin: parse ids and bodies, hand the call to the engine on
//! the blocking pool, and map [`LendingError`] onto a status code with a
//! `{"error": {"kind", "message"}}` body.

use std::str::FromStr;

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::warn;

use lending::core::types::{
    Author, AuthorSummary, AuthorUpdate, Book, BookUpdate, Borrower, BorrowerUpdate, CopyDrift,
    EntityId, LoanReceipt, NewAuthor, NewBook, NewBorrower,
};
use lending::error::{ErrorKind, LendingError};

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/books", post(create_book).get(list_books))
        .route(
            "/books/{id}",
            get(get_book).put(update_book).delete(delete_book),
        )
        .route("/authors", post(create_author).get(list_authors))
        .route("/authors/exceeding-limit", get(authors_exceeding_limit))
        .route(
            "/authors/{id}",
            get(get_author).put(update_author).delete(delete_author),
        )
        .route("/borrowers", post(create_borrower).get(list_borrowers))
        .route(
            "/borrowers/{id}",
            get(get_borrower)
                .put(update_borrower)
                .delete(delete_borrower),
        )
        .route("/borrow/{borrower_id}/{book_id}", post(borrow))
        .route("/return/{borrower_id}/{book_id}", post(return_book))
        .route(
            "/diagnostics/inconsistent-books",
            get(inconsistent_books),
        )
}

/// Failure returned by any handler.
#[derive(Debug)]
pub enum ApiError {
    /// Engine refused or failed the operation.
    Lending(LendingError),
    /// Malformed path id or request body.
    BadRequest(String),
}

impl From<LendingError> for ApiError {
    fn from(err: LendingError) -> Self {
        ApiError::Lending(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    message: String,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::CapacityExceeded
        | ErrorKind::AuthorLimitExceeded
        | ErrorKind::NoCopiesAvailable
        | ErrorKind::OverdueBlock
        | ErrorKind::NotBorrowed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ConflictError => StatusCode::CONFLICT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self {
            ApiError::Lending(err) => ErrorBody {
                kind: err.kind(),
                message: err.to_string(),
            },
            ApiError::BadRequest(message) => ErrorBody {
                kind: ErrorKind::ValidationError,
                message,
            },
        };
        let status = status_for(body.kind);
        if status.is_server_error() {
            warn!(kind = ?body.kind, message = %body.message, "request failed");
        }
        (status, Json(json!({ "error": body }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_id(raw: &str) -> ApiResult<EntityId> {
    EntityId::from_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid id: {}", raw)))
}

fn body<T: DeserializeOwned>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    Ok(payload?.0)
}

async fn health() -> &'static str {
    "ok"
}

// ---- books ----

async fn create_book(
    State(state): State<AppState>,
    payload: Result<Json<NewBook>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Book>)> {
    let fields = body(payload)?;
    let book = state.run(move |engine| engine.create_book(fields)).await?;
    Ok((StatusCode::CREATED, Json(book)))
}

async fn list_books(State(state): State<AppState>) -> ApiResult<Json<Vec<Book>>> {
    Ok(Json(state.run(|engine| engine.list_books()).await?))
}

async fn get_book(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Book>> {
    let id = parse_id(&id)?;
    Ok(Json(state.run(move |engine| engine.get_book(id)).await?))
}

async fn update_book(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<BookUpdate>, JsonRejection>,
) -> ApiResult<Json<Book>> {
    let id = parse_id(&id)?;
    let update = body(payload)?;
    Ok(Json(
        state.run(move |engine| engine.update_book(id, update)).await?,
    ))
}

async fn delete_book(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Book>> {
    let id = parse_id(&id)?;
    Ok(Json(state.run(move |engine| engine.delete_book(id)).await?))
}

// ---- authors ----

async fn create_author(
    State(state): State<AppState>,
    payload: Result<Json<NewAuthor>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Author>)> {
    let fields = body(payload)?;
    let author = state.run(move |engine| engine.create_author(fields)).await?;
    Ok((StatusCode::CREATED, Json(author)))
}

async fn list_authors(State(state): State<AppState>) -> ApiResult<Json<Vec<AuthorSummary>>> {
    Ok(Json(state.run(|engine| engine.list_authors()).await?))
}

/// GET /authors/exceeding-limit - authors linked to more than five books.
async fn authors_exceeding_limit(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<AuthorSummary>>> {
    Ok(Json(
        state.run(|engine| engine.authors_exceeding_limit()).await?,
    ))
}

async fn get_author(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Author>> {
    let id = parse_id(&id)?;
    Ok(Json(state.run(move |engine| engine.get_author(id)).await?))
}

async fn update_author(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<AuthorUpdate>, JsonRejection>,
) -> ApiResult<Json<Author>> {
    let id = parse_id(&id)?;
    let update = body(payload)?;
    Ok(Json(
        state
            .run(move |engine| engine.update_author(id, update))
            .await?,
    ))
}

async fn delete_author(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Author>> {
    let id = parse_id(&id)?;
    Ok(Json(state.run(move |engine| engine.delete_author(id)).await?))
}

// ---- borrowers ----

async fn create_borrower(
    State(state): State<AppState>,
    payload: Result<Json<NewBorrower>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Borrower>)> {
    let fields = body(payload)?;
    let borrower = state
        .run(move |engine| engine.create_borrower(fields))
        .await?;
    Ok((StatusCode::CREATED, Json(borrower)))
}

async fn list_borrowers(State(state): State<AppState>) -> ApiResult<Json<Vec<Borrower>>> {
    Ok(Json(state.run(|engine| engine.list_borrowers()).await?))
}

async fn get_borrower(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Borrower>> {
    let id = parse_id(&id)?;
    Ok(Json(state.run(move |engine| engine.get_borrower(id)).await?))
}

async fn update_borrower(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<BorrowerUpdate>, JsonRejection>,
) -> ApiResult<Json<Borrower>> {
    let id = parse_id(&id)?;
    let update = body(payload)?;
    Ok(Json(
        state
            .run(move |engine| engine.update_borrower(id, update))
            .await?,
    ))
}

async fn delete_borrower(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Borrower>> {
    let id = parse_id(&id)?;
    Ok(Json(
        state.run(move |engine| engine.delete_borrower(id)).await?,
    ))
}

// ---- loans ----

/// POST /borrow/:borrower/:book - lend one copy.
async fn borrow(
    State(state): State<AppState>,
    Path((borrower_id, book_id)): Path<(String, String)>,
) -> ApiResult<Json<LoanReceipt>> {
    let borrower = parse_id(&borrower_id)?;
    let book = parse_id(&book_id)?;
    Ok(Json(
        state.run(move |engine| engine.borrow(borrower, book)).await?,
    ))
}

/// POST /return/:borrower/:book - take one copy back.
async fn return_book(
    State(state): State<AppState>,
    Path((borrower_id, book_id)): Path<(String, String)>,
) -> ApiResult<Json<LoanReceipt>> {
    let borrower = parse_id(&borrower_id)?;
    let book = parse_id(&book_id)?;
    Ok(Json(
        state
            .run(move |engine| engine.return_book(borrower, book))
            .await?,
    ))
}

/// GET /diagnostics/inconsistent-books - copy accounting drift.
async fn inconsistent_books(State(state): State<AppState>) -> ApiResult<Json<Vec<CopyDrift>>> {
    Ok(Json(state.run(|engine| engine.inconsistent_books()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    use lending::core::types::MembershipType;
    use lending::test_support::{engine, new_author, new_book, new_borrower};

    fn app() -> (Router, lending::engine::LendingEngine<lending::io::store::MemoryStore>) {
        let engine = engine();
        let router = api_router().with_state(AppState::new(engine.clone()));
        (router, engine)
    }

    async fn send(app: &Router, method: Method, uri: &str, payload: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match payload {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_and_fetch_book() {
        let (app, engine) = app();
        let writer = engine.create_author(new_author("ada")).expect("author");

        let (status, created) = send(
            &app,
            Method::POST,
            "/books",
            Some(json!({
                "title": "Dune",
                "author": writer.id,
                "isbn": "978-0441013593",
                "available_copies": 2
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["total_copies"], 2);

        let id = created["id"].as_str().expect("id");
        let (status, fetched) = send(&app, Method::GET, &format!("/books/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["title"], "Dune");
    }

    #[tokio::test]
    async fn missing_book_is_404_with_error_body() {
        let (app, _) = app();
        let (status, body) = send(
            &app,
            Method::GET,
            &format!("/books/{}", EntityId::new()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");
    }

    #[tokio::test]
    async fn malformed_id_and_body_are_400() {
        let (app, _) = app();
        let (status, body) = send(&app, Method::GET, "/borrowers/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "validation_error");

        let (status, _) = send(&app, Method::POST, "/authors", Some(json!({ "name": 3 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_email_is_400() {
        let (app, _) = app();
        let (status, body) = send(
            &app,
            Method::POST,
            "/authors",
            Some(json!({
                "name": "ada",
                "email": "not-an-email",
                "phone_number": "+14155552671"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "validation_error");
    }

    #[tokio::test]
    async fn borrow_and_return_over_http() {
        let (app, engine) = app();
        let writer = engine.create_author(new_author("ada")).expect("author");
        let title = engine
            .create_book(new_book("dune", writer.id, 1))
            .expect("book");
        let x = engine
            .create_borrower(new_borrower("x", MembershipType::Standard))
            .expect("x");
        let y = engine
            .create_borrower(new_borrower("y", MembershipType::Standard))
            .expect("y");

        let (status, receipt) = send(
            &app,
            Method::POST,
            &format!("/borrow/{}/{}", x.id, title.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(receipt["book"]["available_copies"], 0);

        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/borrow/{}/{}", y.id, title.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["kind"], "no_copies_available");

        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/return/{}/{}", y.id, title.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["kind"], "not_borrowed");

        let (status, receipt) = send(
            &app,
            Method::POST,
            &format!("/return/{}/{}", x.id, title.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(receipt["book"]["available_copies"], 1);
    }

    #[tokio::test]
    async fn sixth_book_for_author_is_422() {
        let (app, engine) = app();
        let writer = engine.create_author(new_author("ada")).expect("author");
        for i in 0..5 {
            engine
                .create_book(new_book(&format!("b{}", i), writer.id, 1))
                .expect("book");
        }
        let (status, body) = send(
            &app,
            Method::POST,
            "/books",
            Some(json!({
                "title": "b5",
                "author": writer.id,
                "isbn": "isbn-b5",
                "available_copies": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["kind"], "author_limit_exceeded");

        let (status, report) = send(&app, Method::GET, "/authors/exceeding-limit", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report, json!([]));
    }

    #[tokio::test]
    async fn delete_returns_removed_borrower() {
        let (app, engine) = app();
        let reader = engine
            .create_borrower(new_borrower("x", MembershipType::Premium))
            .expect("borrower");
        let uri = format!("/borrowers/{}", reader.id);

        let (status, body) = send(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["membership_type"], "Premium");

        let (status, _) = send(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn diagnostics_are_empty_for_engine_written_data() {
        let (app, engine) = app();
        let writer = engine.create_author(new_author("ada")).expect("author");
        let title = engine
            .create_book(new_book("dune", writer.id, 2))
            .expect("book");
        let reader = engine
            .create_borrower(new_borrower("x", MembershipType::Standard))
            .expect("borrower");
        engine.borrow(reader.id, title.id).expect("borrow");

        let (status, body) = send(&app, Method::GET, "/diagnostics/inconsistent-books", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[test]
    fn status_mapping_covers_every_kind() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::ValidationError), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(ErrorKind::OverdueBlock),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(ErrorKind::ConflictError), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorKind::Unavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}

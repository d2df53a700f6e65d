//! Message handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};

use super::{parse_id, AppState};
use crate::hub::HubEvent;
use crate::mail::{sanitize_markup, Message, MessageRepository};
use crate::web::dto::{
    ApiResponse, ClearedResponse, DeletedResponse, ListQuery, MarkReadRequest,
    MessageListResponse, ReadResponse, SearchQuery,
};
use crate::web::error::ApiError;

const HTML_CSP: &str = "default-src 'none'; style-src 'unsafe-inline'; img-src data:";

/// List messages, newest first.
///
/// GET /api/emails
pub async fn list_emails(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<MessageListResponse>>, ApiError> {
    let page = query.page.page()?;
    let filter = query.filter()?;

    let result = MessageRepository::new(&state.db).list(&filter, page).await?;

    Ok(Json(ApiResponse::new(MessageListResponse::new(result, page))))
}

/// Search messages.
///
/// GET /api/emails/search?q=
pub async fn search_emails(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<ApiResponse<MessageListResponse>>, ApiError> {
    let text = query.q.as_deref().map(str::trim).unwrap_or_default();
    if text.is_empty() {
        return Err(ApiError::invalid_request("search query is required"));
    }
    let page = query.page.page()?;

    let result = MessageRepository::new(&state.db).search(text, page).await?;

    Ok(Json(ApiResponse::new(MessageListResponse::new(result, page))))
}

/// Get one message.
///
/// GET /api/emails/:id
pub async fn get_email(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Message>>, ApiError> {
    let id = parse_id(&id)?;
    let message = MessageRepository::new(&state.db).get(id).await?;

    Ok(Json(ApiResponse::new(message)))
}

/// Delete one message and announce it.
///
/// DELETE /api/emails/:id
pub async fn delete_email(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<DeletedResponse>>, ApiError> {
    let id = parse_id(&id)?;
    MessageRepository::new(&state.db).delete_one(id).await?;

    tracing::info!(id, "Message deleted");
    state.hub.publish(HubEvent::Removed { id });

    Ok(Json(ApiResponse::new(DeletedResponse { deleted: id })))
}

/// Delete every message and announce it.
///
/// DELETE /api/emails
pub async fn delete_all_emails(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<ClearedResponse>>, ApiError> {
    let deleted = MessageRepository::new(&state.db).delete_all().await?;

    tracing::info!(deleted, "All messages deleted");
    state.hub.publish(HubEvent::Cleared);

    Ok(Json(ApiResponse::new(ClearedResponse {
        message: "All emails deleted".to_string(),
        deleted,
    })))
}

/// Set or clear the read flag. An empty body marks the message read.
///
/// PUT /api/emails/:id/read
pub async fn mark_email_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<MarkReadRequest>>,
) -> Result<Json<ApiResponse<ReadResponse>>, ApiError> {
    let id = parse_id(&id)?;
    let read = body.map(|Json(req)| req.read).unwrap_or(true);

    MessageRepository::new(&state.db).mark_read(id, read).await?;

    Ok(Json(ApiResponse::new(ReadResponse { id, read })))
}

/// Render the header block followed by the body as plain text.
///
/// GET /api/emails/:id/raw
pub async fn get_email_raw(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let message = MessageRepository::new(&state.db).get(id).await?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        render_raw(&message),
    )
        .into_response())
}

/// Serve the sanitized HTML body under a restrictive content security policy.
///
/// GET /api/emails/:id/html
pub async fn get_email_html(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let message = MessageRepository::new(&state.db).get(id).await?;

    if message.markup_body.is_empty() {
        return Err(ApiError::not_found("no HTML body available"));
    }

    Ok((
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CONTENT_SECURITY_POLICY, HTML_CSP),
        ],
        sanitize_markup(&message.markup_body),
    )
        .into_response())
}

/// Download an attachment payload.
///
/// GET /api/emails/:id/attachments/:aid
pub async fn get_attachment(
    State(state): State<Arc<AppState>>,
    Path((id, aid)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let aid = parse_id(&aid)?;

    let attachment = MessageRepository::new(&state.db).get_attachment(aid).await?;
    if attachment.meta.message_id != id {
        return Err(ApiError::not_found("attachment not found"));
    }

    Ok((
        [
            (header::CONTENT_TYPE, attachment.meta.content_type.clone()),
            (
                header::CONTENT_DISPOSITION,
                content_disposition(&attachment.meta.filename),
            ),
            (header::CONTENT_LENGTH, attachment.payload.len().to_string()),
        ],
        attachment.payload,
    )
        .into_response())
}

fn render_raw(message: &Message) -> String {
    let mut out = String::new();
    for (name, values) in message.header_fields.iter() {
        for value in values {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
    out.push_str("\r\n");
    if message.plain_body.is_empty() {
        out.push_str(&message.markup_body);
    } else {
        out.push_str(&message.plain_body);
    }
    out
}

fn content_disposition(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

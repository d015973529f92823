//! JSON task collection handlers.
//!
//! Paginated with opaque page tokens of the form `pg<N>`.

use axum::{
    extract::{Path, Query, State},
    http::{header::ETAG, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{authorize, json_error, not_modified, precondition_holds, SharedState};

/// Query parameters for listing tasks.
#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    #[serde(rename = "max-results")]
    pub max_results: Option<usize>,
    #[serde(rename = "pageToken")]
    pub page_token: Option<String>,
}

fn page_number(token: Option<&str>) -> Option<usize> {
    match token {
        None => Some(1),
        Some(token) => token.strip_prefix("pg")?.parse().ok().filter(|n| *n >= 1),
    }
}

/// GET /tasks
pub async fn list_tasks(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    let etag = state.tasks_etag();
    if not_modified(&headers, &etag) {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let Some(page) = page_number(query.page_token.as_deref()) else {
        return json_error(StatusCode::BAD_REQUEST, "invalid", "Invalid page token");
    };
    let per_page = query.max_results.unwrap_or(state.task_page_size).max(1);
    let start = (page - 1) * per_page;
    let items: Vec<Value> = state
        .tasks
        .iter()
        .skip(start)
        .take(per_page)
        .map(|t| Value::Object(state.present_task(t)))
        .collect();

    let mut body = serde_json::json!({
        "kind": "tasks#tasks",
        "etag": etag,
        "totalItems": state.tasks.len(),
        "items": items,
    });
    if start + per_page < state.tasks.len() {
        body["nextPageToken"] = Value::from(format!("pg{}", page + 1));
    }
    (StatusCode::OK, Json(body)).into_response()
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    match state.get_task(&id) {
        Some(task) => task_response(StatusCode::OK, state.present_task(task)),
        None => json_error(StatusCode::NOT_FOUND, "notFound", &format!("No task {id}")),
    }
}

/// POST /tasks
pub async fn insert_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(task): Json<Map<String, Value>>,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    if task.contains_key("id") {
        return json_error(StatusCode::BAD_REQUEST, "invalid", "Task already has an id");
    }
    let inserted = state.insert_task(task);
    task_response(StatusCode::CREATED, state.present_task(&inserted))
}

/// PUT /tasks/{id}
pub async fn update_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(changes): Json<Map<String, Value>>,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    let Some(current) = state
        .get_task(&id)
        .map(|t| t.get("etag").and_then(Value::as_str).map(str::to_string))
    else {
        return json_error(StatusCode::NOT_FOUND, "notFound", &format!("No task {id}"));
    };
    if !precondition_holds(&headers, current.as_deref()) {
        return json_error(StatusCode::PRECONDITION_FAILED, "conditionNotMet", "Precondition Failed");
    }

    match state.update_task(&id, changes) {
        Some(updated) => task_response(StatusCode::OK, state.present_task(&updated)),
        None => json_error(StatusCode::NOT_FOUND, "notFound", &format!("No task {id}")),
    }
}

/// DELETE /tasks/{id}
pub async fn delete_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    let Some(current) = state
        .get_task(&id)
        .map(|t| t.get("etag").and_then(Value::as_str).map(str::to_string))
    else {
        return json_error(StatusCode::NOT_FOUND, "notFound", &format!("No task {id}"));
    };
    if !precondition_holds(&headers, current.as_deref()) {
        return json_error(StatusCode::PRECONDITION_FAILED, "conditionNotMet", "Precondition Failed");
    }
    state.delete_task(&id);
    StatusCode::NO_CONTENT.into_response()
}

fn task_response(status: StatusCode, task: Map<String, Value>) -> Response {
    let etag = task
        .get("etag")
        .and_then(Value::as_str)
        .and_then(|e| HeaderValue::from_str(e).ok());
    let mut response = (status, Json(Value::Object(task))).into_response();
    if let Some(etag) = etag {
        response.headers_mut().insert(ETAG, etag);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_number() {
        assert_eq!(page_number(None), Some(1));
        assert_eq!(page_number(Some("pg2")), Some(2));
        assert_eq!(page_number(Some("pg0")), None);
        assert_eq!(page_number(Some("bogus")), None);
    }
}

// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sunward_adapters::TariffSchedule;
use sunward_core::{Scheduler, TariffOracle, TaskRegistry};
use tokio::sync::Mutex;

/// Shared state of the operator API.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Mutex<Scheduler>>,
    pub registry: Arc<TaskRegistry>,
    pub tariff: Arc<TariffSchedule>,
}

#[derive(Debug, Serialize)]
pub struct TaskStatus {
    pub uri: String,
    pub desc: String,
}

#[derive(Debug, Serialize)]
pub struct TariffStatus {
    pub from_grid: f32,
    pub to_grid: f32,
    pub on_peak: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub on_pause: bool,
    pub window_records: usize,
    pub tasks: Vec<TaskStatus>,
    pub tariff: TariffStatus,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub uri: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/pause", post(pause))
        .route("/api/resume", post(resume))
        .route("/api/tasks", post(register_task))
        .route("/api/tasks/{uri}", axum::routing::delete(unregister_task))
        .with_state(state)
}

async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let scheduler = state.scheduler.lock().await;
    let mut tasks = Vec::new();
    for uri in scheduler.task_uris() {
        let desc = match state.registry.lookup(uri) {
            Some(handle) => handle.desc().await.unwrap_or_else(|_| "unreachable".to_owned()),
            None => "unresolved".to_owned(),
        };
        tasks.push(TaskStatus {
            uri: uri.clone(),
            desc,
        });
    }
    let now = Local::now();
    let rates = state.tariff.rates_at(now);
    Json(StatusResponse {
        on_pause: scheduler.is_on_pause(),
        window_records: scheduler.window().len(),
        tasks,
        tariff: TariffStatus {
            from_grid: rates.from_grid,
            to_grid: rates.to_grid,
            on_peak: state.tariff.is_on_peak(now),
        },
    })
}

async fn pause(State(state): State<ApiState>) -> StatusCode {
    state.scheduler.lock().await.pause().await;
    StatusCode::NO_CONTENT
}

async fn resume(State(state): State<ApiState>) -> StatusCode {
    state.scheduler.lock().await.resume();
    StatusCode::NO_CONTENT
}

async fn register_task(
    State(state): State<ApiState>,
    Json(request): Json<RegisterRequest>,
) -> StatusCode {
    if state.registry.lookup(&request.uri).is_none() {
        return StatusCode::NOT_FOUND;
    }
    state.scheduler.lock().await.register_task(&request.uri);
    StatusCode::CREATED
}

async fn unregister_task(State(state): State<ApiState>, Path(uri): Path<String>) -> StatusCode {
    state.scheduler.lock().await.unregister_task(&uri);
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunward_core::SchedulerSettings;
    use sunward_types::TariffConfig;

    fn state() -> ApiState {
        let registry = Arc::new(TaskRegistry::new());
        let scheduler = Scheduler::new(
            registry.clone(),
            SchedulerSettings {
                window_size: 12,
                ignore_power_threshold: 0.1,
                max_record_gap: chrono::Duration::minutes(3),
            },
        );
        ApiState {
            scheduler: Arc::new(Mutex::new(scheduler)),
            registry,
            tariff: Arc::new(TariffSchedule::new(TariffConfig::default())),
        }
    }

    #[tokio::test]
    async fn test_pause_and_resume_round_trip() {
        let state = state();
        assert_eq!(pause(State(state.clone())).await, StatusCode::NO_CONTENT);
        assert!(state.scheduler.lock().await.is_on_pause());
        assert_eq!(resume(State(state.clone())).await, StatusCode::NO_CONTENT);
        assert!(!state.scheduler.lock().await.is_on_pause());
    }

    #[tokio::test]
    async fn test_register_unknown_uri_is_rejected() {
        let state = state();
        let code = register_task(
            State(state.clone()),
            Json(RegisterRequest {
                uri: "task.ghost".to_owned(),
            }),
        )
        .await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert!(state.scheduler.lock().await.task_uris().is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_pause_flag() {
        let state = state();
        let response = status(State(state.clone())).await;
        assert!(!response.0.on_pause);
        assert_eq!(response.0.window_records, 0);
        assert!(response.0.tasks.is_empty());
    }
}

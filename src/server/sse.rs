//! Server-sent event stream of a run.
//!
//! Each bus event becomes an SSE event named after its kind, with the
//! sequence number as the event id and the full event as JSON data. When the
//! bus closes a final `end` event carries the run id.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use conductor_common::{RunEvent, RunId};
use futures::Stream;
use tokio_stream::StreamExt;

use super::api::{ApiError, SharedState, parse_run_id};
use super::end_frame;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub async fn run_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let subscription = state.registry.subscribe(run_id)?;
    tracing::debug!(%run_id, "SSE subscriber attached");

    let stream = subscription
        .into_stream()
        .map(|event| Ok::<_, Infallible>(sse_event(&event)))
        .chain(tokio_stream::once(Ok(end_event(run_id))));

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("ping")))
}

fn sse_event(event: &RunEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default()
        .event(event.kind().as_str())
        .id(event.seq.to_string())
        .data(data)
}

fn end_event(run_id: RunId) -> Event {
    Event::default()
        .event("end")
        .data(end_frame(run_id).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingsStore;
    use crate::controller::RunTiming;
    use crate::errors::StageFailure;
    use crate::plan::{Plan, StageDescriptor};
    use crate::registry::{RunRegistry, RunRequest, RuntimeSettings};
    use crate::server::api::{AppState, api_router};
    use crate::stages::Stage;
    use crate::workflow::WorkflowStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use conductor_common::{RunMode, RunStatus, StageInput, StageRecord};
    use http_body_util::BodyExt;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Offers;

    #[async_trait]
    impl Stage for Offers {
        async fn invoke(&self, _input: &StageInput) -> Result<StageRecord, StageFailure> {
            Ok(StageRecord::candidates(vec!["first".into(), "second".into()]))
        }
    }

    fn state() -> SharedState {
        let plan = Plan::new(vec![StageDescriptor::new("pick", Arc::new(Offers), true)]).unwrap();
        let registry = RunRegistry::new(
            Arc::new(plan),
            RuntimeSettings {
                timing: RunTiming {
                    poll_interval: Duration::from_millis(10),
                    stage_timeout: None,
                },
                retain_finished: Duration::from_secs(60),
            },
        );
        Arc::new(AppState {
            registry: Arc::new(registry),
            workflow: WorkflowStore::new(),
            settings: SettingsStore::new(&BTreeMap::new()),
        })
    }

    fn events_request(id: RunId) -> Request<Body> {
        Request::builder()
            .uri(format!("/api/runs/{}/events", id))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn live_tail_ends_with_end_event() {
        let state = state();
        let app = api_router().with_state(state.clone());
        let id = state.registry.create(RunRequest {
            query: "q".into(),
            mode: RunMode::Interactive,
        });
        let mut rx = state.registry.handle(id).unwrap().watch();
        rx.wait_for(|s| s.status == RunStatus::AwaitingSelection)
            .await
            .unwrap();

        let response = app.oneshot(events_request(id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        state.registry.record_selection(id, "pick", 1).unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(bytes.to_vec()).unwrap();

        let selection = body.find("event: selection").expect("selection event");
        let exit = body.find("event: exit").expect("exit event");
        let done = body.find("event: done").expect("done event");
        let end = body.find("event: end").expect("end event");
        assert!(selection < exit && exit < done && done < end);
        assert!(body.contains("\"chosen\":\"second\""));
        assert!(body.contains(&format!("\"run_id\":\"{}\"", id)));
    }

    #[tokio::test]
    async fn finished_run_streams_only_end() {
        let state = state();
        let app = api_router().with_state(state.clone());
        let (id, mut sub) = state.registry.create_subscribed(RunRequest {
            query: "q".into(),
            mode: RunMode::Autonomous,
        });
        while sub.recv().await.is_some() {}

        let response = app.oneshot(events_request(id)).await.unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.starts_with("event: end\n"));
        assert!(!body.contains("event: done"));
    }
}

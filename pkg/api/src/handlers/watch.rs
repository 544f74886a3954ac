use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use pkg_registry::{ObjectRef, RegistryEvent};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    /// Restrict the stream to one object kind: "pods" or "nodes".
    #[serde(default)]
    pub kind: Option<String>,
    /// Restrict pod events to one namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Resume after a previously seen sequence number.
    #[serde(default)]
    pub seq: Option<u64>,
}

fn wanted(event: &RegistryEvent, kind: &Option<String>, namespace: &Option<String>) -> bool {
    match &event.object {
        ObjectRef::Pod { namespace: ns, .. } => {
            kind.as_deref().is_none_or(|k| k == "pods")
                && namespace.as_deref().is_none_or(|want| want == ns)
        }
        ObjectRef::Node { .. } => {
            kind.as_deref().is_none_or(|k| k == "nodes") && namespace.is_none()
        }
        // Internal keys are only streamed to unfiltered watchers
        ObjectRef::Other { .. } => kind.is_none() && namespace.is_none(),
    }
}

fn to_sse(event: &RegistryEvent) -> Option<Event> {
    serde_json::to_string(event)
        .ok()
        .map(|data| Event::default().data(data))
}

/// GET /api/v1/watch — SSE endpoint streaming registry events: buffered
/// events after `seq` first, then the live feed.
pub async fn watch_events(
    State(state): State<AppState>,
    Query(query): Query<WatchQuery>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let WatchQuery {
        kind,
        namespace,
        seq,
    } = query;
    let from_seq = seq.unwrap_or(0);
    info!(
        "Watch subscription: kind={:?}, namespace={:?}, from_seq={}",
        kind, namespace, from_seq
    );

    let buffered = state.registry.event_log.replay(from_seq).await;
    let live = BroadcastStream::new(state.registry.event_log.subscribe());

    let (kind_live, namespace_live) = (kind.clone(), namespace.clone());
    let buffered_stream = tokio_stream::iter(
        buffered
            .into_iter()
            .filter(move |e| wanted(e, &kind, &namespace))
            .filter_map(|e| to_sse(&e).map(Ok::<_, Infallible>)),
    );
    let live_stream = live.filter_map(move |result| match result {
        Ok(event) if wanted(&event, &kind_live, &namespace_live) => {
            to_sse(&event).map(Ok::<_, Infallible>)
        }
        _ => None,
    });

    Sse::new(buffered_stream.chain(live_stream)).keep_alive(KeepAlive::default())
}

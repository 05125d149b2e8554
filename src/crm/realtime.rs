//! Server-sent change stream.
//!
//! `GET /realtime/v1/stream?table=deals&event=insert` keeps the connection
//! open and writes one SSE frame per matching change. The frame's `event`
//! field carries the change kind and `data` the JSON-encoded change. A
//! subscriber that fell behind gets a `resync` frame with the number of
//! dropped changes and is expected to refetch.

use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use uuid::Uuid;

use super::api::{self, ApiError, SharedState};
use super::feed::{ChangeFilter, ChangeKind, Table};
use crate::client::{Realtime, RealtimeMessage, Subscription};

/// SSE event name of the "changes were dropped" marker.
pub const RESYNC_EVENT: &str = "resync";

/// Interval between SSE comment frames on an idle stream.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub table: Table,
    pub event: Option<ChangeKind>,
    pub agency_id: Option<Uuid>,
}

impl From<StreamQuery> for ChangeFilter {
    fn from(query: StreamQuery) -> Self {
        ChangeFilter {
            event: query.event,
            table: query.table,
            agency_id: query.agency_id,
        }
    }
}

pub fn realtime_router() -> Router<SharedState> {
    Router::new().route("/realtime/v1/stream", get(stream_handler))
}

async fn stream_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let client = api::caller(&state, &headers).await?;
    let filter = ChangeFilter::from(query);
    let subscription = client.subscribe(filter).await?;
    tracing::debug!(table = %filter.table, "realtime stream opened");

    Ok(Sse::new(change_stream(subscription)).keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL)))
}

/// Turn a subscription into SSE frames. Ends when the feed closes; dropping
/// the stream drops the subscription.
fn change_stream(subscription: Subscription) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(subscription, |mut sub| async move {
        let frame = match sub.next().await? {
            RealtimeMessage::Change(change) => Event::default().event(change.kind.as_str()).json_data(&change),
            RealtimeMessage::Resync { skipped } => Event::default()
                .event(RESYNC_EVENT)
                .json_data(serde_json::json!({ "skipped": skipped })),
        };
        Some((frame, sub))
    })
}

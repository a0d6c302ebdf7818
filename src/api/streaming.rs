// SSE streaming of availability events

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::availability::notify::AvailabilityEvent;

fn event_name(event: &AvailabilityEvent) -> &'static str {
    match event {
        AvailabilityEvent::Blacklisted { .. } => "blacklisted",
        AvailabilityEvent::Recovered { .. } => "recovered",
    }
}

/// Forward broadcast events to an SSE client until it disconnects.
/// A slow client that falls behind gets a `lagged` event instead of the dropped ones.
pub fn availability_events(
    mut rx: broadcast::Receiver<AvailabilityEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event(event_name(&event)).data(data));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("SSE subscriber lagged, {} events dropped", skipped);
                    yield Ok(Event::default()
                        .event("lagged")
                        .data(json!({ "skipped": skipped }).to_string()));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Platform;

    #[test]
    fn event_names_follow_variant() {
        let recovered = AvailabilityEvent::Recovered {
            platform: Platform::Codex,
            provider: "a".into(),
            manual: true,
        };
        assert_eq!(event_name(&recovered), "recovered");
    }
}

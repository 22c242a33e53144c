//! SSE transport for provider responses.
//!
//! Converts a `reqwest::Response` body into a stream of [`SseEvent`]s, and
//! drives a provider-specific [`ChunkParser`] over it to produce
//! [`ModelEvent`]s.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::Stream;
use tokio_stream::StreamExt;

use carbot_core::sse::{SseDecoder, SseEvent};

use crate::{ModelEvent, ModelEventStream, ProviderError};

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;
type EventStream = Pin<Box<dyn Stream<Item = Result<SseEvent, ProviderError>> + Send>>;

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, ProviderError>> + Send {
    futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(response.bytes_stream()),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.done {
                    return None;
                }

                // Need more data from the stream
                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.decoder.push(&chunk));
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((
                            Err(ProviderError::Stream(format!("SSE stream error: {e}"))),
                            state,
                        ));
                    }
                    None => {
                        state.done = true;
                        state.pending.extend(state.decoder.finish());
                    }
                }
            }
        },
    )
}

struct SseState {
    byte_stream: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    done: bool,
}

/// Provider-specific translation of SSE `data` payloads into model events.
pub(crate) trait ChunkParser: Send + 'static {
    /// Handle one SSE data payload.
    fn parse(&mut self, data: &str) -> Vec<Result<ModelEvent, ProviderError>>;

    /// Emit whatever is still buffered once the body has ended.
    fn finish(&mut self) -> Vec<Result<ModelEvent, ProviderError>>;
}

/// Drive a [`ChunkParser`] over an SSE response body.
///
/// The stream ends after the first error.
pub(crate) fn model_event_stream<P: ChunkParser>(
    response: reqwest::Response,
    parser: P,
) -> ModelEventStream {
    let state = EventState {
        sse: Box::pin(parse_sse_stream(response)),
        parser,
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                if item.is_err() {
                    state.pending.clear();
                    state.finished = true;
                }
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.sse.next().await {
                Some(Ok(event)) => {
                    let items = state.parser.parse(&event.data);
                    state.pending.extend(items);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.push_back(Err(e));
                }
                None => {
                    state.finished = true;
                    let items = state.parser.finish();
                    state.pending.extend(items);
                }
            }
        }
    }))
}

struct EventState<P> {
    sse: EventStream,
    parser: P,
    pending: VecDeque<Result<ModelEvent, ProviderError>>,
    finished: bool,
}

/// Turn a non-success HTTP response into a [`ProviderError`].
pub(crate) async fn error_for_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ProviderError::Auth(format!("HTTP {status}: {body}")));
    }
    Err(ProviderError::Api {
        status: status.as_u16(),
        body,
    })
}

//! Wrapper around a [`RawStream`] that applies `StreamTimeout` to the stream's lifetime and
//! emits [`StreamEvent`]s as messages arrive.

use std::time::Duration;

use crate::{
    endpoint::Endpoint,
    error::Result,
    event::{conn::StreamEvent, Emitter},
    runtime,
    transport::RawStream,
};

/// A single server-streaming call in progress. Dropping the stream before it ends naturally
/// cancels it; there is no explicit `close` method because the underlying `RawStream` has no
/// separate teardown step beyond being dropped.
pub(crate) struct Stream {
    raw: Box<dyn RawStream>,
    endpoint: Endpoint,
    timeout: Option<Duration>,
    events: Emitter<StreamEvent>,
    done: bool,
}

impl Stream {
    pub(crate) fn new(
        raw: Box<dyn RawStream>,
        endpoint: Endpoint,
        timeout: Option<Duration>,
        events: Emitter<StreamEvent>,
    ) -> Self {
        Self {
            raw,
            endpoint,
            timeout,
            events,
            done: false,
        }
    }

    /// Receive the next message, or `None` on clean end-of-stream. Once this returns an error or
    /// `None`, the stream is considered terminal and further calls return `None` immediately.
    pub(crate) async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        let recv = self.raw.recv();
        let result = runtime::maybe_timeout(self.timeout, recv).await?;

        match &result {
            Ok(Some(_)) => {
                self.events.emit(|| StreamEvent::MessageReceived {
                    endpoint: self.endpoint.clone(),
                });
            }
            Ok(None) => {
                self.done = true;
                self.events.emit(|| StreamEvent::Closed {
                    endpoint: self.endpoint.clone(),
                    error: None,
                });
            }
            Err(e) => {
                self.done = true;
                self.events.emit(|| StreamEvent::Closed {
                    endpoint: self.endpoint.clone(),
                    error: Some(e.to_string()),
                });
            }
        }

        result
    }
}

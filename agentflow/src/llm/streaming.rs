//! Activity-based timeout for streamed responses.

use super::{ChunkStream, LlmError};
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

struct Guard {
    inner: ChunkStream,
    token: CancellationToken,
    window: Duration,
    done: bool,
}

/// Wraps `inner` so that it ends once no chunk arrives within `window`.
///
/// The window restarts with every chunk, so only stalls are bounded, never
/// total duration. On a stall `token` is cancelled (the producing service
/// should be watching it or one of its parents) and a final
/// [`LlmError::StreamInactive`] is yielded. If `token` is cancelled from
/// outside, a final [`LlmError::Cancelled`] is yielded. An error from
/// `inner` is passed through and ends the stream.
pub fn with_inactivity_timeout(
    inner: ChunkStream,
    window: Duration,
    token: CancellationToken,
) -> ChunkStream {
    let guard = Guard {
        inner,
        token,
        window,
        done: false,
    };

    stream::unfold(guard, |mut guard| async move {
        if guard.done {
            return None;
        }

        let item = tokio::select! {
            biased;
            () = guard.token.cancelled() => Some(Err(LlmError::Cancelled)),
            next = guard.inner.next() => next,
            () = tokio::time::sleep(guard.window) => {
                warn!(
                    window_ms = u64::try_from(guard.window.as_millis()).unwrap_or(u64::MAX),
                    "Stream inactive; cancelling"
                );
                guard.token.cancel();
                Some(Err(LlmError::StreamInactive(guard.window)))
            }
        };

        match item {
            Some(Ok(chunk)) => Some((Ok(chunk), guard)),
            Some(Err(e)) => {
                guard.done = true;
                Some((Err(e), guard))
            }
            None => None,
        }
    })
    .boxed()
}

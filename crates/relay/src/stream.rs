//! Streamed responses: reading the vendor body, reassembling it for the client.

mod reassembly;
mod tool_calls;
pub(crate) mod upstream;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) use self::{reassembly::ClaudeStreamEncoder, tool_calls::ToolCallTable};
use self::upstream::{Terminal, UpstreamReader};
use crate::{manager::StreamPipeline, messages::unified::Usage, transformer::SseFrame};

/// Runs the reassembly loop of one streamed request until the client stream is
/// complete, the client went away, or the request was cancelled.
///
/// Frames are handed to `events` one by one. A slow client blocks the loop
/// instead of buffering without bound.
pub(crate) async fn relay_stream(
    mut pipeline: StreamPipeline,
    mut reader: UpstreamReader,
    events: mpsc::Sender<SseFrame>,
    token: CancellationToken,
) -> Usage {
    loop {
        let data = tokio::select! {
            biased;
            _ = token.cancelled() => {
                log::debug!("Request cancelled, closing the stream");
                pipeline.abort();
                break;
            }
            data = reader.data.recv() => data,
        };

        let frames = match data {
            Some(data) => pipeline.push(&data),
            None => match reader.terminal().await {
                Terminal::Eof => pipeline.finish(),
                Terminal::Failed(error) => {
                    log::error!("Upstream stream failed: {error}");
                    pipeline.finish()
                }
                Terminal::Aborted => {
                    pipeline.abort();
                    Vec::new()
                }
            },
        };

        for frame in frames {
            if events.send(frame).await.is_err() {
                log::debug!("Client disconnected, closing the stream");
                pipeline.abort();
                token.cancel();
                break;
            }
        }

        if pipeline.is_closed() {
            break;
        }
    }

    pipeline.usage()
}

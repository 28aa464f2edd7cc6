//! Reading a streamed upstream body.
//!
//! A reader task owns the upstream response. It publishes every data payload
//! on a bounded channel, in arrival order, and reports how the body ended on a
//! separate one-shot channel once the data channel is closed. Cancelling the
//! request token stops the task and drops the response, which closes the
//! upstream connection.

use std::{
    error::Error as StdError,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use axum::body::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt, TryStreamExt};
use pin_project::pin_project;
use tokio::sync::{mpsc, oneshot};
use tokio_util::{
    codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead},
    io::StreamReader,
    sync::{CancellationToken, DropGuard},
};

/// How the payloads of an upstream stream are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// OpenAI-shaped `data:` lines. Bare JSON lines are accepted too, and
    /// comment lines are skipped.
    Lines,
    /// Standard server-sent events.
    EventSource,
}

/// How an upstream body ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Terminal {
    /// The body ended, with or without a `[DONE]` marker.
    Eof,
    /// Reading failed for a reason other than a dropped connection.
    Failed(String),
    /// The connection dropped, or the request was cancelled.
    Aborted,
}

/// The receiving half of a reader task.
pub(crate) struct UpstreamReader {
    pub data: mpsc::Receiver<String>,
    pub terminal: oneshot::Receiver<Terminal>,
}

impl UpstreamReader {
    /// Spawns the reader task for `response`.
    pub fn spawn(response: reqwest::Response, framing: Framing, token: CancellationToken, capacity: usize) -> Self {
        let (data_tx, data) = mpsc::channel(capacity.max(1));
        let (terminal_tx, terminal) = oneshot::channel();

        tokio::spawn(async move {
            let terminal = tokio::select! {
                _ = token.cancelled() => Terminal::Aborted,
                terminal = read_body(response, framing, &data_tx) => terminal,
            };

            // the consumer must see every payload before the terminal condition
            drop(data_tx);
            let _ = terminal_tx.send(terminal);
        });

        Self { data, terminal }
    }

    /// Waits for the terminal condition. Call after the data channel closed.
    pub async fn terminal(&mut self) -> Terminal {
        (&mut self.terminal).await.unwrap_or(Terminal::Aborted)
    }
}

/// Longest line accepted from an upstream body.
const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

async fn read_body(response: reqwest::Response, framing: Framing, data: &mpsc::Sender<String>) -> Terminal {
    let lines = utf8_lines(response.bytes_stream());

    match framing {
        Framing::Lines => {
            let mut lines = std::pin::pin!(lines);

            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(error) => return codec_failure(error),
                };

                match line_payload(&line) {
                    LinePayload::Data(payload) => {
                        if data.send(payload.to_string()).await.is_err() {
                            return Terminal::Aborted;
                        }
                    }
                    LinePayload::Done => return Terminal::Eof,
                    LinePayload::Skip => (),
                }
            }
        }
        Framing::EventSource => {
            let lines = lines.map_ok(|mut line| {
                line.push('\n');
                line
            });

            let mut events = std::pin::pin!(lines.eventsource());

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(EventStreamError::Transport(error)) => return codec_failure(error),
                    Err(error) => return Terminal::Failed(error.to_string()),
                };

                match event.data.trim() {
                    "" => (),
                    "[DONE]" => return Terminal::Eof,
                    payload => {
                        if data.send(payload.to_string()).await.is_err() {
                            return Terminal::Aborted;
                        }
                    }
                }
            }
        }
    }

    Terminal::Eof
}

/// Splits a body into newline-delimited lines of bounded length.
///
/// A line that is not valid UTF-8 is logged and skipped, so one corrupt chunk
/// does not end an otherwise healthy stream.
fn utf8_lines<S>(body: S) -> impl Stream<Item = Result<String, AnyDelimiterCodecError>>
where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_LENGTH);
    let reader = StreamReader::new(body.map_err(io::Error::other));

    FramedRead::new(reader, codec).filter_map(|line| async move {
        match line {
            Ok(line) => match std::str::from_utf8(&line) {
                Ok(line) => Some(Ok(line.to_string())),
                Err(error) => {
                    log::warn!("Skipping upstream line that is not valid UTF-8: {error}");
                    None
                }
            },
            Err(error) => Some(Err(error)),
        }
    })
}

fn codec_failure(error: AnyDelimiterCodecError) -> Terminal {
    match error {
        AnyDelimiterCodecError::Io(error) => failure(&error),
        error => Terminal::Failed(error.to_string()),
    }
}

fn failure(error: &(dyn StdError + 'static)) -> Terminal {
    if is_connection_abort(error) {
        log::debug!("Upstream connection dropped: {error}");
        Terminal::Aborted
    } else {
        Terminal::Failed(error.to_string())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LinePayload<'a> {
    Data(&'a str),
    Done,
    Skip,
}

fn line_payload(line: &str) -> LinePayload<'_> {
    let line = line.trim();

    let payload = if let Some(data) = line.strip_prefix("data:") {
        data.trim_start()
    } else if line.starts_with('{') {
        line
    } else {
        // blank separators, `event:` lines and `: PROCESSING` comments
        return LinePayload::Skip;
    };

    match payload {
        "" => LinePayload::Skip,
        "[DONE]" => LinePayload::Done,
        payload => LinePayload::Data(payload),
    }
}

/// Whether `error`, or anything in its source chain, is a dropped connection.
pub(crate) fn is_connection_abort(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);

    while let Some(error) = current {
        if let Some(io_error) = error.downcast_ref::<io::Error>() {
            if matches!(
                io_error.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }

            // a custom io error hides its payload from `source`
            if let Some(inner) = io_error.get_ref()
                && is_connection_abort(inner)
            {
                return true;
            }
        }

        current = error.source();
    }

    false
}

/// A client-facing stream that cancels the request when dropped.
///
/// Axum drops the response body when the client goes away, which is how a
/// disconnect reaches the reassembly loop and the reader task.
#[pin_project]
pub(crate) struct GuardedStream<S> {
    #[pin]
    inner: S,
    _guard: DropGuard,
}

impl<S> GuardedStream<S> {
    pub fn new(inner: S, token: CancellationToken) -> Self {
        Self {
            inner,
            _guard: token.drop_guard(),
        }
    }
}

impl<S: Stream> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

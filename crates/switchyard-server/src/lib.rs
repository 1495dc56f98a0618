//! Newline-delimited JSON-RPC front end for a [`Gateway`].
//!
//! The caller speaks MCP to Switchyard as if it were a single server:
//! `initialize`, `ping`, `tools/list` and `tools/call`. Each line read is one
//! message; each response is written as one line through a single writer task.

mod methods;

use futures_util::StreamExt;
use switchyard_mux::Gateway;
use switchyard_mux::jsonrpc::{ErrorObject, JsonRpcResponse, error_codes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Longest accepted request line, in bytes.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Errors that end a serving session.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Response writer failed: {0}")]
    Writer(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Eof,
    Shutdown,
}

/// Serve requests from `reader` until EOF or gateway shutdown.
///
/// On EOF, calls still running are allowed to finish so their responses are
/// written. On shutdown they are abandoned.
pub async fn serve<R, W>(gateway: Gateway, reader: R, writer: W) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (responses, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, rx));
    let shutdown = gateway.shutdown_token();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let session = methods::Session::new(gateway, responses);
    let mut calls = JoinSet::new();

    let reason = loop {
        let next = tokio::select! {
            next = lines.next() => next,
            () = shutdown.cancelled() => break StopReason::Shutdown,
        };
        match next {
            None => break StopReason::Eof,
            Some(Ok(line)) => session.handle_line(&line, &mut calls),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!("Request line exceeds {MAX_LINE_BYTES} bytes, discarding");
                session.reply(JsonRpcResponse::failure(
                    None,
                    ErrorObject::new(error_codes::PARSE_ERROR, "Parse error: line too long"),
                ));
            }
            Some(Err(LinesCodecError::Io(e))) => {
                calls.shutdown().await;
                return Err(e.into());
            }
        }
        while calls.try_join_next().is_some() {}
    };
    tracing::debug!("Front server stopping ({reason:?})");

    let drained = reason == StopReason::Eof
        && tokio::select! {
            () = drain(&mut calls) => true,
            () = shutdown.cancelled() => false,
        };
    if !drained {
        calls.shutdown().await;
    }

    drop(session);
    match writer_task.await {
        Ok(result) => result.map_err(ServerError::from),
        Err(e) => Err(ServerError::Writer(e.to_string())),
    }
}

async fn drain(calls: &mut JoinSet<()>) {
    while calls.join_next().await.is_some() {}
}

/// Write each response as one line. Ends when every sender is gone.
async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<JsonRpcResponse>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

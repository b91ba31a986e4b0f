//! 客户端桥接：stdin/stdout 上的 JSON Lines
//!
//! 入站：每行一个信封，应用标签不符或不是客户端请求的丢弃，其余发布到总线。
//! 服务每路由一条请求就推进计数；入站一侧据此限流，并在 EOF 后等全部请求路由完才返回。
//! 出站：编排器与服务发往客户端的信封，每条写一行。

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Bus, Envelope, ProtocolError};

/// 单行上限，startDeletionTask 可能携带上千个条目
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// 读取客户端输入直到 EOF 或关闭，返回发布的请求数
///
/// `routed` 是服务已路由的请求计数。未路由的请求最多占总线容量的一半，
/// 慢订阅者不会因滞后丢掉请求；EOF 后等全部请求路由完再返回。
pub async fn forward_inbound<R>(
    reader: R,
    bus: &Bus,
    mut routed: watch::Receiver<u64>,
    shutdown: CancellationToken,
) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let window = (bus.capacity() / 2).max(1) as u64;
    let mut published = 0u64;
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next() => line,
        };
        match line {
            None => {
                tracing::info!("client input closed");
                break;
            }
            Some(Ok(line)) => {
                if !publish_line(&line, bus) {
                    continue;
                }
                published += 1;
                if !wait_routed(&mut routed, published.saturating_sub(window), &shutdown).await {
                    break;
                }
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!(limit = MAX_LINE_BYTES, "oversized client line skipped");
            }
            Some(Err(LinesCodecError::Io(e))) => {
                return Err(ProtocolError::Transport(e.to_string()));
            }
        }
    }
    if wait_routed(&mut routed, published, &shutdown).await {
        tracing::debug!(published, "all client requests routed");
    }
    Ok(published)
}

/// 等服务路由到第 `target` 条请求；关闭或服务已退出时返回 false
async fn wait_routed(
    routed: &mut watch::Receiver<u64>,
    target: u64,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        reached = async { routed.wait_for(|n| *n >= target).await.is_ok() } => {
            if !reached {
                tracing::warn!(target, "service stopped before routing client requests");
            }
            reached
        }
    }
}

/// 解码一行并发布；返回是否发布
fn publish_line(line: &str, bus: &Bus) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }
    match Envelope::decode(line, bus.app()) {
        Ok(Some(envelope)) if envelope.action().is_client_request() => {
            bus.publish_envelope(envelope);
            true
        }
        Ok(Some(envelope)) => {
            tracing::warn!(action = %envelope.action(), "client may not send this action, dropped");
            false
        }
        Ok(None) => {
            tracing::trace!("foreign client line ignored");
            false
        }
        Err(e) => {
            tracing::warn!(error = %e, "malformed client line skipped");
            false
        }
    }
}

/// 把出站信封逐行写给客户端，直到所有发送端关闭
pub async fn forward_outbound<W>(
    writer: W,
    mut outbox: mpsc::UnboundedReceiver<Envelope>,
) -> Result<W, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new());
    while let Some(envelope) = outbox.recv().await {
        if !envelope.action().is_client_bound() {
            tracing::warn!(action = %envelope.action(), "not a client message, dropped");
            continue;
        }
        let line = match envelope.encode() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(action = %envelope.action(), error = %e, "could not encode envelope");
                continue;
            }
        };
        tracing::debug!(action = %envelope.action(), "to client");
        sink.send(line)
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
    }
    Ok(sink.into_inner())
}

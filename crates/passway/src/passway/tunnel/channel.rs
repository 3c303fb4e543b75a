use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::passway::{
    telemetry,
    tunnel::signal::{Offer, SignalSender},
};

/// Upper bound for one control line; a peer streaming bytes without a newline
/// is treated as a broken channel.
pub const MAX_SIGNAL_LINE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ControlChannelError {
    #[error("tunnel: control channel closed by peer")]
    Closed,
    #[error("tunnel: control line exceeds {MAX_SIGNAL_LINE} bytes")]
    LineTooLong,
    #[error("tunnel: control channel read: {0}")]
    Io(#[from] io::Error),
}

/// Reads newline-delimited signals from the control channel into `queue`.
///
/// Returns `Ok(())` when `cancel` fires and an error when the channel fails or
/// the peer closes it. Dropping the reader on return closes the connection.
pub async fn read_loop<R>(
    reader: R,
    queue: &SignalSender,
    cancel: &CancellationToken,
) -> Result<(), ControlChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(128);

    loop {
        line.clear();
        let mut limited = (&mut reader).take((MAX_SIGNAL_LINE + 1) as u64);
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            n = limited.read_until(b'\n', &mut line) => n?,
        };

        if n == 0 {
            return Err(ControlChannelError::Closed);
        }
        if line.last() != Some(&b'\n') {
            if line.len() > MAX_SIGNAL_LINE {
                return Err(ControlChannelError::LineTooLong);
            }
            // EOF in the middle of a line; the partial signal is discarded.
            return Err(ControlChannelError::Closed);
        }

        let text = String::from_utf8_lossy(&line);
        let signal = text.trim();
        if signal.is_empty() {
            continue;
        }

        let offered = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            o = queue.offer(signal.to_string()) => o,
        };
        match offered {
            Offer::Queued => tracing::trace!(signal, "tunnel: signal queued"),
            Offer::Dropped => {
                metrics::counter!(telemetry::SIGNALS_DROPPED).increment(1);
                tracing::debug!(
                    signal,
                    capacity = queue.max_capacity(),
                    "tunnel: signal queue full; dropping signal"
                );
            }
            Offer::Closed => {
                metrics::counter!(telemetry::SIGNALS_DROPPED).increment(1);
                tracing::debug!(signal, "tunnel: dispatcher stopped; dropping signal");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::passway::{config::DropPolicy, tunnel::signal::signal_queue};

    fn drain(rx: &mut crate::passway::tunnel::signal::SignalReceiver) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(s) = rx.try_recv() {
            out.push(s);
        }
        out
    }

    #[tokio::test]
    async fn lines_are_trimmed_and_blank_lines_skipped() {
        let (mut peer, ours) = tokio::io::duplex(1024);
        let (tx, mut rx) = signal_queue(16, DropPolicy::DropNewest);
        let cancel = CancellationToken::new();

        peer.write_all(b"tcp://a\n  remote://9100 \r\n\n\t\nudp://b\n")
            .await
            .unwrap();
        drop(peer);

        let err = read_loop(ours, &tx, &cancel).await.unwrap_err();
        assert!(matches!(err, ControlChannelError::Closed), "{err}");
        assert_eq!(drain(&mut rx), vec!["tcp://a", "remote://9100", "udp://b"]);
    }

    #[tokio::test]
    async fn partial_line_at_eof_is_discarded() {
        let (mut peer, ours) = tokio::io::duplex(1024);
        let (tx, mut rx) = signal_queue(16, DropPolicy::DropNewest);
        let cancel = CancellationToken::new();

        peer.write_all(b"tcp://a\ntcp://b").await.unwrap();
        drop(peer);

        assert!(read_loop(ours, &tx, &cancel).await.is_err());
        assert_eq!(drain(&mut rx), vec!["tcp://a"]);
    }

    #[tokio::test]
    async fn overflow_drops_newest_signal() {
        let (mut peer, ours) = tokio::io::duplex(1024);
        let (tx, mut rx) = signal_queue(3, DropPolicy::DropNewest);
        let cancel = CancellationToken::new();

        peer.write_all(b"tcp://1\ntcp://2\ntcp://3\ntcp://4\n")
            .await
            .unwrap();
        drop(peer);

        let _ = read_loop(ours, &tx, &cancel).await;
        assert_eq!(drain(&mut rx), vec!["tcp://1", "tcp://2", "tcp://3"]);
    }

    #[tokio::test]
    async fn line_at_the_limit_is_accepted_and_reading_continues() {
        let (mut peer, ours) = tokio::io::duplex(4 * MAX_SIGNAL_LINE);
        let (tx, mut rx) = signal_queue(16, DropPolicy::DropNewest);
        let cancel = CancellationToken::new();

        let mut long = b"tcp://".to_vec();
        long.resize(MAX_SIGNAL_LINE, b'x');
        let mut wire = long.clone();
        wire.extend_from_slice(b"\nudp://after\n");
        peer.write_all(&wire).await.unwrap();
        drop(peer);

        let err = read_loop(ours, &tx, &cancel).await.unwrap_err();
        assert!(matches!(err, ControlChannelError::Closed), "{err}");
        let got = drain(&mut rx);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].as_bytes(), &long[..]);
        assert_eq!(got[1], "udp://after");
    }

    #[tokio::test]
    async fn oversized_line_fails_the_channel() {
        let (mut peer, ours) = tokio::io::duplex(4 * MAX_SIGNAL_LINE);
        let (tx, _rx) = signal_queue(16, DropPolicy::DropNewest);
        let cancel = CancellationToken::new();

        let junk = vec![b'x'; MAX_SIGNAL_LINE + 10];
        peer.write_all(&junk).await.unwrap();

        let err = read_loop(ours, &tx, &cancel).await.unwrap_err();
        assert!(matches!(err, ControlChannelError::LineTooLong), "{err}");
    }

    #[tokio::test]
    async fn cancellation_ends_a_blocked_read() {
        let (_peer, ours) = tokio::io::duplex(1024);
        let (tx, _rx) = signal_queue(16, DropPolicy::DropNewest);
        let cancel = CancellationToken::new();

        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });

        let res = tokio::time::timeout(Duration::from_secs(2), read_loop(ours, &tx, &cancel))
            .await
            .expect("read loop must observe cancellation");
        assert!(res.is_ok());
    }
}

//! Agent output forwarding.
//!
//! One task per stream drains lines into tracing for the lifetime of the
//! process. Line order is preserved per stream; stdout and stderr are not
//! ordered against each other.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Which agent stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Spawn a task logging every line of `reader`; resolves to the line count
pub fn forward<R>(pid: u32, stream: OutputStream, reader: R) -> JoinHandle<usize>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut count = 0;

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    log_line(pid, stream, &line);
                    count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        target: "muster::agent",
                        pid = pid,
                        stream = stream.as_str(),
                        error = %e,
                        "Stopped reading agent output"
                    );
                    break;
                }
            }
        }

        count
    })
}

/// Log one captured line under the agent target
pub fn log_line(pid: u32, stream: OutputStream, line: &str) {
    match stream {
        OutputStream::Stdout => {
            tracing::info!(target: "muster::agent", pid = pid, stream = stream.as_str(), "{}", line)
        }
        OutputStream::Stderr => {
            tracing::warn!(target: "muster::agent", pid = pid, stream = stream.as_str(), "{}", line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_counts_lines() {
        let input: &[u8] = b"==> Starting agent\n==> Joining cluster\npartial";
        let handle = forward(42, OutputStream::Stdout, input);
        assert_eq!(handle.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_forward_empty_stream() {
        let input: &[u8] = b"";
        let handle = forward(42, OutputStream::Stderr, input);
        assert_eq!(handle.await.unwrap(), 0);
    }
}

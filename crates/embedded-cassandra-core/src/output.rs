use futures::stream::{self, BoxStream, StreamExt};
use std::io;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{Instrument, Span, debug, error, warn};

/// Splits a byte stream into lines. Invalid UTF-8 is replaced, never
/// rejected, so a garbled line cannot end the stream.
#[derive(Debug, Default)]
struct LossyLineCodec {
    next_index: usize,
}

impl Decoder for LossyLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src[self.next_index..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = self.next_index + offset;
                let line = src.split_to(end + 1);
                self.next_index = 0;
                Ok(Some(decode_line(&line[..end])))
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let line = src.split_to(src.len());
        self.next_index = 0;
        Ok(Some(decode_line(&line)))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Stream closed underneath the reader, typically because the process was
/// destroyed mid-read. Expected during shutdown.
fn is_stream_closed(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    ) || error.raw_os_error() == Some(9)
}

/// Merged stdout/stderr of a spawned process, line by line.
pub struct ProcessOutput {
    lines: BoxStream<'static, io::Result<String>>,
}

impl ProcessOutput {
    pub fn from_pipes<O, E>(stdout: O, stderr: E) -> Self
    where
        O: AsyncRead + Send + 'static,
        E: AsyncRead + Send + 'static,
    {
        let stdout = FramedRead::new(stdout, LossyLineCodec::default());
        let stderr = FramedRead::new(stderr, LossyLineCodec::default());
        Self {
            lines: stream::select(stdout, stderr).boxed(),
        }
    }

    pub fn from_pipe<O>(stdout: O) -> Self
    where
        O: AsyncRead + Send + 'static,
    {
        Self {
            lines: FramedRead::new(stdout, LossyLineCodec::default()).boxed(),
        }
    }

    /// Spawns the task that feeds every non-blank line to `consumer`.
    ///
    /// The task is the only caller of `consumer`. Read failures are logged
    /// and end nothing but the affected pipe; a panicking consumer is
    /// reported when the drain is joined.
    pub fn drain<C>(self, span: Span, mut consumer: C) -> OutputDrain
    where
        C: FnMut(&str) + Send + 'static,
    {
        let mut lines = self.lines;
        let task = tokio::spawn(
            async move {
                while let Some(line) = lines.next().await {
                    match line {
                        Ok(line) if line.trim().is_empty() => {}
                        Ok(line) => consumer(&line),
                        Err(e) if is_stream_closed(&e) => {
                            debug!("Output stream closed: {e}");
                        }
                        Err(e) => {
                            warn!("Failed to read process output: {e}");
                        }
                    }
                }
                debug!("Output drained");
            }
            .instrument(span),
        );
        OutputDrain { task }
    }
}

/// Join point of an output-draining task.
pub struct OutputDrain {
    task: JoinHandle<()>,
}

impl OutputDrain {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits at most `timeout` for the remaining output, then aborts the task.
    pub async fn join(mut self, timeout: Duration) {
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => {
                error!("Output consumer panicked: {e}");
            }
            Ok(Err(e)) => {
                debug!("Output drain cancelled: {e}");
            }
            Err(_) => {
                debug!("Output still draining after {timeout:?}, aborting");
                self.task.abort();
            }
        }
    }

    pub fn abort(self) {
        self.task.abort();
    }
}

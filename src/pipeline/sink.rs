//! Byte sinks the reassembled elementary stream is written to

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::process::ChildStdin;

use super::types::AccessUnit;

/// Destination for access units
///
/// A write error ends the reader loop that owns the sink.
#[async_trait]
pub trait OutputSink: Send {
    async fn write_unit(&mut self, unit: &AccessUnit) -> Result<()>;

    /// Flush buffered bytes. The sink must not be written to afterwards.
    async fn finish(&mut self) -> Result<()>;

    fn describe(&self) -> &str;
}

/// Sink over any async byte writer
pub struct WriterSink<W> {
    writer: BufWriter<W>,
    label: String,
}

impl<W: AsyncWrite + Unpin + Send> WriterSink<W> {
    pub fn new(writer: W, label: impl Into<String>) -> Self {
        Self {
            writer: BufWriter::new(writer),
            label: label.into(),
        }
    }
}

/// Raw stream written to a local file
pub type FileSink = WriterSink<tokio::fs::File>;

/// Raw stream written to this process's standard output
pub type StdoutSink = WriterSink<tokio::io::Stdout>;

/// Raw stream written to an open pipe, usually a child's stdin
pub type PipeSink = WriterSink<ChildStdin>;

/// Sink that drops everything, for tracks nobody consumes
pub type DiscardSink = WriterSink<tokio::io::Sink>;

impl FileSink {
    pub async fn create(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        Ok(Self::new(file, path.display().to_string()))
    }
}

impl StdoutSink {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout(), "stdout")
    }
}

impl PipeSink {
    pub fn pipe(stdin: ChildStdin, name: &str) -> Self {
        Self::new(stdin, format!("pipe to {}", name))
    }
}

impl DiscardSink {
    pub fn discard() -> Self {
        Self::new(tokio::io::sink(), "discard")
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> OutputSink for WriterSink<W> {
    async fn write_unit(&mut self, unit: &AccessUnit) -> Result<()> {
        self.writer
            .write_all(&unit.data)
            .await
            .with_context(|| format!("writing to {}", self.label))
    }

    async fn finish(&mut self) -> Result<()> {
        self.writer
            .flush()
            .await
            .with_context(|| format!("flushing {}", self.label))?;
        self.writer
            .shutdown()
            .await
            .with_context(|| format!("closing {}", self.label))
    }

    fn describe(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::MediaKind;
    use bytes::Bytes;

    fn unit(data: &'static [u8]) -> AccessUnit {
        AccessUnit {
            kind: MediaKind::Video,
            timestamp: 0,
            data: Bytes::from_static(data),
            is_keyframe: false,
        }
    }

    #[tokio::test]
    async fn test_file_sink_writes_units_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h264");

        let mut sink = FileSink::create(&path).await.unwrap();
        sink.write_unit(&unit(&[0, 0, 0, 1, 0x65])).await.unwrap();
        sink.write_unit(&unit(&[0, 0, 0, 1, 0x41])).await.unwrap();
        sink.finish().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 1, 0x65, 0, 0, 0, 1, 0x41]);
    }

    #[tokio::test]
    async fn test_pipe_sink_reports_closed_reader() {
        let (writer, reader) = tokio::io::duplex(16);
        drop(reader);

        let mut sink = WriterSink::new(writer, "duplex");
        let big = vec![0u8; 64 * 1024];
        let err = sink
            .write_unit(&AccessUnit {
                kind: MediaKind::Video,
                timestamp: 0,
                data: Bytes::from(big),
                is_keyframe: false,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplex"));
    }

    #[tokio::test]
    async fn test_discard_sink_accepts_everything() {
        let mut sink = DiscardSink::discard();
        sink.write_unit(&unit(&[1, 2, 3])).await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(sink.describe(), "discard");
    }
}

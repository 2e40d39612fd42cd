//! Where status lines go.

use super::message::StatusMessage;
use crate::errors::RigError;
use std::io::{self, Write};
use tokio::sync::mpsc;

pub trait StatusSink: Send {
    fn emit(&mut self, message: &StatusMessage) -> Result<(), RigError>;
}

/// Writes one JSON object per line and flushes after each.
pub struct WriterSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl WriterSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> StatusSink for WriterSink<W> {
    fn emit(&mut self, message: &StatusMessage) -> Result<(), RigError> {
        let line = message.to_line()?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Hands messages to an in-process receiver.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StatusMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelSink {
    fn emit(&mut self, message: &StatusMessage) -> Result<(), RigError> {
        // a dropped receiver only means nobody is listening any more
        let _ = self.tx.send(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::StatusKind;
    use serde_json::json;

    #[test]
    fn test_writer_sink_lines() {
        let mut sink = WriterSink::new(Vec::new());
        sink.emit(&StatusMessage::new(StatusKind::Searching, json!({})))
            .unwrap();
        sink.emit(&StatusMessage::new(StatusKind::Quitting, json!({})))
            .unwrap();
        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"status\":\"searching\""));
        assert!(lines[1].contains("\"status\":\"quitting\""));
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (mut sink, mut rx) = ChannelSink::new();
        sink.emit(&StatusMessage::new(StatusKind::Busy, json!({"command": "quit"})))
            .unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.status, StatusKind::Busy);
    }
}

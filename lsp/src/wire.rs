//! Single-writer serialization of outbound frames.
//!
//! Every outbound frame funnels through one writer task, so frames reach the
//! wire whole and in queue order regardless of which task produced them.

use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::codec::FrameWriter;
use crate::envelope::{OutgoingFrame, RequestId};
use crate::error::ResponseError;

pub(crate) enum WriterCommand {
    Send(OutgoingFrame),
    Shutdown,
}

/// Cheap handle that queues frames for the writer task.
///
/// The channel is unbounded: enqueueing never blocks, which lets destructors
/// emit a frame without an executor.
#[derive(Clone)]
pub(crate) struct WireSender {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl WireSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WriterCommand>) -> Self {
        Self { tx }
    }

    pub(crate) fn notify(&self, method: String, params: Value) {
        tracing::debug!(%method, "--> notification");
        self.send(OutgoingFrame::Notification { method, params });
    }

    pub(crate) fn call(&self, id: i64, method: String, params: Value) {
        tracing::debug!(%method, id, "--> call");
        self.send(OutgoingFrame::Call { id, method, params });
    }

    pub(crate) fn reply(&self, id: RequestId, result: Result<Value, ResponseError>) {
        self.send(OutgoingFrame::Reply { id, result });
    }

    fn send(&self, frame: OutgoingFrame) {
        // The writer task only stops once the endpoint is going away; frames
        // queued after that are abandoned with the session.
        if self.tx.send(WriterCommand::Send(frame)).is_err() {
            tracing::debug!("dropping outbound frame, writer task is gone");
        }
    }
}

/// Drains queued frames onto the transport until told to stop or the last
/// sender drops. Any write failure is fatal to the session.
pub(crate) async fn drain_to_writer<W>(
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    output: W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = FrameWriter::new(output);
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send(frame) => writer.write_frame(&frame.to_value()).await?,
            WriterCommand::Shutdown => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameReader;
    use serde_json::json;

    #[tokio::test]
    async fn frames_reach_the_wire_in_queue_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let wire = WireSender::new(tx.clone());

        wire.notify("alpha".to_owned(), json!({"n": 1}));
        wire.call(0, "beta".to_owned(), json!({"n": 2}));
        wire.reply(RequestId::Number(9), Ok(json!({"n": 3})));
        tx.send(WriterCommand::Shutdown).unwrap();

        let mut buffer = Vec::new();
        drain_to_writer(rx, &mut buffer).await.unwrap();

        let mut reader = FrameReader::new(buffer.as_slice());
        let first = reader.read_frame().await.unwrap().unwrap();
        let second = reader.read_frame().await.unwrap().unwrap();
        let third = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(first["method"], "alpha");
        assert_eq!(second["method"], "beta");
        assert_eq!(second["id"], 0);
        assert_eq!(third["id"], 9);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn send_after_writer_stop_is_swallowed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let wire = WireSender::new(tx);
        drop(rx);
        // Must not panic or block.
        wire.notify("late".to_owned(), Value::Null);
    }
}

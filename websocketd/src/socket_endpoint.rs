use async_trait::async_trait;
use axum::extract::ws::{self, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use websocketd_task::ChildTask;

use crate::endpoint::{Endpoint, FramingMode, Message, MessageReceiver};

const OUTPUT_CHANNEL_CAPACITY: usize = 32;

/// Typed endpoint around the client's WebSocket.
///
/// The framing mode is fixed at construction; frames of the other type are
/// logged and discarded. The underlying connection belongs to the HTTP
/// layer, which closes it when the session scope exits.
pub struct SocketEndpoint {
    mode: FramingMode,
    sink: SplitSink<WebSocket, ws::Message>,
    stream: Option<SplitStream<WebSocket>>,
    output_tx: Option<mpsc::Sender<Message>>,
    output_rx: Option<MessageReceiver>,
    _reader: Option<ChildTask<()>>,
}

impl SocketEndpoint {
    pub fn new(socket: WebSocket, mode: FramingMode) -> Self {
        let (sink, stream) = socket.split();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        Self {
            mode,
            sink,
            stream: Some(stream),
            output_tx: Some(output_tx),
            output_rx: Some(MessageReceiver::new(output_rx)),
            _reader: None,
        }
    }
}

#[async_trait]
impl Endpoint for SocketEndpoint {
    fn start_reading(&mut self) {
        let (Some(stream), Some(output_tx)) = (self.stream.take(), self.output_tx.take()) else {
            return;
        };
        // Aborted on drop, so a dangling reader never outlives the session.
        self._reader = Some(ChildTask::spawn(read_client(stream, output_tx, self.mode)));
    }

    fn output(&mut self) -> Option<MessageReceiver> {
        self.output_rx.take()
    }

    async fn send(&mut self, msg: Message) -> bool {
        let frame = match msg {
            Message::Text(text) => ws::Message::Text(Utf8Bytes::from(text)),
            Message::Binary(data) => ws::Message::Binary(data),
        };

        match self.sink.send(frame).await {
            Ok(()) => true,
            Err(error) => {
                trace!(%error, "cannot send");
                false
            }
        }
    }

    async fn terminate(&mut self) {
        trace!("websocket endpoint terminated");
    }
}

async fn read_client(mut stream: SplitStream<WebSocket>, tx: mpsc::Sender<Message>, mode: FramingMode) {
    while let Some(next) = stream.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(error) => {
                debug!(%error, "cannot receive");
                break;
            }
        };

        let msg = match (mode, frame) {
            (FramingMode::Text, ws::Message::Text(text)) => Message::Text(text.as_str().to_owned()),
            (FramingMode::Binary, ws::Message::Binary(data)) => Message::Binary(data),
            (FramingMode::Text, ws::Message::Binary(_)) => {
                debug!("discarding binary frame on text-mode session");
                continue;
            }
            (FramingMode::Binary, ws::Message::Text(_)) => {
                debug!("discarding text frame on binary-mode session");
                continue;
            }
            (_, ws::Message::Ping(_) | ws::Message::Pong(_)) => continue,
            (_, ws::Message::Close(_)) => {
                debug!("websocket connection closed");
                break;
            }
        };

        if tx.send(msg).await.is_err() {
            break;
        }
    }
    // Dropping the sender closes the output stream.
}

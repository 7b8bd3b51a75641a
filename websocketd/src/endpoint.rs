use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One unit ferried between the socket and the child process.
///
/// Text messages are newline-delimited on the child side; the delimiter is
/// never part of the message itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frame/line discipline of a session, fixed at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    Text,
    Binary,
}

/// Receiving half of an endpoint's output stream.
///
/// Closes (yields `None`) at end-of-stream. When the producer tracks a byte
/// backlog, receiving a message returns its size to the budget.
pub struct MessageReceiver {
    rx: mpsc::Receiver<Message>,
    backlog_bytes: Option<Arc<AtomicUsize>>,
}

impl MessageReceiver {
    pub fn new(rx: mpsc::Receiver<Message>) -> Self {
        Self {
            rx,
            backlog_bytes: None,
        }
    }

    pub fn with_backlog(rx: mpsc::Receiver<Message>, backlog_bytes: Arc<AtomicUsize>) -> Self {
        Self {
            rx,
            backlog_bytes: Some(backlog_bytes),
        }
    }

    /// Cancel safe, like [`mpsc::Receiver::recv`].
    pub async fn recv(&mut self) -> Option<Message> {
        let msg = self.rx.recv().await;

        if let (Some(msg), Some(backlog)) = (&msg, &self.backlog_bytes) {
            backlog.fetch_sub(msg.len(), Ordering::Relaxed);
        }

        msg
    }
}

/// Capability set shared by the two concrete transports (socket, child
/// process). The session pipe is written against this trait only.
#[async_trait]
pub trait Endpoint: Send {
    /// Spawn the background reader task(s) feeding the output stream.
    fn start_reading(&mut self);

    /// Take the output stream. Messages arrive in the order the transport
    /// produced them; the stream closes at end-of-stream. Yields the
    /// receiver once; subsequent calls return `None`.
    fn output(&mut self) -> Option<MessageReceiver>;

    /// Deliver one message to the transport. Returns `false` when the
    /// message could not be written (peer terminated or gone).
    async fn send(&mut self, msg: Message) -> bool;

    /// Tear the endpoint down. Idempotent.
    async fn terminate(&mut self);
}

/// Ferry messages between two endpoints until either side ends.
///
/// Messages are forwarded in arrival order within each direction; nothing is
/// guaranteed across directions. When either output closes or a send is
/// refused, both endpoints are terminated and the pipe returns for good.
pub async fn pipe_endpoints<A, B>(mut a: A, mut b: B)
where
    A: Endpoint,
    B: Endpoint,
{
    a.start_reading();
    b.start_reading();

    if let (Some(mut from_a), Some(mut from_b)) = (a.output(), b.output()) {
        loop {
            tokio::select! {
                maybe_msg = from_a.recv() => match maybe_msg {
                    Some(msg) => {
                        trace!(size = msg.len(), "send<-");
                        if !b.send(msg).await {
                            break;
                        }
                    }
                    None => break,
                },
                maybe_msg = from_b.recv() => match maybe_msg {
                    Some(msg) => {
                        trace!(size = msg.len(), "recv->");
                        if !a.send(msg).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    a.terminate().await;
    b.terminate().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Produces `limit` numbered messages, then closes; records everything
    /// it is asked to send.
    struct ScriptedEndpoint {
        limit: usize,
        prefix: &'static str,
        tx: Option<mpsc::Sender<Message>>,
        rx: Option<MessageReceiver>,
        received: Arc<parking_lot::Mutex<Vec<String>>>,
        terminated: Arc<AtomicUsize>,
    }

    impl ScriptedEndpoint {
        fn new(limit: usize, prefix: &'static str) -> Self {
            let (tx, rx) = mpsc::channel(16);
            Self {
                limit,
                prefix,
                tx: Some(tx),
                rx: Some(MessageReceiver::new(rx)),
                received: Arc::new(parking_lot::Mutex::new(Vec::new())),
                terminated: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Endpoint for ScriptedEndpoint {
        fn start_reading(&mut self) {
            let Some(tx) = self.tx.take() else {
                return;
            };
            let limit = self.limit;
            let prefix = self.prefix;
            tokio::spawn(async move {
                for i in 0..limit {
                    if tx.send(Message::Text(format!("{prefix}{i}"))).await.is_err() {
                        return;
                    }
                }
                // Give the shorter-lived side room to drain before closing.
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            });
        }

        fn output(&mut self) -> Option<MessageReceiver> {
            self.rx.take()
        }

        async fn send(&mut self, msg: Message) -> bool {
            if let Message::Text(text) = msg {
                self.received.lock().push(text);
            }
            true
        }

        async fn terminate(&mut self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn pipe_forwards_in_order_and_terminates_both() {
        let one = ScriptedEndpoint::new(2, "one:");
        let two = ScriptedEndpoint::new(4, "two:");

        let one_received = Arc::clone(&one.received);
        let two_received = Arc::clone(&two.received);
        let one_terminated = Arc::clone(&one.terminated);
        let two_terminated = Arc::clone(&two.terminated);

        pipe_endpoints(one, two).await;

        let one_received = one_received.lock();
        let two_received = two_received.lock();
        assert_eq!(*two_received, vec!["one:0", "one:1"]);
        assert_eq!(*one_received, vec!["two:0", "two:1", "two:2", "two:3"]);
        assert_eq!(one_terminated.load(Ordering::SeqCst), 1);
        assert_eq!(two_terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pipe_stops_when_either_output_closes() {
        let silent = ScriptedEndpoint::new(0, "silent:");
        let chatty = ScriptedEndpoint::new(1000, "chatty:");
        let chatty_terminated = Arc::clone(&chatty.terminated);

        tokio::time::timeout(std::time::Duration::from_secs(1), pipe_endpoints(silent, chatty))
            .await
            .expect("pipe must return promptly once one side closes");

        assert_eq!(chatty_terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn message_receiver_returns_bytes_to_the_budget() {
        let (tx, rx) = mpsc::channel(4);
        let budget = Arc::new(AtomicUsize::new(0));
        let mut receiver = MessageReceiver::with_backlog(rx, Arc::clone(&budget));

        budget.fetch_add(5, Ordering::Relaxed);
        tx.send(Message::Text("hello".to_owned())).await.expect("send");

        assert_eq!(receiver.recv().await, Some(Message::Text("hello".to_owned())));
        assert_eq!(budget.load(Ordering::Relaxed), 0);
    }
}

use std::sync::Arc;
use tokio::task::JoinHandle;

use super::init;
use super::error::Result;
use super::message::{Action, Event, Message, Reply};
use tokio::sync::mpsc::{
    UnboundedReceiver as Receiver, UnboundedSender as Sender, unbounded_channel as channel,
};
use tokio::sync::oneshot;

/// Cheap handle to a running engine. Clones share the same engine task.
#[derive(Debug, Clone)]
pub struct Client {
    pub sender: Sender<Message>,
    _handle: Arc<JoinHandle<()>>,
}

impl Default for Client {
    fn default() -> Self {
        let (sender, handle) = init();
        Self {
            sender,
            _handle: Arc::new(handle),
        }
    }
}

impl Client {
    pub fn new(sender: Sender<Message>, handle: JoinHandle<()>) -> Self {
        Self {
            sender,
            _handle: Arc::new(handle),
        }
    }

    /// Register for playback events (progress, completion, stop).
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = channel::<Event>();
        self.sender
            .send(Message::Subscribe(tx))
            .expect("failed to subscribe to engine");
        rx
    }

    /// Send one action and wait for its reply. Requests from a single
    /// caller are applied in the order they are sent.
    pub async fn request(&self, action: Action) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Message::Request { action, reply: tx })
            .map_err(|_| {
                crate::error::EngineError::Internal("engine task is gone".to_string())
            })?;
        rx.await.map_err(|_| {
            crate::error::EngineError::Internal("engine dropped the request".to_string())
        })?
    }
}

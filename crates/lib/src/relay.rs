//! The relay's long-lived parts and their lifecycle.
//!
//! `initialize` starts the Socket Mode listener (when configured) and the task that drains its
//! event queue; `shutdown` stops the listener, lets queued events finish, and closes the store.
//! Both are called once by the gateway at process start and stop.

use crate::ingest::Ingestor;
use crate::normalize::{Normalizer, Transport};
use crate::sender::Sender;
use crate::slack::{ChatApi, ConnectionState, InboundEvent, SocketModeListener};
use crate::store::MessageStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

const SOCKET_QUEUE_CAPACITY: usize = 256;

pub struct Relay {
    store: MessageStore,
    ingestor: Arc<Ingestor>,
    sender: Sender,
    socket: Option<Arc<SocketModeListener>>,
    started: AtomicBool,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl Relay {
    pub fn new(
        store: MessageStore,
        api: Arc<dyn ChatApi>,
        socket: Option<Arc<SocketModeListener>>,
    ) -> Self {
        Self {
            ingestor: Arc::new(Ingestor::new(Normalizer::new(), store.clone())),
            sender: Sender::new(api, store.clone()),
            store,
            socket,
            started: AtomicBool::new(false),
            tasks: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// None when Socket Mode is not configured.
    pub fn socket_state(&self) -> Option<ConnectionState> {
        self.socket.as_ref().map(|s| s.state())
    }

    /// Start background ingestion. Calling it again is a no-op.
    pub async fn initialize(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(socket) = self.socket.clone() else {
            log::info!("socket mode not configured; relying on the events webhook");
            return;
        };

        let (events_tx, mut events_rx) = mpsc::channel::<InboundEvent>(SOCKET_QUEUE_CAPACITY);
        let ingestor = self.ingestor.clone();
        let processor = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                ingestor.ingest(event, Transport::Socket).await;
            }
            log::debug!("socket event processor finished");
        });
        let listener = socket.start(events_tx);

        let mut tasks = self.tasks.write().await;
        tasks.push(listener);
        tasks.push(processor);
    }

    /// Stop the listener, drain events it already delivered, then close the store.
    pub async fn shutdown(&self) {
        if let Some(socket) = &self.socket {
            socket.stop();
        }
        // Listener first: its exit drops the queue sender, which lets the processor finish.
        let handles = {
            let mut g = self.tasks.write().await;
            std::mem::take(&mut *g)
        };
        for h in handles {
            let _ = h.await;
        }
        self.store.close().await;
        log::info!("relay stopped");
    }
}

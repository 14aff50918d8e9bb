//! Priority event bus.
//!
//! Publish/subscribe over a list-based broker with one FIFO queue per
//! (topic, priority). The dispatch loop drains strictly by priority: for a
//! given topic, nothing below CRITICAL is considered until every CRITICAL
//! message is gone, and so on down to LOW. Publishers enqueue and return;
//! subscriber slowness never blocks them.
//!
//! The bus is an explicitly constructed instance injected into components
//! at startup. Tests build a fresh one per test.

use guardian_common::{GuardianError, Message, Priority, Protocol};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause between dispatch iterations that delivered nothing.
const IDLE_DELAY: Duration = Duration::from_millis(50);

/// Handle returned by `subscribe`, used to unsubscribe.
pub type SubscriptionId = u64;

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// The queue layer. Owns every message between publish and delivery;
/// consumers never touch the queues directly.
struct Broker {
    queues: StdMutex<HashMap<(String, Priority), VecDeque<String>>>,
}

impl Broker {
    fn new() -> Self {
        Self {
            queues: StdMutex::new(HashMap::new()),
        }
    }

    /// Push a serialized message. Returns true once the queue holds it.
    fn push(&self, topic: &str, priority: Priority, payload: String) -> bool {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry((topic.to_string(), priority))
            .or_default()
            .push_back(payload);
        true
    }

    fn pop(&self, topic: &str, priority: Priority) -> Option<String> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .get_mut(&(topic.to_string(), priority))
            .and_then(|q| q.pop_front())
    }

    fn topics(&self) -> Vec<String> {
        let queues = self.queues.lock().unwrap();
        let mut topics: Vec<String> = queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|((topic, _), _)| topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    fn depth(&self) -> usize {
        self.queues.lock().unwrap().values().map(|q| q.len()).sum()
    }
}

pub struct EventBus {
    broker: Broker,
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            broker: Broker::new(),
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(false)),
            handle: StdMutex::new(None),
        }
    }

    /// Route a message by protocol and enqueue it. Returns true once the
    /// broker acknowledged the push.
    pub fn publish(&self, message: &Message) -> Result<bool, GuardianError> {
        match message.protocol {
            Protocol::Classical => {
                let payload = serde_json::to_string(message)?;
                let accepted = self.broker.push(&message.topic, message.priority, payload);
                debug!(
                    "Published {:?} message on {} (queue depth {})",
                    message.priority,
                    message.topic,
                    self.broker.depth()
                );
                Ok(accepted)
            }
        }
    }

    /// Register an async handler for a topic. Handlers run in registration
    /// order for every delivered message.
    pub async fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handler: Handler = Arc::new(move |msg| Box::pin(handler(msg)));
        self.handlers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a handler. Returns false when the id was not registered.
    pub async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().await;
        match handlers.get_mut(topic) {
            Some(list) => {
                let before = list.len();
                list.retain(|(sub_id, _)| *sub_id != id);
                before != list.len()
            }
            None => false,
        }
    }

    /// Spawn the dispatch loop. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Event bus dispatch loop already running");
            return;
        }
        let bus = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("Event bus dispatch loop started");
            while bus.running.load(Ordering::SeqCst) {
                let delivered = bus.dispatch_once().await;
                if delivered == 0 {
                    tokio::time::sleep(IDLE_DELAY).await;
                }
            }
            info!("Event bus dispatch loop stopped");
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Stop the dispatch loop and wait for it to exit.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(IDLE_DELAY * 4, handle).await.is_err() {
                warn!("Event bus dispatch loop did not stop in time");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One dispatch iteration: for each topic with queued messages, pop one
    /// message from its highest non-empty priority and hand it to every
    /// handler sequentially. Returns how many messages were delivered.
    ///
    /// A handler failure is logged and does not keep the remaining handlers
    /// from seeing the same message.
    pub async fn dispatch_once(&self) -> usize {
        let mut delivered = 0;
        for topic in self.broker.topics() {
            let popped = Priority::descending()
                .iter()
                .find_map(|priority| self.broker.pop(&topic, *priority));
            let Some(payload) = popped else { continue };

            let message: Message = match serde_json::from_str(&payload) {
                Ok(message) => message,
                Err(e) => {
                    error!("Dropping undecodable message on {}: {}", topic, e);
                    continue;
                }
            };

            let handlers: Vec<Handler> = {
                let registered = self.handlers.read().await;
                registered
                    .get(&topic)
                    .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                    .unwrap_or_default()
            };

            if handlers.is_empty() {
                debug!("No handlers for {}, message {} discarded", topic, message.id);
            }
            for handler in handlers {
                if let Err(e) = handler(message.clone()).await {
                    error!("Handler failed for message {} on {}: {:#}", message.id, topic, e);
                }
            }
            delivered += 1;
        }
        delivered
    }

    /// Messages currently queued across all topics and priorities.
    pub fn queued(&self) -> usize {
        self.broker.depth()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

//! Bridge from new-message pushes to the chat read-model.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::HubConfig;
use crate::dispatcher::EventDispatcher;
use crate::event::HubEvent;
use crate::lock::lock;
use crate::protocol::{ChatMessage, ConversationId, NewMessageData, UserId};

/// The chat read-model the bridge keeps fresh.
///
/// Calls are made from the hub's processing task; implementations that need
/// to fetch over the network should spawn rather than block.
pub trait ConversationStore: Send + Sync {
    /// Drop the cached message list of `conversation_id` so the next read
    /// refetches it.
    fn invalidate_messages(&self, conversation_id: &str);

    /// Update the conversation's summary (last message, ordering) with
    /// `latest`.
    fn refresh_summary(&self, conversation_id: &str, latest: &ChatMessage);
}

#[derive(Default)]
struct BridgeState {
    viewing: Option<ConversationId>,
    loaded: HashSet<ConversationId>,
    unread: HashMap<ConversationId, u32>,
}

impl BridgeState {
    fn is_visible(&self, conversation_id: &str) -> bool {
        self.viewing.as_deref() == Some(conversation_id) || self.loaded.contains(conversation_id)
    }

    /// Zero the counter, returning whether it was non-zero.
    fn clear_unread(&mut self, conversation_id: &str) -> bool {
        self.unread.remove(conversation_id).is_some_and(|n| n > 0)
    }
}

enum Route {
    Refresh,
    Unread(u32),
    Skip,
}

struct Inner {
    state: Mutex<BridgeState>,
    store: Arc<dyn ConversationStore>,
    dispatcher: EventDispatcher,
    local_user_id: UserId,
}

/// Routes `NewMessage` pushes either to the read-model (for conversations on
/// screen or loaded) or to per-conversation unread counters.
#[derive(Clone)]
pub struct MessageBridge {
    inner: Arc<Inner>,
}

impl MessageBridge {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        dispatcher: EventDispatcher,
        config: &HubConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BridgeState::default()),
                store,
                dispatcher,
                local_user_id: config.local_user_id.clone(),
            }),
        }
    }

    /// Set the conversation currently on screen. Opening a conversation
    /// marks it loaded and clears its unread counter.
    pub fn set_viewing(&self, conversation_id: Option<ConversationId>) {
        let cleared = {
            let mut state = lock(&self.inner.state);
            let cleared = match &conversation_id {
                Some(id) => {
                    state.loaded.insert(id.clone());
                    state.clear_unread(id).then(|| id.clone())
                }
                None => None,
            };
            state.viewing = conversation_id;
            cleared
        };
        if let Some(conversation_id) = cleared {
            self.emit_unread(conversation_id, 0);
        }
    }

    /// The conversation currently on screen.
    pub fn viewing(&self) -> Option<ConversationId> {
        lock(&self.inner.state).viewing.clone()
    }

    /// Record that the read-model holds the message list of `conversation_id`.
    pub fn mark_loaded(&self, conversation_id: impl Into<ConversationId>) {
        lock(&self.inner.state).loaded.insert(conversation_id.into());
    }

    /// Forget that `conversation_id` is loaded (e.g. evicted from a cache).
    pub fn mark_unloaded(&self, conversation_id: &str) {
        lock(&self.inner.state).loaded.remove(conversation_id);
    }

    /// Clear the unread counter of `conversation_id`.
    pub fn mark_read(&self, conversation_id: &str) {
        let cleared = lock(&self.inner.state).clear_unread(conversation_id);
        if cleared {
            self.emit_unread(conversation_id.to_owned(), 0);
        }
    }

    /// Seed a counter from a server-provided value.
    pub fn set_unread(&self, conversation_id: impl Into<ConversationId>, unread: u32) {
        let conversation_id = conversation_id.into();
        let previous = {
            let mut state = lock(&self.inner.state);
            if unread == 0 {
                state.unread.remove(&conversation_id)
            } else {
                state.unread.insert(conversation_id.clone(), unread)
            }
        };
        if previous.unwrap_or(0) != unread {
            self.emit_unread(conversation_id, unread);
        }
    }

    pub fn unread_count(&self, conversation_id: &str) -> u32 {
        lock(&self.inner.state)
            .unread
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        lock(&self.inner.state)
            .unread
            .values()
            .fold(0u32, |total, n| total.saturating_add(*n))
    }

    pub(crate) fn handle_new_message(&self, data: NewMessageData) {
        let route = {
            let mut state = lock(&self.inner.state);
            if state.is_visible(&data.conversation_id) {
                Route::Refresh
            } else if data.message.sender_id == self.inner.local_user_id {
                Route::Skip
            } else {
                let counter = state.unread.entry(data.conversation_id.clone()).or_insert(0);
                *counter = counter.saturating_add(1);
                Route::Unread(*counter)
            }
        };

        match route {
            Route::Refresh => {
                debug!(conversation_id = %data.conversation_id, "refreshing read-model");
                self.inner.store.invalidate_messages(&data.conversation_id);
                self.inner
                    .store
                    .refresh_summary(&data.conversation_id, &data.message);
                self.inner.dispatcher.emit(&HubEvent::NewMessage(data));
            }
            Route::Unread(unread) => {
                debug!(conversation_id = %data.conversation_id, unread, "message counted as unread");
                self.emit_unread(data.conversation_id, unread);
            }
            Route::Skip => {
                debug!(conversation_id = %data.conversation_id, "own message in background conversation");
            }
        }
    }

    fn emit_unread(&self, conversation_id: ConversationId, unread: u32) {
        self.inner.dispatcher.emit(&HubEvent::UnreadChanged {
            conversation_id,
            unread,
        });
    }
}

impl fmt::Debug for MessageBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("MessageBridge")
            .field("viewing", &state.viewing)
            .field("loaded", &state.loaded.len())
            .field("unread_conversations", &state.unread.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingStore {
        calls: StdMutex<Vec<String>>,
    }

    impl ConversationStore for RecordingStore {
        fn invalidate_messages(&self, conversation_id: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("invalidate:{conversation_id}"));
        }

        fn refresh_summary(&self, conversation_id: &str, latest: &ChatMessage) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("summary:{conversation_id}:{}", latest.id));
        }
    }

    fn message(conversation: &str, id: &str, sender: &str) -> NewMessageData {
        NewMessageData {
            conversation_id: conversation.into(),
            message: ChatMessage {
                id: id.into(),
                sender_id: sender.into(),
                body: None,
                sent_at: None,
            },
        }
    }

    fn bridge() -> (MessageBridge, Arc<RecordingStore>, EventDispatcher) {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = EventDispatcher::new();
        let bridge = MessageBridge::new(
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            dispatcher.clone(),
            &HubConfig::new("me"),
        );
        (bridge, store, dispatcher)
    }

    #[test]
    fn viewed_conversation_refreshes_read_model() {
        let (bridge, store, dispatcher) = bridge();
        let events = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::clone(&events);
        let _sub = dispatcher.on_any(move |e| log.lock().unwrap().push(e.kind()));

        bridge.set_viewing(Some("conv-1".into()));
        bridge.handle_new_message(message("conv-1", "m1", "bob"));

        assert_eq!(
            *store.calls.lock().unwrap(),
            vec!["invalidate:conv-1".to_owned(), "summary:conv-1:m1".to_owned()]
        );
        assert_eq!(*events.lock().unwrap(), vec![EventKind::NewMessage]);
        assert_eq!(bridge.unread_count("conv-1"), 0);
    }

    #[test]
    fn background_conversation_counts_unread() {
        let (bridge, store, dispatcher) = bridge();
        let counts = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::clone(&counts);
        let _sub = dispatcher.on(EventKind::UnreadChanged, move |e| {
            if let HubEvent::UnreadChanged { unread, .. } = e {
                log.lock().unwrap().push(*unread);
            }
        });

        bridge.handle_new_message(message("conv-2", "m1", "bob"));
        bridge.handle_new_message(message("conv-2", "m2", "bob"));
        bridge.handle_new_message(message("conv-3", "m3", "carol"));

        assert!(store.calls.lock().unwrap().is_empty());
        assert_eq!(bridge.unread_count("conv-2"), 2);
        assert_eq!(bridge.total_unread(), 3);
        assert_eq!(*counts.lock().unwrap(), vec![1, 2, 1]);
    }

    #[test]
    fn loaded_conversation_is_refreshed_even_when_not_viewed() {
        let (bridge, store, _dispatcher) = bridge();
        bridge.mark_loaded("conv-4");
        bridge.handle_new_message(message("conv-4", "m1", "bob"));
        assert_eq!(store.calls.lock().unwrap().len(), 2);

        bridge.mark_unloaded("conv-4");
        bridge.handle_new_message(message("conv-4", "m2", "bob"));
        assert_eq!(bridge.unread_count("conv-4"), 1);
    }

    #[test]
    fn own_messages_are_not_unread() {
        let (bridge, _store, _dispatcher) = bridge();
        bridge.handle_new_message(message("conv-5", "m1", "me"));
        assert_eq!(bridge.total_unread(), 0);
    }

    #[test]
    fn opening_a_conversation_clears_its_counter() {
        let (bridge, _store, dispatcher) = bridge();
        bridge.handle_new_message(message("conv-6", "m1", "bob"));

        let cleared = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::clone(&cleared);
        let _sub = dispatcher.on(EventKind::UnreadChanged, move |e| {
            log.lock().unwrap().push(e.clone());
        });

        bridge.set_viewing(Some("conv-6".into()));
        assert_eq!(bridge.unread_count("conv-6"), 0);
        assert_eq!(
            *cleared.lock().unwrap(),
            vec![HubEvent::UnreadChanged {
                conversation_id: "conv-6".into(),
                unread: 0,
            }]
        );

        // Already zero: no second event.
        bridge.mark_read("conv-6");
        assert_eq!(cleared.lock().unwrap().len(), 1);
    }

    #[test]
    fn set_unread_only_emits_on_change() {
        let (bridge, _store, dispatcher) = bridge();
        let hits = Arc::new(StdMutex::new(0));
        let counter = Arc::clone(&hits);
        let _sub = dispatcher.on(EventKind::UnreadChanged, move |_| {
            *counter.lock().unwrap() += 1;
        });

        bridge.set_unread("conv-7", 4);
        bridge.set_unread("conv-7", 4);
        bridge.set_unread("conv-7", 0);
        assert_eq!(*hits.lock().unwrap(), 2);
        assert_eq!(bridge.unread_count("conv-7"), 0);
    }
}

//! Session registry: one provider conversation per mail thread.
//!
//! Each thread id maps to the continuation token of its last provider
//! response. The first turn of a thread sends the system preamble; later
//! turns send only the new text and the token, and the provider replays the
//! history itself.
//!
//! The registry is a bounded cache. Entries idle past the timeout are
//! dropped, and when full the least recently used idle entry is evicted.
//! A dropped thread simply starts a fresh conversation on its next message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::agent::settings::ConfigHandle;
use crate::error::LlmError;
use crate::llm::{ChatMessage, ChatProvider, ChatTurn};

/// Tokens charged when the provider does not report usage.
pub const FALLBACK_TOKENS: u64 = 1000;

type Slot = Arc<tokio::sync::Mutex<Option<String>>>;

struct Entry {
    slot: Slot,
    last_used: Instant,
}

impl Entry {
    /// Someone other than the map holds the slot.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.slot) > 1
    }
}

/// Reply text and tokens used for one conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutput {
    pub text: String,
    pub tokens: u64,
}

pub struct SessionRegistry {
    provider: Arc<dyn ChatProvider>,
    config: ConfigHandle,
    system_prompt: String,
    capacity: usize,
    idle_timeout: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl SessionRegistry {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        config: ConfigHandle,
        system_prompt: impl Into<String>,
        capacity: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            config,
            system_prompt: system_prompt.into(),
            capacity: capacity.max(1),
            idle_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Send `text` on the conversation for `thread_id`.
    ///
    /// Turns on one thread run one at a time: the slot lock is held across
    /// the provider call and the token update.
    pub async fn continue_conversation(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<TurnOutput, LlmError> {
        let slot = self.slot(thread_id);
        let mut token = slot.lock().await;

        let model = self.config.snapshot().await.model.as_str().to_string();
        let input = match token.as_ref() {
            Some(_) => vec![ChatMessage::user(text)],
            None => vec![ChatMessage::system(&self.system_prompt), ChatMessage::user(text)],
        };

        let completion = self
            .provider
            .complete(ChatTurn {
                model,
                previous_response_id: token.clone(),
                input,
            })
            .await?;

        if let Some(id) = completion.response_id {
            *token = Some(id);
        }
        debug!(thread = %thread_id, continued = token.is_some(), "Conversation turn complete");

        Ok(TurnOutput {
            text: completion.content,
            tokens: completion.total_tokens.unwrap_or(FALLBACK_TOKENS),
        })
    }

    /// Number of conversations currently remembered.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch or create the slot for a thread, expiring and evicting first.
    fn slot(&self, thread_id: &str) -> Slot {
        let now = Instant::now();
        let mut entries = self.entries();

        let timeout = self.idle_timeout;
        entries.retain(|_, e| e.in_use() || now.duration_since(e.last_used) <= timeout);

        if let Some(entry) = entries.get_mut(thread_id) {
            entry.last_used = now;
            return Arc::clone(&entry.slot);
        }

        while entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .filter(|(_, e)| !e.in_use())
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                    debug!(thread = %key, "Evicted conversation");
                }
                // Every entry has a turn in flight; go over capacity briefly.
                None => break,
            }
        }

        let slot: Slot = Arc::new(tokio::sync::Mutex::new(None));
        entries.insert(
            thread_id.to_string(),
            Entry {
                slot: Arc::clone(&slot),
                last_used: now,
            },
        );
        slot
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::agent::settings::{ChatModel, ConfigValue};
    use crate::llm::{ChatCompletion, Role};
    use crate::store::{Database, LibSqlBackend};

    /// Records every turn and answers with `resp_<n>`.
    #[derive(Default)]
    struct RecordingProvider {
        turns: Mutex<Vec<ChatTurn>>,
        counter: AtomicUsize,
        report_usage: bool,
    }

    #[async_trait]
    impl ChatProvider for RecordingProvider {
        fn name(&self) -> &str {
            "recording"
        }

        async fn complete(&self, turn: ChatTurn) -> Result<ChatCompletion, LlmError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            self.turns.lock().unwrap().push(turn);
            Ok(ChatCompletion {
                content: format!("reply {n}"),
                response_id: Some(format!("resp_{n}")),
                total_tokens: self.report_usage.then_some(10 * n as u64),
            })
        }
    }

    impl RecordingProvider {
        fn turns(&self) -> Vec<ChatTurn> {
            self.turns.lock().unwrap().clone()
        }
    }

    async fn registry(
        provider: Arc<RecordingProvider>,
        capacity: usize,
        idle: Duration,
    ) -> (SessionRegistry, ConfigHandle) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = ConfigHandle::load(store).await.unwrap();
        let registry = SessionRegistry::new(provider, config.clone(), "be a frog", capacity, idle);
        (registry, config)
    }

    fn usage_provider() -> Arc<RecordingProvider> {
        Arc::new(RecordingProvider {
            report_usage: true,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn first_turn_sends_preamble_and_no_token() {
        let provider = usage_provider();
        let (registry, _) = registry(Arc::clone(&provider), 10, Duration::from_secs(60)).await;

        let out = registry.continue_conversation("t1", "hello").await.unwrap();
        assert_eq!(out, TurnOutput { text: "reply 1".into(), tokens: 10 });

        let turns = provider.turns();
        assert_eq!(turns[0].previous_response_id, None);
        assert_eq!(turns[0].input.len(), 2);
        assert_eq!(turns[0].input[0].role, Role::System);
        assert_eq!(turns[0].input[0].content, "be a frog");
        assert_eq!(turns[0].input[1].content, "hello");
    }

    #[tokio::test]
    async fn second_turn_reuses_continuation_token() {
        let provider = usage_provider();
        let (registry, _) = registry(Arc::clone(&provider), 10, Duration::from_secs(60)).await;

        registry.continue_conversation("t1", "hello").await.unwrap();
        registry.continue_conversation("t1", "again").await.unwrap();
        registry.continue_conversation("t1", "third").await.unwrap();

        let turns = provider.turns();
        assert_eq!(turns[1].previous_response_id.as_deref(), Some("resp_1"));
        assert_eq!(turns[1].input, vec![ChatMessage::user("again")]);
        assert_eq!(turns[2].previous_response_id.as_deref(), Some("resp_2"));
    }

    #[tokio::test]
    async fn threads_are_independent() {
        let provider = usage_provider();
        let (registry, _) = registry(Arc::clone(&provider), 10, Duration::from_secs(60)).await;

        registry.continue_conversation("a", "hi").await.unwrap();
        registry.continue_conversation("b", "hi").await.unwrap();

        let turns = provider.turns();
        assert_eq!(turns[1].previous_response_id, None);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn missing_usage_falls_back() {
        let provider = Arc::new(RecordingProvider::default());
        let (registry, _) = registry(provider, 10, Duration::from_secs(60)).await;
        let out = registry.continue_conversation("t", "hi").await.unwrap();
        assert_eq!(out.tokens, FALLBACK_TOKENS);
    }

    #[tokio::test]
    async fn model_is_read_at_call_time() {
        let provider = usage_provider();
        let (registry, config) = registry(Arc::clone(&provider), 10, Duration::from_secs(60)).await;

        registry.continue_conversation("t", "hi").await.unwrap();
        config
            .update(|c| c.apply(ConfigValue::Model(ChatModel::Gpt35Turbo)))
            .await
            .unwrap();
        registry.continue_conversation("t", "hi").await.unwrap();

        let turns = provider.turns();
        assert_eq!(turns[0].model, "gpt-4.1");
        assert_eq!(turns[1].model, "gpt-3.5-turbo");
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let provider = usage_provider();
        let (registry, _) = registry(Arc::clone(&provider), 2, Duration::from_secs(60)).await;

        registry.continue_conversation("a", "1").await.unwrap();
        registry.continue_conversation("b", "2").await.unwrap();
        // Touch "a" so "b" becomes the oldest.
        registry.continue_conversation("a", "3").await.unwrap();
        registry.continue_conversation("c", "4").await.unwrap();
        assert_eq!(registry.len(), 2);

        registry.continue_conversation("a", "5").await.unwrap();
        registry.continue_conversation("b", "6").await.unwrap();

        let turns = provider.turns();
        assert!(turns[4].previous_response_id.is_some(), "a kept its token");
        assert_eq!(turns[5].previous_response_id, None, "b was evicted");
    }

    #[tokio::test]
    async fn idle_entries_expire() {
        let provider = usage_provider();
        let (registry, _) = registry(Arc::clone(&provider), 10, Duration::from_millis(20)).await;

        registry.continue_conversation("t", "hi").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.continue_conversation("t", "again").await.unwrap();

        let turns = provider.turns();
        assert_eq!(turns[1].previous_response_id, None);
        assert_eq!(turns[1].input.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_thread_are_serialized() {
        let provider = usage_provider();
        let (registry, _) = registry(Arc::clone(&provider), 10, Duration::from_secs(60)).await;
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for i in 0..5 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.continue_conversation("t", &format!("msg {i}")).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        // Exactly one turn started fresh; each other turn continued a
        // distinct earlier response.
        let turns = provider.turns();
        let fresh = turns.iter().filter(|t| t.previous_response_id.is_none()).count();
        assert_eq!(fresh, 1);
        let mut prev: Vec<String> = turns.iter().filter_map(|t| t.previous_response_id.clone()).collect();
        prev.sort();
        prev.dedup();
        assert_eq!(prev.len(), 4);
    }
}

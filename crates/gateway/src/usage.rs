//! Per-credential, per-model and global usage accounting.
//!
//! The global aggregate is plain atomics. The two indexed maps sit behind a
//! single reader-writer lock; existing entries are updated through atomic
//! arithmetic on the read side, only first-time insertion takes the write
//! side.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::Serialize;

use crate::messages::openai::ChatCompletionRequest;

/// Flat token cost charged per image part when estimating input size.
const TOKENS_PER_IMAGE: u64 = 300;

#[derive(Debug, Default)]
struct Counters {
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    requests: AtomicU64,
}

impl Counters {
    fn add(&self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens.fetch_add(input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(output_tokens, Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time value of one counter aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub requests: u64,
}

/// Structural snapshot returned by [`UsageAccountant::summary`].
#[derive(Debug, Serialize)]
pub struct UsageSummary {
    pub global: CounterSnapshot,
    pub by_credential: BTreeMap<String, CounterSnapshot>,
    pub by_model: BTreeMap<String, CounterSnapshot>,
}

/// Process-resident usage counters.
#[derive(Debug, Default)]
pub struct UsageAccountant {
    global: Counters,
    by_credential: RwLock<HashMap<String, Arc<Counters>>>,
    by_model: RwLock<HashMap<String, Arc<Counters>>>,
}

impl UsageAccountant {
    /// Add one request's token counts to the global, per-credential and
    /// per-model aggregates. Missing aggregates are created at zero first.
    pub fn record(&self, credential_id: &str, model: &str, input_tokens: u64, output_tokens: u64) {
        self.global.add(input_tokens, output_tokens);
        Self::entry(&self.by_credential, credential_id).add(input_tokens, output_tokens);
        Self::entry(&self.by_model, model).add(input_tokens, output_tokens);
    }

    fn entry(map: &RwLock<HashMap<String, Arc<Counters>>>, key: &str) -> Arc<Counters> {
        {
            let map = map.read().unwrap_or_else(PoisonError::into_inner);

            if let Some(counters) = map.get(key) {
                return counters.clone();
            }
        }

        // Double-checked creation: another writer may have inserted the key
        // between the read and this write.
        map.write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Snapshot of the global aggregate and both indexed maps.
    pub fn summary(&self) -> UsageSummary {
        let snapshot = |map: &RwLock<HashMap<String, Arc<Counters>>>| {
            map.read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(key, counters)| (key.clone(), counters.snapshot()))
                .collect()
        };

        UsageSummary {
            global: self.global.snapshot(),
            by_credential: snapshot(&self.by_credential),
            by_model: snapshot(&self.by_model),
        }
    }

    /// Approximate the input token count of a prompt: a quarter of the text
    /// byte length plus a flat per-image cost, never less than one.
    pub fn estimate_input_tokens(text: &str, image_count: u64) -> u64 {
        (text.len() as u64 / 4 + TOKENS_PER_IMAGE * image_count).max(1)
    }

    /// Estimate the input tokens of a whole chat request.
    pub(crate) fn estimate_request_input_tokens(request: &ChatCompletionRequest) -> u64 {
        let mut text = String::new();
        let mut image_count = 0;

        for message in &request.messages {
            if let Some(content) = &message.content {
                text.push_str(&content.flatten());
                image_count += content.image_count();
            }
        }

        Self::estimate_input_tokens(&text, image_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_equals_the_sum_of_both_partitions() {
        let accountant = UsageAccountant::default();

        accountant.record("cred_001", "gemini-2.5-flash", 100, 10);
        accountant.record("cred_002", "gemini-2.5-flash", 50, 5);
        accountant.record("cred_001", "gemini-2.5-pro", 25, 0);

        let summary = accountant.summary();

        let fields: [fn(&CounterSnapshot) -> u64; 3] = [
            |counters| counters.input_tokens,
            |counters| counters.output_tokens,
            |counters| counters.requests,
        ];

        for field in fields {
            let by_credential: u64 = summary.by_credential.values().map(field).sum();
            let by_model: u64 = summary.by_model.values().map(field).sum();

            assert_eq!(field(&summary.global), by_credential);
            assert_eq!(field(&summary.global), by_model);
        }

        assert_eq!(summary.global.input_tokens, 175);
        assert_eq!(summary.global.output_tokens, 15);
        assert_eq!(summary.global.requests, 3);
    }

    #[test]
    fn aggregates_are_created_lazily() {
        let accountant = UsageAccountant::default();
        assert!(accountant.summary().by_credential.is_empty());

        accountant.record("cred_001", "gemini-2.5-flash", 1, 1);

        let summary = accountant.summary();
        assert_eq!(summary.by_credential.len(), 1);
        assert_eq!(summary.by_model.len(), 1);
        assert_eq!(summary.by_credential["cred_001"].requests, 1);
    }

    #[test]
    fn estimator_floors_at_one_token() {
        assert_eq!(UsageAccountant::estimate_input_tokens("", 0), 1);
        assert_eq!(UsageAccountant::estimate_input_tokens("abc", 0), 1);
        assert_eq!(UsageAccountant::estimate_input_tokens("hello", 0), 1);
        assert_eq!(UsageAccountant::estimate_input_tokens("12345678", 0), 2);
        assert_eq!(UsageAccountant::estimate_input_tokens("", 2), 600);
        assert_eq!(UsageAccountant::estimate_input_tokens("12345678", 1), 302);
    }
}

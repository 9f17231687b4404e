//! Running token and cost totals shared by every completing task.
//!
//! Totals are kept as integer token counts behind a single mutex; cost is
//! derived from those totals when a snapshot is taken, so the result does not
//! depend on the order in which tasks complete.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::scoring::Usage;

/// Prices per million tokens. Reasoning tokens are billed as output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_million: 0.15,
            output_per_million: 1.50,
        }
    }
}

impl Pricing {
    pub fn input_cost(&self, prompt_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1_000_000.0 * self.input_per_million
    }

    pub fn output_cost(&self, output_tokens: u64) -> f64 {
        output_tokens as f64 / 1_000_000.0 * self.output_per_million
    }

    /// Cost of a single call.
    pub fn cost_of(&self, usage: &Usage) -> f64 {
        self.input_cost(usage.prompt_tokens)
            + self.output_cost(usage.completion_tokens + usage.reasoning_tokens())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Totals {
    prompt_tokens: u64,
    completion_tokens: u64,
    reasoning_tokens: u64,
    total_tokens: u64,
    succeeded: u64,
    failed: u64,
}

/// Point-in-time copy of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub reasoning_tokens: u64,
    pub total_tokens: u64,
    pub succeeded_requests: u64,
    pub failed_requests: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

impl LedgerSnapshot {
    pub fn total_output_tokens(&self) -> u64 {
        self.completion_tokens + self.reasoning_tokens
    }

    pub fn total_requests(&self) -> u64 {
        self.succeeded_requests + self.failed_requests
    }
}

#[derive(Debug, Default)]
pub struct CostLedger {
    pricing: Pricing,
    totals: Mutex<Totals>,
}

impl CostLedger {
    pub fn new(pricing: Pricing) -> Self {
        Self {
            pricing,
            totals: Mutex::new(Totals::default()),
        }
    }

    pub fn pricing(&self) -> Pricing {
        self.pricing
    }

    /// Merge the usage of one succeeded task.
    pub fn add(&self, usage: &Usage) {
        let total = if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.prompt_tokens + usage.completion_tokens
        };
        let mut t = self.totals.lock();
        t.prompt_tokens += usage.prompt_tokens;
        t.completion_tokens += usage.completion_tokens;
        t.reasoning_tokens += usage.reasoning_tokens();
        t.total_tokens += total;
        t.succeeded += 1;
    }

    /// Count a task that ended in `Failed`.
    pub fn note_failure(&self) {
        self.totals.lock().failed += 1;
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let t = *self.totals.lock();
        let input_cost = self.pricing.input_cost(t.prompt_tokens);
        let output_cost = self
            .pricing
            .output_cost(t.completion_tokens + t.reasoning_tokens);
        LedgerSnapshot {
            prompt_tokens: t.prompt_tokens,
            completion_tokens: t.completion_tokens,
            reasoning_tokens: t.reasoning_tokens,
            total_tokens: t.total_tokens,
            succeeded_requests: t.succeeded,
            failed_requests: t.failed,
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::types::CompletionTokensDetails;
    use rand::Rng;
    use rand::seq::SliceRandom;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn pricing_bills_reasoning_as_output() {
        let pricing = Pricing {
            input_per_million: 1.0,
            output_per_million: 10.0,
        };
        let usage = Usage {
            prompt_tokens: 1_000_000,
            completion_tokens: 500_000,
            total_tokens: 1_500_000,
            completion_tokens_details: Some(CompletionTokensDetails {
                reasoning_tokens: 500_000,
            }),
        };
        assert_eq!(pricing.cost_of(&usage), 11.0);
    }

    #[test]
    fn snapshot_reflects_adds_and_failures() {
        let ledger = CostLedger::new(Pricing::default());
        ledger.add(&Usage::new(1_000_000, 0));
        ledger.add(&Usage::new(0, 1_000_000));
        ledger.note_failure();

        let snap = ledger.snapshot();
        assert_eq!(snap.prompt_tokens, 1_000_000);
        assert_eq!(snap.completion_tokens, 1_000_000);
        assert_eq!(snap.total_tokens, 2_000_000);
        assert_eq!(snap.succeeded_requests, 2);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.total_requests(), 3);
        assert!((snap.input_cost - 0.15).abs() < 1e-12);
        assert!((snap.output_cost - 1.50).abs() < 1e-12);
        assert!((snap.total_cost - 1.65).abs() < 1e-12);
    }

    #[test]
    fn total_tokens_fall_back_to_sum() {
        let ledger = CostLedger::default();
        ledger.add(&Usage {
            prompt_tokens: 7,
            completion_tokens: 3,
            total_tokens: 0,
            completion_tokens_details: None,
        });
        assert_eq!(ledger.snapshot().total_tokens, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn totals_match_sum_under_random_concurrent_order() {
        let mut rng = rand::thread_rng();
        let mut usages: Vec<Usage> = (0..500)
            .map(|_| Usage {
                prompt_tokens: rng.gen_range(0..5_000),
                completion_tokens: rng.gen_range(0..2_000),
                total_tokens: 0,
                completion_tokens_details: Some(CompletionTokensDetails {
                    reasoning_tokens: rng.gen_range(0..500),
                }),
            })
            .collect();
        usages.shuffle(&mut rng);

        let expected_prompt: u64 = usages.iter().map(|u| u.prompt_tokens).sum();
        let expected_completion: u64 = usages.iter().map(|u| u.completion_tokens).sum();
        let expected_reasoning: u64 = usages.iter().map(|u| u.reasoning_tokens()).sum();

        let ledger = Arc::new(CostLedger::new(Pricing::default()));
        let mut handles = Vec::new();
        for usage in usages {
            let ledger = Arc::clone(&ledger);
            let delay = rng.gen_range(0..3);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                ledger.add(&usage);
                // Concurrent readers must never see a torn snapshot.
                let snap = ledger.snapshot();
                assert_eq!(
                    snap.total_tokens,
                    snap.prompt_tokens + snap.completion_tokens
                );
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let snap = ledger.snapshot();
        assert_eq!(snap.prompt_tokens, expected_prompt);
        assert_eq!(snap.completion_tokens, expected_completion);
        assert_eq!(snap.reasoning_tokens, expected_reasoning);
        assert_eq!(snap.succeeded_requests, 500);

        let reference = CostLedger::new(Pricing::default());
        reference.add(&Usage {
            prompt_tokens: expected_prompt,
            completion_tokens: expected_completion,
            total_tokens: 0,
            completion_tokens_details: Some(CompletionTokensDetails {
                reasoning_tokens: expected_reasoning,
            }),
        });
        assert_eq!(snap.total_cost, reference.snapshot().total_cost);
    }
}

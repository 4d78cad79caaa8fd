//! Local/Remote Generation Routing Policy
//!
//! # Overview
//!
//! Decides whether a generation request should run on the local engine or
//! be forwarded to a remote service. The policy is pure: it inspects the
//! request against the model's context size and returns a route. The
//! remote client itself lives outside the engine; the core only ever
//! executes the local path.
//!
//! Routing rule: a request goes remote when the prompt exceeds
//! `0.8 × context_size` or the requested token budget exceeds
//! `0.5 × context_size`.

use serde::Serialize;

/// Where a generation request should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GenerationRoute {
    Local,
    Remote,
}

/// Routing thresholds relative to the model context
#[derive(Debug, Clone, Copy)]
pub struct HybridPolicy {
    context_size: usize,
    prompt_ratio: f32,
    max_tokens_ratio: f32,
}

impl HybridPolicy {
    /// Policy with the standard thresholds (0.8 / 0.5)
    pub fn new(context_size: usize) -> Self {
        Self {
            context_size,
            prompt_ratio: 0.8,
            max_tokens_ratio: 0.5,
        }
    }

    /// Override the thresholds
    pub fn with_ratios(mut self, prompt_ratio: f32, max_tokens_ratio: f32) -> Self {
        self.prompt_ratio = prompt_ratio;
        self.max_tokens_ratio = max_tokens_ratio;
        self
    }

    /// Route a request
    pub fn decide(&self, prompt_len: usize, max_tokens: usize) -> GenerationRoute {
        let prompt_limit = (self.context_size as f32 * self.prompt_ratio) as usize;
        let tokens_limit = (self.context_size as f32 * self.max_tokens_ratio) as usize;
        if prompt_len > prompt_limit || max_tokens > tokens_limit {
            GenerationRoute::Remote
        } else {
            GenerationRoute::Local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_requests_stay_local() {
        let policy = HybridPolicy::new(100);
        assert_eq!(policy.decide(10, 20), GenerationRoute::Local);
        assert_eq!(policy.decide(80, 50), GenerationRoute::Local);
    }

    #[test]
    fn test_long_prompt_goes_remote() {
        let policy = HybridPolicy::new(100);
        assert_eq!(policy.decide(81, 10), GenerationRoute::Remote);
    }

    #[test]
    fn test_large_token_budget_goes_remote() {
        let policy = HybridPolicy::new(100);
        assert_eq!(policy.decide(10, 51), GenerationRoute::Remote);
    }

    #[test]
    fn test_custom_ratios() {
        let policy = HybridPolicy::new(100).with_ratios(0.5, 0.25);
        assert_eq!(policy.decide(51, 0), GenerationRoute::Remote);
        assert_eq!(policy.decide(50, 25), GenerationRoute::Local);
    }
}

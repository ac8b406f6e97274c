// Copyright 2024, The Tremor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::Message;
use std::time::Duration;

/// When to flush a batch. A zero value disables the respective threshold,
/// if all of them are zero every message is a batch of its own.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BatchPolicy {
    /// flush after this many messages
    #[serde(default)]
    pub count: usize,
    /// flush once the payloads reach this many bytes
    #[serde(default)]
    pub byte_size: usize,
    /// flush a non empty batch after this many milliseconds
    #[serde(default)]
    pub period_ms: u64,
}

impl BatchPolicy {
    /// a policy that turns every message into its own batch
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.count == 0 && self.byte_size == 0 && self.period_ms == 0
    }

    /// the flush period, if any
    #[must_use]
    pub fn period(&self) -> Option<Duration> {
        (self.period_ms > 0).then(|| Duration::from_millis(self.period_ms))
    }
}

/// Collects messages according to a [`BatchPolicy`]
#[derive(Debug)]
pub struct Batcher {
    policy: BatchPolicy,
    messages: Vec<Message>,
    bytes: usize,
}

impl Batcher {
    /// creates an empty batcher
    #[must_use]
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            messages: Vec::with_capacity(policy.count),
            policy,
            bytes: 0,
        }
    }

    /// the policy in use
    #[must_use]
    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    /// adds a message, returns `true` if the batch is ready to be flushed
    pub fn add(&mut self, message: Message) -> bool {
        self.bytes += message.size();
        self.messages.push(message);
        self.is_full()
    }

    fn is_full(&self) -> bool {
        self.policy.is_noop()
            || (self.policy.count > 0 && self.messages.len() >= self.policy.count)
            || (self.policy.byte_size > 0 && self.bytes >= self.policy.byte_size)
    }

    /// takes the collected messages, `None` if there are none
    pub fn flush(&mut self) -> Option<Vec<Message>> {
        if self.messages.is_empty() {
            return None;
        }
        self.bytes = 0;
        Some(std::mem::replace(
            &mut self.messages,
            Vec::with_capacity(self.policy.count),
        ))
    }

    /// number of collected messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// true if there is nothing to flush
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

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

//! The contract between a batch output and whatever feeds it.
//!
//! An output is registered under a name through an [`OutputBuilder`], built
//! from a raw configuration value and afterwards driven through the
//! [`BatchOutput`] lifecycle: `connect`, any number of concurrent
//! `write_batch` calls and finally `close`.

/// batching policies
pub mod batcher;

pub use batcher::{BatchPolicy, Batcher};

use crate::{
    config,
    errors::{Error, Result},
};
use simd_json::OwnedValue;
use std::{borrow::Cow, collections::BTreeMap, collections::HashMap, fmt, sync::Arc};

/// The payload carried by a message
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// raw bytes as read from the input
    Raw(Vec<u8>),
    /// an already decoded value, serialized as JSON on demand
    Structured(OwnedValue),
}

/// A single message of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: Payload,
}

impl Message {
    /// creates a message from raw bytes
    #[must_use]
    pub fn new<B: Into<Vec<u8>>>(bytes: B) -> Self {
        Self {
            payload: Payload::Raw(bytes.into()),
        }
    }

    /// creates a message from a structured value
    #[must_use]
    pub fn structured(value: OwnedValue) -> Self {
        Self {
            payload: Payload::Structured(value),
        }
    }

    /// the payload of this message
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The raw bytes of this message
    ///
    /// # Errors
    /// if a structured payload can't be serialized
    pub fn as_bytes(&self) -> anyhow::Result<Cow<'_, [u8]>> {
        match &self.payload {
            Payload::Raw(bytes) => Ok(Cow::Borrowed(bytes.as_slice())),
            Payload::Structured(value) => Ok(Cow::Owned(simd_json::to_vec(value)?)),
        }
    }

    /// size of the payload in bytes, used for byte size based batching
    #[must_use]
    pub fn size(&self) -> usize {
        match &self.payload {
            Payload::Raw(bytes) => bytes.len(),
            Payload::Structured(_) => self.as_bytes().map_or(0, |b| b.len()),
        }
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<OwnedValue> for Message {
    fn from(value: OwnedValue) -> Self {
        Self::structured(value)
    }
}

/// Per message failures of a batch
///
/// A batch error doesn't mean nothing was written: messages that are not
/// listed here were delivered.
#[derive(Debug)]
pub struct BatchError {
    batch_len: usize,
    failed: BTreeMap<usize, anyhow::Error>,
}

impl BatchError {
    /// creates an empty batch error for a batch of `batch_len` messages
    #[must_use]
    pub fn new(batch_len: usize) -> Self {
        Self {
            batch_len,
            failed: BTreeMap::new(),
        }
    }

    /// marks the message at `idx` as failed
    pub fn failed<E: Into<anyhow::Error>>(&mut self, idx: usize, err: E) {
        self.failed.insert(idx, err.into());
    }

    /// number of failed messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.failed.len()
    }

    /// true if no message failed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }

    /// length of the batch this error belongs to
    #[must_use]
    pub fn batch_len(&self) -> usize {
        self.batch_len
    }

    /// the error for the message at `idx`
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&anyhow::Error> {
        self.failed.get(&idx)
    }

    /// indexes of the failed messages in ascending order
    pub fn indexes(&self) -> impl Iterator<Item = usize> + '_ {
        self.failed.keys().copied()
    }

    /// iterates over `(index, error)` pairs in ascending index order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &anyhow::Error)> {
        self.failed.iter().map(|(i, e)| (*i, e))
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} messages failed", self.len(), self.batch_len)?;
        if let Some((idx, e)) = self.failed.iter().next() {
            write!(f, ", first at index {idx}: {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

/// context for an output, mainly used to prefix log messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputContext {
    alias: String,
}

impl OutputContext {
    /// creates a new context for the output with the given alias
    #[must_use]
    pub fn new<S: Into<String>>(alias: S) -> Self {
        Self {
            alias: alias.into(),
        }
    }

    /// the alias of the output
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }
}

impl fmt::Display for OutputContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Output::{}]", self.alias)
    }
}

/// An output receiving batches of messages
///
/// `write_batch` can be called concurrently, it is up to the caller to bound
/// the number of calls in flight.
#[async_trait::async_trait]
pub trait BatchOutput: Send + Sync {
    /// Connect to the external system. Can be called again after `close`.
    async fn connect(&self, ctx: &OutputContext) -> Result<()>;

    /// Write a batch of messages.
    ///
    /// Returns `Error::Batch` if only some of the messages failed.
    async fn write_batch(&self, ctx: &OutputContext, batch: &[Message]) -> Result<()>;

    /// Release all resources, subsequent writes fail with `Error::NotConnected`
    async fn close(&self, ctx: &OutputContext) -> Result<()>;
}

/// Output type name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct OutputType(pub String);

impl From<&str> for OutputType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An output as built from its configuration together with the host side
/// settings it asks for
pub struct BuiltOutput {
    /// the output
    pub output: Arc<dyn BatchOutput>,
    /// how messages should be grouped into batches
    pub batch_policy: BatchPolicy,
    /// the maximum number of batches in flight
    pub max_in_flight: usize,
}

/// Builds outputs of one type from configuration
pub trait OutputBuilder: Send + Sync {
    /// the type name the output is registered with
    fn output_type(&self) -> OutputType;

    /// Creates an output from its raw configuration
    ///
    /// # Errors
    /// if the configuration is invalid
    fn build_cfg(&self, ctx: &OutputContext, config: &OwnedValue) -> Result<BuiltOutput>;
}

/// Known output types
#[derive(Default)]
pub struct Registry {
    builders: HashMap<OutputType, Box<dyn OutputBuilder>>,
}

impl Registry {
    /// an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// a registry with all builtin output types
    ///
    /// # Errors
    /// if two builtin outputs share a name
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        for builder in crate::builtin_output_types() {
            registry.register(builder)?;
        }
        Ok(registry)
    }

    /// Registers a builder under its output type
    ///
    /// # Errors
    /// if the output type is already registered
    pub fn register(&mut self, builder: Box<dyn OutputBuilder>) -> Result<()> {
        let output_type = builder.output_type();
        if self.builders.contains_key(&output_type) {
            return Err(Error::Config(format!(
                "output type {output_type} already registered"
            )));
        }
        self.builders.insert(output_type, builder);
        Ok(())
    }

    /// finds the builder for `output_type`
    #[must_use]
    pub fn find(&self, output_type: &str) -> Option<&dyn OutputBuilder> {
        self.builders
            .get(&OutputType::from(output_type))
            .map(|b| &**b)
    }

    /// Builds the output described by `definition`
    ///
    /// # Errors
    /// if the output type is unknown or its configuration invalid
    pub fn build(&self, definition: &config::Output) -> Result<(OutputContext, BuiltOutput)> {
        let builder = self.find(&definition.output_type).ok_or_else(|| {
            Error::Config(format!("unknown output type {}", definition.output_type))
        })?;
        let ctx = OutputContext::new(definition.alias.clone());
        let built = builder.build_cfg(&ctx, &definition.config)?;
        Ok((ctx, built))
    }
}

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

//! Google BigQuery Storage Write API output
//!
//! Writes newline delimited JSON messages into a BigQuery table through the
//! table's `_default` write stream. Each message is converted into a protobuf
//! row using a descriptor derived from the live table schema, a batch of rows
//! is appended in a single request and the write stream is rebuilt
//! transparently when the service expires or drops it.

#![warn(missing_docs)]
#![deny(
    clippy::all,
    clippy::unwrap_used,
    clippy::unnecessary_unwrap,
    clippy::pedantic,
    clippy::mod_module_files
)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

/// configuration facilities
pub mod config;
/// error types
pub mod errors;
/// Google BigQuery
pub mod gbq;
/// the output contract this connector implements
pub mod output;
/// stdin style driver feeding batches into an output
pub mod runner;

pub(crate) mod utils;

pub use crate::errors::{Error, Result};
use crate::output::OutputBuilder;

/// builtin output types
#[must_use]
pub fn builtin_output_types() -> Vec<Box<dyn OutputBuilder + 'static>> {
    vec![Box::<gbq::writer::Builder>::default()]
}

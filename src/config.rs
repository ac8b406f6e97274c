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

use crate::errors::{Error, Result};
use serde::de::DeserializeOwned;
use simd_json::OwnedValue;
use std::{fs::File, io::BufReader, path::Path};

/// Trait for detecting errors in config and the key names are included in errors
pub trait Impl {
    /// deserialises the config into a struct and returns nice errors
    /// this doesn't need to be overwritten in most cases.
    ///
    /// # Errors
    /// if the Configuration is invalid
    fn new(config: &OwnedValue) -> Result<Self>
    where
        Self: DeserializeOwned,
    {
        simd_json::serde::from_owned_value(config.clone()).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Output definition as found in a configuration file
///
/// ```yaml
/// output:
///   type: gbq_stream
///   alias: events
///   config:
///     dataset: analytics
///     table: events
/// ```
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Output {
    /// output type, used to find the builder
    #[serde(rename = "type")]
    pub output_type: String,
    /// alias used in log messages
    #[serde(default = "default_alias")]
    pub alias: String,
    /// output specific configuration
    #[serde(default = "empty_config")]
    pub config: OwnedValue,
}

fn default_alias() -> String {
    "output".to_string()
}

fn empty_config() -> OwnedValue {
    simd_json::json!({})
}

/// A configuration file
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Definition {
    /// the output to write to
    pub output: Output,
}

impl Definition {
    /// Loads a YAML definition from `path`
    ///
    /// # Errors
    /// if the file can't be read or isn't a valid definition
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("unable to open {}: {e}", path.display())))?;
        Self::from_reader(BufReader::new(file))
    }

    /// Reads a YAML definition
    ///
    /// # Errors
    /// if the data isn't a valid definition
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        serde_yaml::from_reader(reader).map_err(|e| Error::Config(e.to_string()))
    }
}

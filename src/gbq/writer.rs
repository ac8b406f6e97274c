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

/// the sink doing the actual writing
pub mod sink;

pub use sink::GbqStreamSink;

use crate::{
    config::{self, Impl as _},
    errors::{Error, Result},
    gbq::client::GoogleClientFactory,
    output::{BatchPolicy, BuiltOutput, OutputBuilder, OutputContext, OutputType},
    utils::google::{detect_project_id, TokenSrc},
};
use simd_json::OwnedValue;
use std::{sync::Arc, time::Duration};
use url::Url;

const DEFAULT_METADATA_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";
const DEFAULT_WRITE_ENDPOINT: &str = "https://bigquerystorage.googleapis.com";

/// Configuration of the `gbq_stream` output
#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Project of the table, detected from the credentials if empty
    #[serde(default)]
    pub project: String,
    /// Dataset of the table
    pub dataset: String,
    /// Table to write to
    pub table: String,
    /// Tolerate rows with missing required fields
    #[serde(default = "default_true")]
    pub allow_partial: bool,
    /// Drop fields that are not part of the table instead of failing the row
    #[serde(default = "default_true")]
    pub discard_unknown: bool,
    /// Maximum number of batches being written at the same time
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Service account JSON, application default credentials are used if empty
    #[serde(default)]
    pub credentials_json: String,
    /// Batching of incoming messages
    #[serde(default)]
    pub batching: BatchPolicy,
    /// Timeout for connecting, in nanoseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Timeout for requests, in nanoseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// BigQuery v2 REST endpoint
    #[serde(default = "default_metadata_endpoint")]
    pub metadata_endpoint: String,
    /// Storage Write API endpoint
    #[serde(default = "default_write_endpoint")]
    pub write_endpoint: String,
}
impl config::Impl for Config {}

fn default_true() -> bool {
    true
}

fn default_max_in_flight() -> usize {
    64
}

fn default_connect_timeout() -> u64 {
    10_000_000_000 // 10 seconds
}

fn default_request_timeout() -> u64 {
    30_000_000_000 // 30 seconds
}

fn default_metadata_endpoint() -> String {
    DEFAULT_METADATA_ENDPOINT.to_string()
}

fn default_write_endpoint() -> String {
    DEFAULT_WRITE_ENDPOINT.to_string()
}

fn parse_endpoint(key: &str, endpoint: &str) -> Result<Url> {
    let url = Url::parse(endpoint)
        .map_err(|e| Error::Config(format!("invalid {key} {endpoint}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(Error::Config(format!(
            "invalid {key} {endpoint}: unsupported scheme {scheme}"
        ))),
    }
}

/// The table written to, and how to reach it
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// project of the table
    pub project: String,
    /// dataset of the table
    pub dataset: String,
    /// the table
    pub table: String,
    /// tolerate rows with missing required fields
    pub allow_partial: bool,
    /// drop unknown fields
    pub discard_unknown: bool,
    /// where credentials come from
    pub token: TokenSrc,
    /// BigQuery v2 REST endpoint
    pub metadata_endpoint: Url,
    /// Storage Write API endpoint
    pub write_endpoint: Url,
    /// timeout for establishing connections
    pub connect_timeout: Duration,
    /// timeout for single requests
    pub request_timeout: Duration,
}

impl Target {
    /// Resolves a target from the configuration
    ///
    /// # Errors
    /// if required values are missing or invalid, or no project can be found
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.dataset.is_empty() {
            return Err(Error::Config("dataset must not be empty".to_string()));
        }
        if config.table.is_empty() {
            return Err(Error::Config("table must not be empty".to_string()));
        }
        let project = if config.project.is_empty() {
            detect_project_id(&config.credentials_json).ok_or_else(|| {
                Error::Config("no project configured and none could be detected".to_string())
            })?
        } else {
            config.project.clone()
        };

        Ok(Self {
            project,
            dataset: config.dataset.clone(),
            table: config.table.clone(),
            allow_partial: config.allow_partial,
            discard_unknown: config.discard_unknown,
            token: TokenSrc::from_credentials(&config.credentials_json),
            metadata_endpoint: parse_endpoint("metadata_endpoint", &config.metadata_endpoint)?,
            write_endpoint: parse_endpoint("write_endpoint", &config.write_endpoint)?,
            connect_timeout: Duration::from_nanos(config.connect_timeout),
            request_timeout: Duration::from_nanos(config.request_timeout),
        })
    }

    /// `projects/{project}/datasets/{dataset}/tables/{table}`
    #[must_use]
    pub fn parent(&self) -> String {
        format!(
            "projects/{}/datasets/{}/tables/{}",
            self.project, self.dataset, self.table
        )
    }

    /// the name of the table's `_default` stream
    #[must_use]
    pub fn default_stream(&self) -> String {
        format!("{}/streams/_default", self.parent())
    }

    /// `project.dataset.table`
    #[must_use]
    pub fn qualified_table(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Builder for the `gbq_stream` output
#[derive(Debug, Default)]
pub struct Builder {}

impl OutputBuilder for Builder {
    fn output_type(&self) -> OutputType {
        "gbq_stream".into()
    }

    fn build_cfg(&self, ctx: &OutputContext, config: &OwnedValue) -> Result<BuiltOutput> {
        let config = Config::new(config)?;
        if config.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be at least 1".to_string()));
        }
        let target = Target::from_config(&config)?;
        debug!("{ctx} Writing to {}", target.default_stream());

        Ok(BuiltOutput {
            output: Arc::new(GbqStreamSink::new(target, Box::new(GoogleClientFactory))),
            batch_policy: config.batching,
            max_in_flight: config.max_in_flight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simd_json::json;

    #[test]
    fn config_defaults() -> anyhow::Result<()> {
        let config = Config::new(&json!({"project": "p", "dataset": "d", "table": "t"}))?;
        assert!(config.allow_partial);
        assert!(config.discard_unknown);
        assert_eq!(64, config.max_in_flight);
        assert!(config.batching.is_noop());

        let target = Target::from_config(&config)?;
        assert_eq!(TokenSrc::Env, target.token);
        assert_eq!(Duration::from_secs(10), target.connect_timeout);
        assert_eq!(Duration::from_secs(30), target.request_timeout);
        assert_eq!(
            "projects/p/datasets/d/tables/t/streams/_default",
            target.default_stream()
        );
        assert_eq!("p.d.t", target.qualified_table());
        assert_eq!("bigquerystorage.googleapis.com", target.write_endpoint.host_str().unwrap_or_default());
        Ok(())
    }

    #[test]
    fn project_comes_from_credentials() -> anyhow::Result<()> {
        let config = Config::new(&json!({
            "dataset": "d",
            "table": "t",
            "credentials_json": r#"{"type": "service_account", "project_id": "from-sa"}"#
        }))?;
        let target = Target::from_config(&config)?;
        assert_eq!("from-sa", target.project);
        assert!(matches!(target.token, TokenSrc::Json(_)));
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let res = Config::new(&json!({"project": "p", "dataset": "d", "table": "t", "snot": 1}));
        assert!(matches!(res, Err(Error::Config(_))));
        assert!(matches!(
            Config::new(&json!({"project": "p", "table": "t"})),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() -> anyhow::Result<()> {
        let builder = Builder::default();
        let ctx = OutputContext::new("test");
        for config in [
            json!({"project": "p", "dataset": "", "table": "t"}),
            json!({"project": "p", "dataset": "d", "table": ""}),
            json!({"project": "p", "dataset": "d", "table": "t", "max_in_flight": 0}),
            json!({"project": "p", "dataset": "d", "table": "t", "write_endpoint": "grpc://x"}),
            json!({"project": "p", "dataset": "d", "table": "t", "metadata_endpoint": "not a url"}),
        ] {
            let res = builder.build_cfg(&ctx, &config);
            assert!(matches!(res, Err(Error::Config(_))), "{config:?}");
        }
        Ok(())
    }

    #[test]
    fn builds_the_output() -> anyhow::Result<()> {
        let built = Builder::default().build_cfg(
            &OutputContext::new("test"),
            &json!({
                "project": "p",
                "dataset": "d",
                "table": "t",
                "max_in_flight": 2,
                "batching": {"count": 10},
                "write_endpoint": "http://localhost:9060"
            }),
        )?;
        assert_eq!(2, built.max_in_flight);
        assert_eq!(10, built.batch_policy.count);
        assert_eq!(OutputType::from("gbq_stream"), Builder::default().output_type());
        Ok(())
    }
}

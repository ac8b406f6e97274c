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

//! The seams between the writer and BigQuery.
//!
//! The writer only talks to these traits, the production implementations
//! live in [`metadata`] (BigQuery v2 REST) and [`write`] (Storage Write gRPC).

/// BigQuery v2 REST metadata client
pub mod metadata;
/// Storage Write API client and managed stream
pub mod write;

pub use metadata::RestMetadataClient;
pub use write::{GrpcManagedStream, GrpcWriteClient};

use crate::{gbq::writer::Target, output::OutputContext, utils::google::TokenSrc};
use futures::future::BoxFuture;
use googapis::google::cloud::bigquery::storage::v1::TableSchema;
use prost_types::DescriptorProto;
use std::{future::Future, sync::Arc};

/// Dataset and table metadata
#[async_trait::async_trait]
pub trait MetadataClient: Send + Sync {
    /// Checks that the dataset exists
    async fn dataset(&self, project: &str, dataset: &str) -> anyhow::Result<()>;

    /// Checks that the table exists and returns its column schema
    async fn table_schema(
        &self,
        project: &str,
        dataset: &str,
        table: &str,
    ) -> anyhow::Result<TableSchema>;

    /// Releases the client
    async fn close(&self) -> anyhow::Result<()>;
}

/// Opens managed write streams
#[async_trait::async_trait]
pub trait WriteClient: Send + Sync {
    /// Opens a stream on the `_default` stream of the table `parent`
    /// (`projects/{p}/datasets/{d}/tables/{t}`) writing rows of `descriptor`
    async fn open_stream(
        &self,
        ctx: &OutputContext,
        parent: &str,
        descriptor: &DescriptorProto,
    ) -> anyhow::Result<Arc<dyn ManagedStream>>;

    /// Releases the client
    async fn close(&self) -> anyhow::Result<()>;
}

/// A write stream rows can be appended to
#[async_trait::async_trait]
pub trait ManagedStream: Send + Sync {
    /// Sends `rows` to the stream.
    ///
    /// An error here means the rows never made it out, the returned
    /// [`AppendResult`] resolves once the service acknowledged them.
    async fn append_rows(&self, rows: Vec<Vec<u8>>) -> anyhow::Result<AppendResult>;

    /// Closes the stream, pending results fail
    async fn close(&self) -> anyhow::Result<()>;
}

/// The pending acknowledgement of an append
pub struct AppendResult {
    result: BoxFuture<'static, anyhow::Result<i64>>,
}

impl std::fmt::Debug for AppendResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AppendResult")
    }
}

impl AppendResult {
    /// wraps a future resolving to the acknowledged offset
    pub fn new<F>(result: F) -> Self
    where
        F: Future<Output = anyhow::Result<i64>> + Send + 'static,
    {
        Self {
            result: Box::pin(result),
        }
    }

    /// an already resolved result
    #[must_use]
    pub fn ready(result: anyhow::Result<i64>) -> Self {
        Self::new(futures::future::ready(result))
    }

    /// Waits for the acknowledgement and returns the offset the rows were
    /// written at
    ///
    /// # Errors
    /// if the service rejected the rows or the stream broke
    pub async fn get_result(self) -> anyhow::Result<i64> {
        self.result.await
    }
}

/// Creates the clients for a target
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    /// creates the metadata client
    async fn metadata_client(&self, target: &Target) -> anyhow::Result<Box<dyn MetadataClient>>;

    /// creates the write client
    async fn write_client(&self, target: &Target) -> anyhow::Result<Box<dyn WriteClient>>;
}

/// Creates clients talking to Google Cloud (or an emulator)
#[derive(Debug, Clone, Copy, Default)]
pub struct GoogleClientFactory;

#[async_trait::async_trait]
impl ClientFactory for GoogleClientFactory {
    async fn metadata_client(&self, target: &Target) -> anyhow::Result<Box<dyn MetadataClient>> {
        let token = token_src_for(&target.metadata_endpoint, &target.token);
        Ok(Box::new(RestMetadataClient::new(
            target.metadata_endpoint.clone(),
            token,
            target.connect_timeout,
            target.request_timeout,
        )?))
    }

    async fn write_client(&self, target: &Target) -> anyhow::Result<Box<dyn WriteClient>> {
        let token = token_src_for(&target.write_endpoint, &target.token);
        Ok(Box::new(
            GrpcWriteClient::connect(
                &target.write_endpoint,
                token,
                target.connect_timeout,
                target.request_timeout,
            )
            .await?,
        ))
    }
}

/// plain http endpoints are emulators, they get no credentials
fn token_src_for(endpoint: &url::Url, configured: &TokenSrc) -> TokenSrc {
    if endpoint.scheme() == "http" {
        TokenSrc::Anonymous
    } else {
        configured.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_endpoints_are_anonymous() -> anyhow::Result<()> {
        let configured = TokenSrc::Json("{}".to_string());
        assert_eq!(
            TokenSrc::Anonymous,
            token_src_for(&url::Url::parse("http://localhost:9050")?, &configured)
        );
        assert_eq!(
            configured,
            token_src_for(
                &url::Url::parse("https://bigquery.googleapis.com/bigquery/v2")?,
                &configured
            )
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn append_result_resolves() -> anyhow::Result<()> {
        assert_eq!(-1, AppendResult::ready(Ok(-1)).get_result().await?);
        let pending = AppendResult::new(async { Err(anyhow::anyhow!("snot")) });
        assert_eq!("snot", pending.get_result().await.err().map(|e| e.to_string()).unwrap_or_default());
        Ok(())
    }
}

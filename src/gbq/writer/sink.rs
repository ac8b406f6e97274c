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

use crate::{
    errors::{has_status_code, ApiError, Error, Result},
    gbq::{
        client::{ClientFactory, ManagedStream, MetadataClient, WriteClient},
        row::RowConverter,
        schema::RowSchema,
        writer::Target,
        NO_STREAM_OFFSET,
    },
    output::{BatchError, BatchOutput, Message, OutputContext},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tonic::{Code, Status};

/// Reconnects per `write_batch` before the last error is given up on
const MAX_RECONNECTS: usize = 2;
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(1);

/// Status codes that rebuilding the stream is likely to fix
const RECONNECT_CODES: [Code; 4] = [
    Code::Aborted,
    Code::Unavailable,
    Code::Internal,
    Code::DeadlineExceeded,
];

struct Session {
    metadata: Box<dyn MetadataClient>,
    write: Box<dyn WriteClient>,
    // empty after a failed reconnect, the next append reconnects again
    stream: Option<Arc<dyn ManagedStream>>,
    schema: Arc<RowSchema>,
}

impl Session {
    async fn close(self, ctx: &OutputContext) {
        if let Some(stream) = self.stream {
            if let Err(e) = stream.close().await {
                warn!("{ctx} Error closing the write stream: {e}");
            }
        }
        close_write(ctx, self.write.as_ref()).await;
        close_metadata(ctx, self.metadata.as_ref()).await;
    }
}

async fn close_write(ctx: &OutputContext, client: &dyn WriteClient) {
    if let Err(e) = client.close().await {
        warn!("{ctx} Error closing the write client: {e}");
    }
}

async fn close_metadata(ctx: &OutputContext, client: &dyn MetadataClient) {
    if let Err(e) = client.close().await {
        warn!("{ctx} Error closing the metadata client: {e}");
    }
}

/// Writes batches of JSON messages into a table's `_default` stream
pub struct GbqStreamSink {
    target: Target,
    factory: Box<dyn ClientFactory>,
    session: RwLock<Option<Session>>,
    reconnect_cooldown: Duration,
}

impl GbqStreamSink {
    /// Creates an unconnected sink writing to `target`
    #[must_use]
    pub fn new(target: Target, factory: Box<dyn ClientFactory>) -> Self {
        Self {
            target,
            factory,
            session: RwLock::new(None),
            reconnect_cooldown: RECONNECT_COOLDOWN,
        }
    }

    /// the table written to
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    async fn open_session(&self, ctx: &OutputContext) -> Result<Session> {
        let metadata = self
            .factory
            .metadata_client(&self.target)
            .await
            .map_err(|e| Error::Client("metadata", e))?;
        let write = match self.factory.write_client(&self.target).await {
            Ok(write) => write,
            Err(e) => {
                close_metadata(ctx, metadata.as_ref()).await;
                return Err(Error::Client("write", e));
            }
        };

        match self
            .prepare_stream(ctx, metadata.as_ref(), write.as_ref())
            .await
        {
            Ok((schema, stream)) => Ok(Session {
                metadata,
                write,
                stream: Some(stream),
                schema,
            }),
            Err(e) => {
                close_write(ctx, write.as_ref()).await;
                close_metadata(ctx, metadata.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn prepare_stream(
        &self,
        ctx: &OutputContext,
        metadata: &dyn MetadataClient,
        write: &dyn WriteClient,
    ) -> Result<(Arc<RowSchema>, Arc<dyn ManagedStream>)> {
        let t = &self.target;
        metadata
            .dataset(&t.project, &t.dataset)
            .await
            .map_err(|e| {
                if has_status_code(&e, 404) {
                    Error::DatasetNotFound(format!("{}.{}", t.project, t.dataset))
                } else {
                    Error::Metadata("dataset", e)
                }
            })?;
        let table_schema = metadata
            .table_schema(&t.project, &t.dataset, &t.table)
            .await
            .map_err(|e| {
                if has_status_code(&e, 404) {
                    Error::TableNotFound(t.qualified_table())
                } else {
                    Error::Metadata("table", e)
                }
            })?;

        let schema = Arc::new(RowSchema::derive(&table_schema)?);
        let stream = write
            .open_stream(ctx, &t.parent(), schema.descriptor())
            .await
            .map_err(Error::StreamCreation)?;
        Ok((schema, stream))
    }

    /// the handles an append works with, without holding the lock
    async fn snapshot(&self) -> Result<(Option<Arc<dyn ManagedStream>>, Arc<RowSchema>)> {
        let session = self.session.read().await;
        let session = session.as_ref().ok_or(Error::NotConnected)?;
        Ok((session.stream.clone(), session.schema.clone()))
    }

    /// Replaces the `failed` stream of the current session, reusing the
    /// cached schema. A stream some other caller installed meanwhile is
    /// returned as is.
    async fn reconnect(
        &self,
        ctx: &OutputContext,
        failed: Option<&Arc<dyn ManagedStream>>,
    ) -> anyhow::Result<Arc<dyn ManagedStream>> {
        let mut session = self.session.write().await;
        let session = session.as_mut().ok_or(Error::NotConnected)?;

        if let Some(current) = &session.stream {
            if failed.map_or(true, |failed| !same_stream(current, failed)) {
                debug!("{ctx} Write stream was replaced already");
                return Ok(current.clone());
            }
        }

        if let Some(stream) = session.stream.take() {
            if let Err(e) = stream.close().await {
                debug!("{ctx} Error closing the broken write stream: {e}");
            }
        }
        tokio::time::sleep(self.reconnect_cooldown).await;

        let stream = session
            .write
            .open_stream(ctx, &self.target.parent(), session.schema.descriptor())
            .await?;
        session.stream = Some(stream.clone());
        info!(
            "{ctx} Reconnected to {}",
            self.target.qualified_table()
        );
        Ok(stream)
    }

    async fn append(
        &self,
        ctx: &OutputContext,
        mut stream: Option<Arc<dyn ManagedStream>>,
        rows: Vec<Vec<u8>>,
    ) -> Result<()> {
        let mut reconnects = 0;
        loop {
            let res = match &stream {
                Some(stream) => append_rows(stream.as_ref(), rows.clone()).await,
                None => Err(Status::unavailable("no write stream").into()),
            };
            match res {
                Ok(offset) if offset == NO_STREAM_OFFSET => return Ok(()),
                Ok(offset) => {
                    error!("{ctx} Rows were written at unexpected offset {offset}");
                    return Err(Error::OffsetMismatch {
                        got: offset,
                        want: NO_STREAM_OFFSET,
                    });
                }
                Err(e) if is_reconnectable(&e) => {
                    log_error_details(ctx, &e);
                    if reconnects >= MAX_RECONNECTS {
                        error!("{ctx} Giving up after {reconnects} reconnects: {e}");
                        return Err(Error::Append(e));
                    }
                    reconnects += 1;
                    warn!(
                        "{ctx} Connection error, reconnecting (attempt {reconnects}/{MAX_RECONNECTS}): {e}"
                    );
                    stream = Some(self.reconnect(ctx, stream.as_ref()).await.map_err(|e| {
                        error!("{ctx} Reconnect failed: {e}");
                        Error::ReconnectFailed(e)
                    })?);
                }
                Err(e) => {
                    log_error_details(ctx, &e);
                    return Err(Error::Append(e));
                }
            }
        }
    }
}

fn same_stream(a: &Arc<dyn ManagedStream>, b: &Arc<dyn ManagedStream>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

async fn append_rows(stream: &dyn ManagedStream, rows: Vec<Vec<u8>>) -> anyhow::Result<i64> {
    stream.append_rows(rows).await?.get_result().await
}

/// Whether rebuilding the stream is likely to fix `err`
pub(crate) fn is_reconnectable(err: &anyhow::Error) -> bool {
    let has_code = |code: Code| RECONNECT_CODES.contains(&code);
    if err
        .chain()
        .filter_map(|e| e.downcast_ref::<Status>())
        .any(|s| has_code(s.code()))
    {
        return true;
    }
    if err
        .chain()
        .filter_map(|e| e.downcast_ref::<ApiError>())
        .any(|e| has_code(e.status().code()))
    {
        return true;
    }
    let msg = format!("{err:#}");
    (msg.contains("connection TTL") && msg.contains("exceeded"))
        || msg.contains("server_shutting_down")
}

fn log_error_details(ctx: &OutputContext, err: &anyhow::Error) {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<ApiError>() {
            error!(
                "{ctx} API error: code {:?}, message: {}, details: {:?}",
                e.status().code(),
                e.status().message(),
                e.details()
            );
            return;
        }
        if let Some(s) = cause.downcast_ref::<Status>() {
            error!(
                "{ctx} gRPC error: code {:?}, message: {}",
                s.code(),
                s.message()
            );
            return;
        }
    }
    error!("{ctx} Append error: {err:#}");
}

#[async_trait::async_trait]
impl BatchOutput for GbqStreamSink {
    async fn connect(&self, ctx: &OutputContext) -> Result<()> {
        info!("{ctx} Connecting to BigQuery");
        let session = self.open_session(ctx).await?;

        let mut guard = self.session.write().await;
        if let Some(previous) = guard.replace(session) {
            previous.close(ctx).await;
        }
        info!("{ctx} Connected to {}", self.target.qualified_table());
        Ok(())
    }

    async fn write_batch(&self, ctx: &OutputContext, batch: &[Message]) -> Result<()> {
        let (stream, schema) = self.snapshot().await?;

        let converter = RowConverter::new(self.target.allow_partial, self.target.discard_unknown);
        let mut rows = Vec::with_capacity(batch.len());
        let mut errors = BatchError::new(batch.len());
        for (idx, msg) in batch.iter().enumerate() {
            match converter.convert(&schema, msg) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    debug!("{ctx} Message {idx} can't be converted: {e}");
                    errors.failed(idx, e);
                }
            }
        }

        if rows.is_empty() {
            debug!("{ctx} No rows to append");
        } else {
            self.append(ctx, stream, rows).await?;
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    async fn close(&self, ctx: &OutputContext) -> Result<()> {
        let mut session = self.session.write().await;
        if let Some(session) = session.take() {
            session.close(ctx).await;
            info!("{ctx} Disconnected from {}", self.target.qualified_table());
        }
        Ok(())
    }
}

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

use super::{AppendResult, ManagedStream, WriteClient};
use crate::{
    errors::ApiError,
    gbq::NO_STREAM_OFFSET,
    output::OutputContext,
    utils::google::{AuthInterceptor, GouthTokenProvider, TokenSrc},
};
use anyhow::anyhow;
use futures::{stream::BoxStream, StreamExt};
use googapis::google::cloud::bigquery::storage::v1::{
    append_rows_request::{self, ProtoData},
    append_rows_response::{AppendResult as AppendResponse, Response},
    big_query_write_client::BigQueryWriteClient,
    table_field_schema::Type as TableType,
    AppendRowsRequest, AppendRowsResponse, GetWriteStreamRequest, ProtoRows, ProtoSchema,
};
use prost_types::DescriptorProto;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    codegen::InterceptedService,
    transport::{Certificate, Channel, ClientTlsConfig},
    Status,
};
use url::Url;

type Client = BigQueryWriteClient<InterceptedService<Channel, AuthInterceptor<GouthTokenProvider>>>;
type ResponseStream = BoxStream<'static, Result<AppendRowsResponse, Status>>;

// requests queued towards the service per stream
const QUEUE_SIZE: usize = 64;

/// Starts the bidirectional `AppendRows` call a managed stream runs on
#[async_trait::async_trait]
pub(crate) trait AppendRowsCall: Send + 'static {
    async fn append_rows(
        &mut self,
        requests: ReceiverStream<AppendRowsRequest>,
    ) -> Result<ResponseStream, Status>;
}

#[async_trait::async_trait]
impl AppendRowsCall for Client {
    async fn append_rows(
        &mut self,
        requests: ReceiverStream<AppendRowsRequest>,
    ) -> Result<ResponseStream, Status> {
        let responses = BigQueryWriteClient::append_rows(self, requests)
            .await?
            .into_inner();
        Ok(responses.boxed())
    }
}

/// Storage Write API client
pub struct GrpcWriteClient {
    // tonic clients are cheap to clone, every call works on its own clone
    client: Mutex<Client>,
    request_timeout: Duration,
}

impl GrpcWriteClient {
    /// Connects to the Storage Write API at `endpoint`, `http` endpoints use
    /// neither TLS nor credentials
    ///
    /// # Errors
    /// if the channel can't be established
    pub async fn connect(
        endpoint: &Url,
        token: TokenSrc,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut channel =
            Channel::from_shared(endpoint.to_string())?.connect_timeout(connect_timeout);
        if endpoint.scheme() == "https" {
            let domain = endpoint
                .host_str()
                .ok_or_else(|| anyhow!("write endpoint {endpoint} has no host"))?;
            let tls_config = ClientTlsConfig::new()
                .ca_certificate(Certificate::from_pem(googapis::CERTIFICATES))
                .domain_name(domain);
            channel = channel.tls_config(tls_config)?;
        }
        let channel = timeout(connect_timeout, channel.connect())
            .await
            .map_err(|_| Status::deadline_exceeded("connecting to the write endpoint timed out"))??;

        let client = BigQueryWriteClient::with_interceptor(
            channel,
            AuthInterceptor {
                token_provider: GouthTokenProvider::from(token),
            },
        );
        Ok(Self {
            client: Mutex::new(client),
            request_timeout,
        })
    }

    fn client(&self) -> anyhow::Result<Client> {
        Ok(self
            .client
            .lock()
            .map_err(|_| anyhow!("write client lock poisoned"))?
            .clone())
    }
}

#[async_trait::async_trait]
impl WriteClient for GrpcWriteClient {
    async fn open_stream(
        &self,
        ctx: &OutputContext,
        parent: &str,
        descriptor: &DescriptorProto,
    ) -> anyhow::Result<Arc<dyn ManagedStream>> {
        let name = format!("{parent}/streams/_default");
        let mut client = self.client()?;
        let stream = timeout(
            self.request_timeout,
            client.get_write_stream(GetWriteStreamRequest {
                name: name.clone(),
                ..GetWriteStreamRequest::default()
            }),
        )
        .await
        .map_err(|_| Status::deadline_exceeded("getting the write stream timed out"))??
        .into_inner();
        debug!("{ctx} Opened write stream {}", stream.name);

        Ok(Arc::new(GrpcManagedStream::open(
            ctx,
            client,
            name,
            descriptor.clone(),
            self.request_timeout,
            QUEUE_SIZE,
        )))
    }

    /// Nothing to release here, the channel closes once the last client
    /// clone is dropped together with the session and its streams.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Pending {
    // set once the response stream is gone, later appends fail with it
    closed: Option<(tonic::Code, String)>,
    waiters: VecDeque<oneshot::Sender<anyhow::Result<i64>>>,
}

impl Pending {
    fn fail_all(&mut self, code: tonic::Code, message: &str) {
        if self.closed.is_none() {
            self.closed = Some((code, message.to_string()));
        }
        for waiter in self.waiters.drain(..) {
            // the appender might have given up already
            let _ = waiter.send(Err(Status::new(code, message).into()));
        }
    }
}

/// A long lived `AppendRows` call on a `_default` stream.
///
/// Requests are fed through a channel, a reader task resolves the
/// acknowledgements in the order the requests were sent.
pub struct GrpcManagedStream {
    name: String,
    descriptor: DescriptorProto,
    request_timeout: Duration,
    sender: tokio::sync::Mutex<Option<mpsc::Sender<AppendRowsRequest>>>,
    pending: Arc<Mutex<Pending>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl GrpcManagedStream {
    pub(crate) fn open<C: AppendRowsCall>(
        ctx: &OutputContext,
        call: C,
        name: String,
        descriptor: DescriptorProto,
        request_timeout: Duration,
        queue_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size);
        let pending = Arc::new(Mutex::new(Pending::default()));
        let reader = tokio::spawn(read_responses(
            ctx.clone(),
            call,
            ReceiverStream::new(rx),
            pending.clone(),
        ));
        Self {
            name,
            descriptor,
            request_timeout,
            sender: tokio::sync::Mutex::new(Some(tx)),
            pending,
            reader: Mutex::new(Some(reader)),
        }
    }

    fn request(&self, serialized_rows: Vec<Vec<u8>>) -> AppendRowsRequest {
        AppendRowsRequest {
            write_stream: self.name.clone(),
            offset: None,
            rows: Some(append_rows_request::Rows::ProtoRows(ProtoData {
                writer_schema: Some(ProtoSchema {
                    proto_descriptor: Some(self.descriptor.clone()),
                }),
                rows: Some(ProtoRows { serialized_rows }),
            })),
            ..AppendRowsRequest::default()
        }
    }

    fn lock_pending(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Pending>> {
        self.pending
            .lock()
            .map_err(|_| anyhow!("pending appends lock poisoned"))
    }
}

#[async_trait::async_trait]
impl ManagedStream for GrpcManagedStream {
    async fn append_rows(&self, rows: Vec<Vec<u8>>) -> anyhow::Result<AppendResult> {
        let request = self.request(rows);
        let (tx, rx) = oneshot::channel();

        // held across enqueue and send so waiters and requests share one order
        let sender = self.sender.lock().await;
        let sender = sender
            .as_ref()
            .ok_or_else(|| Status::unavailable("append stream is closed"))?;
        {
            let mut pending = self.lock_pending()?;
            if let Some((code, message)) = &pending.closed {
                return Err(Status::new(*code, message.clone()).into());
            }
            pending.waiters.push_back(tx);
        }
        let sent = match timeout(self.request_timeout, sender.send(request)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Status::unavailable("append stream is closed")),
            Err(_) => Err(Status::deadline_exceeded("sending append request timed out")),
        };
        if let Err(status) = sent {
            // pushes are serialised by the sender lock, the last waiter is ours
            self.lock_pending()?.waiters.pop_back();
            return Err(status.into());
        }

        let request_timeout = self.request_timeout;
        Ok(AppendResult::new(async move {
            match timeout(request_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Status::unavailable("append stream is closed").into()),
                Err(_) => Err(Status::deadline_exceeded(format!(
                    "no acknowledgement after {}ms",
                    request_timeout.as_millis()
                ))
                .into()),
            }
        }))
    }

    async fn close(&self) -> anyhow::Result<()> {
        // dropping the sender half-closes the call
        self.sender.lock().await.take();
        if let Some(reader) = self
            .reader
            .lock()
            .map_err(|_| anyhow!("reader lock poisoned"))?
            .take()
        {
            reader.abort();
        }
        // in flight appends have to be retried on a new stream
        self.lock_pending()?
            .fail_all(tonic::Code::Unavailable, "append stream was closed");
        Ok(())
    }
}

impl Drop for GrpcManagedStream {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
    }
}

fn log_updated_schema(ctx: &OutputContext, response: &AppendRowsResponse) {
    if let Some(updated_schema) = response.updated_schema.as_ref() {
        let fields = updated_schema
            .fields
            .iter()
            .map(|f| {
                format!(
                    "{}: {:?}",
                    f.name,
                    TableType::from_i32(f.r#type).unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        info!("{ctx} GBQ Schema was updated: {}", fields);
    }
}

fn offset(response: AppendRowsResponse) -> anyhow::Result<i64> {
    match response.response {
        Some(Response::AppendResult(AppendResponse { offset, .. })) => {
            Ok(offset.unwrap_or(NO_STREAM_OFFSET))
        }
        Some(Response::Error(e)) => Err(ApiError::from(e).into()),
        None => Ok(NO_STREAM_OFFSET),
    }
}

async fn read_responses<C: AppendRowsCall>(
    ctx: OutputContext,
    mut call: C,
    requests: ReceiverStream<AppendRowsRequest>,
    pending: Arc<Mutex<Pending>>,
) {
    let fail_all = |code: tonic::Code, message: &str| {
        if let Ok(mut pending) = pending.lock() {
            pending.fail_all(code, message);
        }
    };

    let mut responses = match call.append_rows(requests).await {
        Ok(responses) => responses,
        Err(status) => {
            warn!("{ctx} Append stream failed: {status}");
            fail_all(status.code(), status.message());
            return;
        }
    };

    loop {
        match responses.next().await {
            Some(Ok(response)) => {
                log_updated_schema(&ctx, &response);
                let waiter = pending.lock().ok().and_then(|mut p| p.waiters.pop_front());
                if let Some(waiter) = waiter {
                    let _ = waiter.send(offset(response));
                } else {
                    warn!("{ctx} Received an acknowledgement without a pending append");
                }
            }
            None => {
                debug!("{ctx} Append stream closed by the server");
                fail_all(tonic::Code::Unavailable, "append stream closed by the server");
                return;
            }
            Some(Err(status)) => {
                warn!("{ctx} Append stream failed: {status}");
                fail_all(status.code(), status.message());
                return;
            }
        }
    }
}

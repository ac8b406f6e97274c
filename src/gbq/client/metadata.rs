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

use super::MetadataClient;
use crate::{
    errors::HttpError,
    utils::google::{GouthTokenProvider, TokenProvider, TokenSrc},
};
use anyhow::{anyhow, Context};
use googapis::google::cloud::bigquery::storage::v1::{
    table_field_schema::{Mode, Type as TableType},
    TableFieldSchema, TableSchema,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use url::Url;

#[derive(Deserialize, Debug)]
struct RestTable {
    #[serde(default)]
    schema: Option<RestSchema>,
}

#[derive(Deserialize, Debug)]
struct RestSchema {
    #[serde(default)]
    fields: Vec<RestField>,
}

// int64 values are sent as strings by the REST API
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RestField {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    fields: Vec<RestField>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    max_length: Option<String>,
    #[serde(default)]
    precision: Option<String>,
    #[serde(default)]
    scale: Option<String>,
}

fn table_type(name: &str) -> TableType {
    match name {
        "STRING" => TableType::String,
        "INTEGER" | "INT64" => TableType::Int64,
        "FLOAT" | "FLOAT64" => TableType::Double,
        "BOOLEAN" | "BOOL" => TableType::Bool,
        "BYTES" => TableType::Bytes,
        "TIMESTAMP" => TableType::Timestamp,
        "DATE" => TableType::Date,
        "TIME" => TableType::Time,
        "DATETIME" => TableType::Datetime,
        "GEOGRAPHY" => TableType::Geography,
        "NUMERIC" | "DECIMAL" => TableType::Numeric,
        "BIGNUMERIC" | "BIGDECIMAL" => TableType::Bignumeric,
        "INTERVAL" => TableType::Interval,
        "JSON" => TableType::Json,
        "RECORD" | "STRUCT" => TableType::Struct,
        // refused when deriving the row schema
        _ => TableType::Unspecified,
    }
}

fn mode(name: Option<&str>) -> Mode {
    match name {
        Some("REQUIRED") => Mode::Required,
        Some("REPEATED") => Mode::Repeated,
        _ => Mode::Nullable,
    }
}

fn parse_i64(value: Option<&String>) -> i64 {
    value.and_then(|v| v.parse().ok()).unwrap_or_default()
}

impl From<RestField> for TableFieldSchema {
    fn from(field: RestField) -> Self {
        Self {
            r#type: table_type(&field.field_type).into(),
            mode: mode(field.mode.as_deref()).into(),
            max_length: parse_i64(field.max_length.as_ref()),
            precision: parse_i64(field.precision.as_ref()),
            scale: parse_i64(field.scale.as_ref()),
            description: field.description.unwrap_or_default(),
            fields: field.fields.into_iter().map(Self::from).collect(),
            name: field.name,
            ..Self::default()
        }
    }
}

/// Metadata client for the BigQuery v2 REST API
pub struct RestMetadataClient {
    client: reqwest::Client,
    endpoint: Url,
    token: Option<Arc<Mutex<GouthTokenProvider>>>,
}

impl RestMetadataClient {
    /// Creates a client for `endpoint`, anonymous token sources send no
    /// authorization header
    ///
    /// # Errors
    /// if the http client can't be built
    pub fn new(
        endpoint: Url,
        token: TokenSrc,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        let token = (token != TokenSrc::Anonymous)
            .then(|| Arc::new(Mutex::new(GouthTokenProvider::from(token))));
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    fn url(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("invalid metadata endpoint {}", self.endpoint))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: Url) -> anyhow::Result<Vec<u8>> {
        let mut request = self.client.get(url.clone());
        if let Some(provider) = self.token.clone() {
            // fetching a token can block on the credentials file or the metadata server
            let header = tokio::task::spawn_blocking(move || {
                provider
                    .lock()
                    .map_err(|_| anyhow!("token provider lock poisoned"))?
                    .get_token()
                    .map_err(anyhow::Error::from)
            })
            .await??;
            request = request.header(reqwest::header::AUTHORIZATION, header.as_str());
        }

        let response = request.send().await.with_context(|| format!("GET {url}"))?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(HttpError {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            })
            .with_context(|| format!("GET {url}"));
        }
        Ok(body.to_vec())
    }
}

#[async_trait::async_trait]
impl MetadataClient for RestMetadataClient {
    async fn dataset(&self, project: &str, dataset: &str) -> anyhow::Result<()> {
        let url = self.url(&["projects", project, "datasets", dataset])?;
        self.get(url).await?;
        Ok(())
    }

    async fn table_schema(
        &self,
        project: &str,
        dataset: &str,
        table: &str,
    ) -> anyhow::Result<TableSchema> {
        let url = self.url(&["projects", project, "datasets", dataset, "tables", table])?;
        let mut body = self.get(url).await?;
        let table: RestTable = simd_json::serde::from_slice(&mut body)?;
        Ok(TableSchema {
            fields: table
                .schema
                .map(|s| s.fields.into_iter().map(TableFieldSchema::from).collect())
                .unwrap_or_default(),
        })
    }

    /// Nothing to release here, the connection pool goes away with the client
    /// once the session holding it is dropped.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::has_status_code;
    use hyper::{
        service::{make_service_fn, service_fn},
        Body, Request, Response, Server, StatusCode,
    };
    use pretty_assertions::assert_eq;
    use std::{convert::Infallible, net::SocketAddr};

    const TABLE: &str = r#"{
        "kind": "bigquery#table",
        "id": "p:d.t",
        "schema": {
            "fields": [
                {"name": "id", "type": "INTEGER", "mode": "REQUIRED"},
                {"name": "name", "type": "STRING", "maxLength": "10"},
                {"name": "tags", "type": "STRING", "mode": "REPEATED"},
                {"name": "amount", "type": "NUMERIC", "precision": "10", "scale": "2"},
                {"name": "r", "type": "RECORD", "fields": [
                    {"name": "ok", "type": "BOOLEAN", "description": "all good"}
                ]},
                {"name": "span", "type": "RANGE"}
            ]
        }
    }"#;

    async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let (status, body) = match req.uri().path() {
            "/bigquery/v2/projects/p/datasets/d" => (StatusCode::OK, r#"{"id": "p:d"}"#),
            "/bigquery/v2/projects/p/datasets/d/tables/t" => (StatusCode::OK, TABLE),
            "/bigquery/v2/projects/p/datasets/d/tables/empty" => (StatusCode::OK, "{}"),
            "/bigquery/v2/projects/p/datasets/forbidden" => {
                (StatusCode::FORBIDDEN, r#"{"error": {"code": 403}}"#)
            }
            _ => (StatusCode::NOT_FOUND, r#"{"error": {"code": 404}}"#),
        };
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        // emulators don't get credentials
        if req.headers().contains_key("authorization") {
            *response.status_mut() = StatusCode::BAD_REQUEST;
        }
        Ok(response)
    }

    fn serve() -> anyhow::Result<SocketAddr> {
        let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
        let server = Server::try_bind(&SocketAddr::from(([127, 0, 0, 1], 0)))?.serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        Ok(addr)
    }

    fn client(addr: SocketAddr) -> anyhow::Result<RestMetadataClient> {
        RestMetadataClient::new(
            Url::parse(&format!("http://{addr}/bigquery/v2"))?,
            TokenSrc::Anonymous,
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dataset_existence() -> anyhow::Result<()> {
        let client = client(serve()?)?;

        client.dataset("p", "d").await?;

        let missing = client.dataset("p", "nope").await.err();
        assert!(missing.map_or(false, |e| has_status_code(&e, 404)));

        let forbidden = client.dataset("p", "forbidden").await.err();
        assert!(forbidden.map_or(false, |e| has_status_code(&e, 403)));
        client.close().await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn table_schema_is_converted() -> anyhow::Result<()> {
        let client = client(serve()?)?;

        let schema = client.table_schema("p", "d", "t").await?;
        let summary: Vec<_> = schema
            .fields
            .iter()
            .map(|f| (f.name.as_str(), f.r#type, f.mode))
            .collect();
        assert_eq!(
            vec![
                ("id", TableType::Int64.into(), Mode::Required.into()),
                ("name", TableType::String.into(), Mode::Nullable.into()),
                ("tags", TableType::String.into(), Mode::Repeated.into()),
                ("amount", TableType::Numeric.into(), Mode::Nullable.into()),
                ("r", TableType::Struct.into(), Mode::Nullable.into()),
                ("span", TableType::Unspecified.into(), Mode::Nullable.into()),
            ],
            summary
        );
        assert_eq!(10, schema.fields[1].max_length);
        assert_eq!((10, 2), (schema.fields[3].precision, schema.fields[3].scale));
        assert_eq!("all good", schema.fields[4].fields[0].description);

        assert!(client.table_schema("p", "d", "empty").await?.fields.is_empty());

        let missing = client.table_schema("p", "d", "nope").await.err();
        assert!(missing.map_or(false, |e| has_status_code(&e, 404)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_endpoint_is_not_a_404() -> anyhow::Result<()> {
        // nothing listens on the discard port
        let client = client(SocketAddr::from(([127, 0, 0, 1], 9)))?;
        let err = client.dataset("p", "d").await.err();
        assert!(err.map_or(false, |e| !has_status_code(&e, 404)));
        Ok(())
    }
}

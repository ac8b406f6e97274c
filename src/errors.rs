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

use crate::{gbq::schema::SchemaError, output::BatchError};
use tonic::{Code, Status};

/// Result type for outputs
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for the BigQuery stream output
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Nothing is connected (yet or anymore)
    #[error("not connected to target")]
    NotConnected,
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Creating one of the clients failed
    #[error("error creating {0} client: {1}")]
    Client(&'static str, anyhow::Error),
    /// The dataset doesn't exist
    #[error("dataset does not exist: {0}")]
    DatasetNotFound(String),
    /// The table doesn't exist
    #[error("table does not exist: {0}")]
    TableNotFound(String),
    /// Fetching dataset or table metadata failed
    #[error("error checking {0} existence: {1}")]
    Metadata(&'static str, anyhow::Error),
    /// The table schema can't be expressed as a row descriptor
    #[error("error deriving row schema: {0}")]
    SchemaDerivation(#[from] SchemaError),
    /// Opening the write stream failed
    #[error("error creating BigQuery managed stream: {0}")]
    StreamCreation(anyhow::Error),
    /// Some messages of a batch could not be converted
    #[error(transparent)]
    Batch(#[from] BatchError),
    /// The service acknowledged the append with an unexpected offset
    #[error("offset mismatch, got {got} want {want}")]
    OffsetMismatch {
        /// offset returned by the service
        got: i64,
        /// offset we expected
        want: i64,
    },
    /// Rebuilding the write stream failed
    #[error("connection error reconnect failed: {0}")]
    ReconnectFailed(anyhow::Error),
    /// Appending rows failed, this is the error as reported by the client
    #[error(transparent)]
    Append(anyhow::Error),
}

/// A structured API error as reported in-band by the write API
#[derive(Debug, thiserror::Error)]
#[error("api error - code: {:?}, message: {}", .status.code(), .status.message())]
pub struct ApiError {
    #[source]
    status: Status,
    details: Vec<String>,
}

impl ApiError {
    /// creates a new `ApiError` wrapping `status`
    #[must_use]
    pub fn new(status: Status, details: Vec<String>) -> Self {
        Self { status, details }
    }

    /// the wrapped status
    #[must_use]
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// type urls of the attached error details
    #[must_use]
    pub fn details(&self) -> &[String] {
        &self.details
    }
}

impl From<googapis::google::rpc::Status> for ApiError {
    fn from(s: googapis::google::rpc::Status) -> Self {
        let details = s.details.iter().map(|d| d.type_url.clone()).collect();
        Self::new(Status::new(Code::from_i32(s.code), s.message), details)
    }
}

/// A non success status from a REST endpoint
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("HTTP {status}: {message}")]
pub struct HttpError {
    /// HTTP status code
    pub status: u16,
    /// response body or reason
    pub message: String,
}

/// Checks if any error in the chain of `err` is an `HttpError` with the given `code`
#[must_use]
pub fn has_status_code(err: &anyhow::Error, code: u16) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<HttpError>())
        .any(|e| e.status == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn status_code_is_found_in_chain() {
        let err = anyhow::Error::new(HttpError {
            status: 404,
            message: "Not found: Dataset p:d".to_string(),
        })
        .context("fetching dataset");
        assert!(has_status_code(&err, 404));
        assert!(!has_status_code(&err, 403));
        assert!(!has_status_code(&anyhow::anyhow!("404"), 404));
    }

    #[test]
    fn api_error_from_rpc_status() {
        let e = ApiError::from(googapis::google::rpc::Status {
            code: 10,
            message: "connection TTL exceeded".to_string(),
            details: vec![prost_types::Any {
                type_url: "type.googleapis.com/google.cloud.bigquery.storage.v1.StorageError"
                    .to_string(),
                value: vec![],
            }],
        });
        assert_eq!(e.status().code(), Code::Aborted);
        assert_eq!(e.details().len(), 1);
        assert!(e.to_string().contains("Aborted"));
    }

    #[test]
    fn append_error_is_transparent() -> anyhow::Result<()> {
        let inner: anyhow::Result<()> = Err(Status::permission_denied("nope").into());
        let err = Error::Append(inner.context("append").err().context("no error")?);
        assert_eq!(err.to_string(), "append");
        Ok(())
    }
}

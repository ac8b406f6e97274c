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

use gouth::Token;
use std::sync::Arc;
use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::{Request, Status};

/// Where to get credentials from
#[derive(Clone, PartialEq, Eq)]
pub enum TokenSrc {
    /// Service account JSON
    Json(String),
    /// Application default credentials
    Env,
    /// No credentials at all, for emulators
    Anonymous,
}

impl std::fmt::Debug for TokenSrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // the blob holds a private key
            Self::Json(_) => f.write_str("Json(<redacted>)"),
            Self::Env => f.write_str("Env"),
            Self::Anonymous => f.write_str("Anonymous"),
        }
    }
}

impl TokenSrc {
    /// `Json` for a non empty credentials blob, `Env` otherwise
    pub(crate) fn from_credentials(credentials_json: &str) -> Self {
        if credentials_json.trim().is_empty() {
            Self::Env
        } else {
            Self::Json(credentials_json.to_string())
        }
    }

    pub(crate) fn to_token(&self) -> anyhow::Result<Token> {
        Ok(match self {
            TokenSrc::Json(json) => gouth::Builder::new().json(json.clone()).build()?,
            TokenSrc::Env => gouth::Token::new()?,
            TokenSrc::Anonymous => anyhow::bail!("no credentials for anonymous access"),
        })
    }
}

pub(crate) trait TokenProvider: Clone + Send + From<TokenSrc> + 'static {
    fn get_token(&mut self) -> ::std::result::Result<Arc<String>, Status>;
}

pub(crate) struct GouthTokenProvider {
    pub(crate) gouth_token: Option<Token>,
    pub(crate) src: TokenSrc,
}

impl std::fmt::Debug for GouthTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GouthTokenProvider")
            .field("gouth_token", &self.gouth_token.is_some())
            .field("src", &self.src)
            .finish()
    }
}

impl Clone for GouthTokenProvider {
    fn clone(&self) -> Self {
        Self {
            gouth_token: None,
            src: self.src.clone(),
        }
    }
}

impl From<TokenSrc> for GouthTokenProvider {
    fn from(src: TokenSrc) -> Self {
        Self {
            gouth_token: None,
            src,
        }
    }
}

impl TokenProvider for GouthTokenProvider {
    fn get_token(&mut self) -> ::std::result::Result<Arc<String>, Status> {
        if self.src == TokenSrc::Anonymous {
            return Ok(Arc::new(String::new()));
        }
        let token = if let Some(ref token) = self.gouth_token {
            token
        } else {
            let new_token = self
                .src
                .to_token()
                .map_err(|e| Status::unavailable(format!("Failed to read Google Token: {e}")))?;

            self.gouth_token.get_or_insert(new_token)
        };

        token.header_value().map_err(|e| {
            Status::unavailable(format!("Failed to read the Google Token header value: {e}"))
        })
    }
}

#[derive(Clone)]
pub(crate) struct AuthInterceptor<T>
where
    T: TokenProvider,
{
    pub(crate) token_provider: T,
}

impl<T> Interceptor for AuthInterceptor<T>
where
    T: TokenProvider,
{
    fn call(&mut self, mut request: Request<()>) -> ::std::result::Result<Request<()>, Status> {
        let header_value = self.token_provider.get_token()?;
        if header_value.is_empty() {
            return Ok(request);
        }
        let metadata_value = match MetadataValue::from_str(header_value.as_str()) {
            Ok(val) => val,
            Err(e) => {
                error!("Failed to get token: {}", e);

                return Err(Status::unavailable(
                    "Failed to retrieve authentication token.",
                ));
            }
        };
        request
            .metadata_mut()
            .insert("authorization", metadata_value);

        Ok(request)
    }
}

#[derive(Deserialize)]
struct ServiceAccountProject {
    #[serde(default)]
    project_id: Option<String>,
}

/// the `project_id` of a service account JSON blob
pub(crate) fn project_from_credentials(credentials_json: &str) -> Option<String> {
    let mut data = credentials_json.as_bytes().to_vec();
    simd_json::serde::from_slice::<ServiceAccountProject>(&mut data)
        .ok()
        .and_then(|sa| sa.project_id)
        .filter(|p| !p.is_empty())
}

/// Detects the project to use when none is configured.
///
/// Looks at the explicit credentials, then `GOOGLE_CLOUD_PROJECT`, then the
/// file `GOOGLE_APPLICATION_CREDENTIALS` points to.
pub(crate) fn detect_project_id(credentials_json: &str) -> Option<String> {
    project_from_credentials(credentials_json)
        .or_else(|| {
            std::env::var("GOOGLE_CLOUD_PROJECT")
                .ok()
                .filter(|p| !p.is_empty())
        })
        .or_else(|| {
            let path = std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok()?;
            let data = std::fs::read_to_string(path).ok()?;
            project_from_credentials(&data)
        })
}

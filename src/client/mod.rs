//! # Admin Client
//!
//! Typed client for the admin API under `/api/v1/<resource>`. Responses arrive wrapped as
//! `{statusCode, count, data}`; anything at or above 300 becomes a [`ClientError`].
//!
//! ```rust,ignore
//! let client = AdminClient::new(
//!     "localhost:9080",
//!     ClientOptions::new().with_basic_auth("admin", "secret").with_follow_redirect(true),
//! )?;
//! let services = client.list_services("default").await?;
//! ```

mod resources;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

pub const API_PREFIX: &str = "/api/v1";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid base url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("host is empty")]
    EmptyHost,

    #[error("redirect from server; retry with the --follow flag")]
    Redirect,

    #[error("{status} error from server{}", message_suffix(.message))]
    Status { status: u16, message: Option<String> },

    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

fn message_suffix(message: &Option<String>) -> String {
    message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default()
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Options applied when building an [`AdminClient`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    http_client: Option<Client>,
    basic_auth: Option<(String, String)>,
    user_agent: Option<String>,
    follow_redirect: bool,
    verbose: bool,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client. Its redirect policy is kept as is; redirects that reach
    /// the admin client are still reported unless following is enabled.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_follow_redirect(mut self, follow: bool) -> Self {
        self.follow_redirect = follow;
        self
    }

    pub fn with_verbose_logging(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Auth and user agent applied to every outgoing request.
#[derive(Debug, Clone, Default)]
struct RequestDecorator {
    basic_auth: Option<(String, String)>,
    user_agent: Option<String>,
}

impl RequestDecorator {
    fn decorate(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some((username, password)) = &self.basic_auth {
            request = request.basic_auth(username, Some(password));
        }
        if let Some(user_agent) = &self.user_agent {
            request = request.header(reqwest::header::USER_AGENT, user_agent);
        }
        request
    }
}

/// `{statusCode, count, data}` envelope; only `data` is read.
#[derive(Debug, Deserialize)]
struct ResponseWrapper<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ListWrapper<T> {
    #[serde(default = "Option::default")]
    data: Option<Vec<T>>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error: String,
}

#[derive(Debug, Serialize)]
struct DeleteBody<'a> {
    name: &'a str,
    namespace: &'a str,
}

#[derive(Debug, Clone)]
pub struct AdminClient {
    client: Client,
    base_url: String,
    decorator: RequestDecorator,
    follow_redirect: bool,
    verbose: bool,
}

impl AdminClient {
    /// Create a client for `base_url`. A missing scheme defaults to `http://`.
    pub fn new(base_url: &str, options: ClientOptions) -> ClientResult<Self> {
        let base_url = normalize_base_url(base_url)?;
        let client = match options.http_client {
            Some(client) => client,
            None => {
                let policy = if options.follow_redirect {
                    reqwest::redirect::Policy::default()
                } else {
                    reqwest::redirect::Policy::none()
                };
                Client::builder().redirect(policy).build()?
            }
        };
        Ok(Self {
            client,
            base_url,
            decorator: RequestDecorator {
                basic_auth: options.basic_auth,
                user_agent: options.user_agent,
            },
            follow_redirect: options.follow_redirect,
            verbose: options.verbose,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.url(path);
        debug!(method = %method, url = %url, "admin request");
        self.decorator.decorate(self.client.request(method, url))
    }

    async fn send(&self, request: RequestBuilder) -> ClientResult<Response> {
        let started = Instant::now();
        let response = request.send().await?;
        if self.verbose {
            info!(
                version = ?response.version(),
                url = %response.url(),
                status = %response.status(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "admin response"
            );
        }
        self.check_status(response).await
    }

    async fn check_status(&self, response: Response) -> ClientResult<Response> {
        let status = response.status();
        if status.as_u16() < 300 {
            return Ok(response);
        }
        if status.as_u16() < 400 && !self.follow_redirect {
            return Err(ClientError::Redirect);
        }
        let message = response
            .text()
            .await
            .ok()
            .and_then(|body| serde_json::from_str::<ApiError>(&body).ok())
            .map(|e| e.error)
            .filter(|e| !e.is_empty());
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_one<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> ClientResult<T> {
        let response = self.send(self.request(Method::GET, path).query(query)).await?;
        let body = response.bytes().await?;
        let wrapper: ResponseWrapper<T> = serde_json::from_slice(&body)?;
        Ok(wrapper.data)
    }

    async fn get_list<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> ClientResult<Vec<T>> {
        let response = self.send(self.request(Method::GET, path).query(query)).await?;
        let body = response.bytes().await?;
        let wrapper: ListWrapper<T> = serde_json::from_slice(&body)?;
        Ok(wrapper.data.unwrap_or_default())
    }

    async fn put<T: Serialize + ?Sized>(&self, path: &str, item: &T) -> ClientResult<()> {
        self.send(self.request(Method::PUT, path).json(item)).await?;
        Ok(())
    }

    async fn delete_named(&self, path: &str, name: &str, namespace: &str) -> ClientResult<()> {
        let body = DeleteBody { name, namespace };
        self.send(self.request(Method::DELETE, path).json(&body)).await?;
        Ok(())
    }

    async fn delete_path(&self, path: &str, query: &[(&str, &str)]) -> ClientResult<()> {
        self.send(self.request(Method::DELETE, path).query(query)).await?;
        Ok(())
    }
}

fn normalize_base_url(raw: &str) -> ClientResult<String> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };
    let url = url::Url::parse(&with_scheme).map_err(|e| match e {
        url::ParseError::EmptyHost => ClientError::EmptyHost,
        other => ClientError::InvalidUrl {
            url: raw.to_string(),
            reason: other.to_string(),
        },
    })?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ClientError::EmptyHost);
    }
    let mut base = url.to_string();
    if let Some(query_start) = base.find(['?', '#']) {
        base.truncate(query_start);
    }
    Ok(base.trim_end_matches('/').to_string())
}

/// True when the server answered 404.
pub fn is_not_found(err: &ClientError) -> bool {
    err.status() == Some(StatusCode::NOT_FOUND.as_u16())
}

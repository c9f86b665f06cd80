//! Entry point that picks endpoints and opens sessions.

use tracing::debug;

use crate::config::{endpoint_for, AccountType, SessionConfig, SessionMode};
use crate::error::XapiError;
use crate::session::{Session, StreamSessionId};
use crate::transport;

/// Opens command and streaming sessions for one account type.
#[derive(Clone, Debug)]
pub struct XapiClient {
    account: AccountType,
    command_endpoint: Option<String>,
    stream_endpoint: Option<String>,
    config: SessionConfig,
}

impl XapiClient {
    pub fn new(account: AccountType) -> Self {
        Self {
            account,
            command_endpoint: None,
            stream_endpoint: None,
            config: SessionConfig::default(),
        }
    }

    /// Sets an explicit endpoint for one session mode.
    ///
    /// The override takes precedence over the account's service endpoint.
    pub fn with_endpoint(mut self, mode: SessionMode, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end().to_string();
        match mode {
            SessionMode::Command => self.command_endpoint = Some(endpoint),
            SessionMode::Streaming => self.stream_endpoint = Some(endpoint),
        }
        self
    }

    /// Timing configuration applied to every session opened afterwards.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn account(&self) -> AccountType {
        self.account
    }

    pub fn endpoint(&self, mode: SessionMode) -> &str {
        let override_endpoint = match mode {
            SessionMode::Command => self.command_endpoint.as_deref(),
            SessionMode::Streaming => self.stream_endpoint.as_deref(),
        };
        override_endpoint.unwrap_or_else(|| endpoint_for(self.account, mode))
    }

    pub async fn connect_command(&self) -> Result<Session, XapiError> {
        self.connect(SessionMode::Command).await
    }

    /// Opens a streaming session with no stream session id bound yet.
    pub async fn connect_stream(&self) -> Result<Session, XapiError> {
        self.connect(SessionMode::Streaming).await
    }

    /// Opens a streaming session and binds `stream_session_id` to it.
    pub async fn connect_stream_with(
        &self,
        stream_session_id: StreamSessionId,
    ) -> Result<Session, XapiError> {
        let session = self.connect(SessionMode::Streaming).await?;
        session.bind_stream_session(stream_session_id)?;
        Ok(session)
    }

    async fn connect(&self, mode: SessionMode) -> Result<Session, XapiError> {
        self.config.validate()?;
        let url = self.endpoint(mode);
        debug!(event = "session_connecting", mode = %mode, url);
        let socket = transport::open(url).await?;
        Session::from_stream(socket, mode, self.config.clone()).await
    }
}

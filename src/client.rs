use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, error, trace};

use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::{
    ACTION_ENDPOINT, API_KEY_PARAM, CLIMATE_ENDPOINT, FLASH_QUERY, UPDATE_ENDPOINT,
    is_success_status, normalize_response, zone_query,
};
use crate::types::ParamMap;
use crate::{Error, Result};

/// Thin wrapper over the shared HTTP session: one GET per call, a fixed
/// timeout per call, and status classification (401 apart from the rest).
pub(crate) struct DeviceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: RwLock<Option<String>>,
    logger: Option<Mutex<MessageLogger>>,
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Http(e)
    }
}

impl DeviceClient {
    pub fn new(
        host: &str,
        port: u16,
        api_key: Option<String>,
        message_log: Option<(MessageLogMode, String)>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        let logger = match message_log {
            Some((mode, path)) => Some(Mutex::new(MessageLogger::new(mode, path)?)),
            None => None,
        };
        Ok(Self {
            http,
            base_url: format!("http://{host}:{port}"),
            api_key: RwLock::new(api_key),
            logger,
        })
    }

    pub fn set_api_key(&self, api_key: Option<String>) {
        *self.api_key.write().unwrap_or_else(PoisonError::into_inner) = api_key;
    }

    fn with_logger(&self, f: impl FnOnce(&mut MessageLogger)) {
        if let Some(logger) = &self.logger {
            f(&mut logger.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }

    async fn get(&self, endpoint: &str, query: &str, timeout: Duration) -> Result<(u16, String)> {
        self.with_logger(|l| l.log_request(endpoint, query));

        let api_key = self
            .api_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let url = format!("{}{}?{}", self.base_url, endpoint, query);
        trace!(endpoint, query, "GET");

        let mut request = self.http.get(&url).timeout(timeout);
        if let Some(key) = api_key.as_deref() {
            // Percent-encoded, unlike the rest of the query.
            request = request.query(&[(API_KEY_PARAM, key)]);
        }
        let resp = request
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;
        Ok((status.as_u16(), body))
    }

    fn classify(status: u16) -> Result<()> {
        match StatusCode::from_u16(status) {
            Ok(StatusCode::OK) => Ok(()),
            Ok(StatusCode::UNAUTHORIZED) => Err(Error::Auth),
            _ => Err(Error::Status(status)),
        }
    }

    /// Reads the given zones (and the common block) as one flat map.
    pub async fn query<'a>(
        &self,
        phase: &str,
        zones: impl IntoIterator<Item = &'a str>,
        include_common: bool,
        timeout: Duration,
    ) -> Result<ParamMap> {
        let query = zone_query(zones, include_common);
        let (status, body) = self.get(CLIMATE_ENDPOINT, &query, timeout).await?;
        if let Err(e) = Self::classify(status) {
            self.with_logger(|l| l.log_poll(phase, status, None));
            return Err(e);
        }
        let params = normalize_response(&body)?;
        self.with_logger(|l| l.log_poll(phase, status, Some(&params)));
        debug!(phase, keys = params.len(), "poll answered");
        Ok(params)
    }

    /// Sends one action command. `Ok` only when the controller confirmed it;
    /// the returned map is the whole response body, `status` included.
    pub async fn action(&self, command: &str, timeout: Duration) -> Result<ParamMap> {
        let (status, body) = self.get(ACTION_ENDPOINT, command, timeout).await?;
        if let Err(e) = Self::classify(status) {
            self.with_logger(|l| l.log_command(command, status, None));
            return Err(e);
        }
        let response = normalize_response(&body)?;
        self.with_logger(|l| l.log_command(command, status, Some(&response)));
        if !is_success_status(&response) {
            error!(command, response = %body, "command rejected by controller");
            return Err(Error::Rejected(body));
        }
        Ok(response)
    }

    pub async fn flash_firmware(&self, timeout: Duration) -> Result<()> {
        let (status, _) = self.get(UPDATE_ENDPOINT, FLASH_QUERY, timeout).await?;
        self.with_logger(|l| l.log_command(FLASH_QUERY, status, None));
        Self::classify(status)
    }
}

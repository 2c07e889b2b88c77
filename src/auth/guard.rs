use std::sync::Arc;

use reqwest::header::COOKIE;
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{info, warn};
use url::Url;

use super::AuthStore;
use crate::config::ClientConfig;
use crate::errors::{AuthFailure, ChatError, Result};
use crate::models::TokenPair;

pub const REFRESH_PATH: &str = "/api/v1/user/refresh";

/// Runs one outbound request with bearer auth and at most one refresh cycle.
///
/// On a 401 the stored refresh token is exchanged for a new pair, the store
/// is updated and the request is rebuilt and sent once more. A missing
/// refresh token, a failed refresh or a second 401 logs the user out and
/// fails with [`ChatError::Auth`].
#[derive(Clone)]
pub struct TokenGuard {
    http: reqwest::Client,
    refresh_url: Url,
    store: Arc<dyn AuthStore>,
}

impl TokenGuard {
    pub fn new(http: reqwest::Client, config: &ClientConfig, store: Arc<dyn AuthStore>) -> Result<Self> {
        Ok(Self {
            http,
            refresh_url: config.endpoint(REFRESH_PATH)?,
            store,
        })
    }

    /// `build` is called once per attempt so the body can be re-sent.
    /// The returned response may still carry a non-success status other
    /// than 401; checking it is up to the caller.
    pub async fn execute<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let response = send(&build, self.store.access_token()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        info!("Access token rejected, attempting refresh");
        let Some(refresh_token) = self.store.refresh_token() else {
            warn!("No refresh token available, logging out");
            self.store.logout();
            return Err(AuthFailure::NoRefreshToken.into());
        };

        let pair = match self.refresh(&refresh_token).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Token refresh failed, logging out: {e}");
                self.store.logout();
                return Err(AuthFailure::RefreshFailed.into());
            }
        };
        let access_token = pair.access_token.clone();
        self.store.set_tokens(pair.access_token, pair.refresh_token);

        let retried = send(&build, Some(access_token)).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            warn!("Request rejected again after refresh, logging out");
            self.store.logout();
            return Err(AuthFailure::RefreshFailed.into());
        }
        Ok(retried)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let response = self
            .http
            .post(self.refresh_url.clone())
            .header(COOKIE, format!("refresh_token={refresh_token}"))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ChatError::Status {
                status: response.status().as_u16(),
            });
        }
        let pair = response.json::<TokenPair>().await?;
        info!("Access token refreshed");
        Ok(pair)
    }
}

async fn send<F>(build: &F, access_token: Option<String>) -> Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut request = build();
    if let Some(token) = access_token {
        request = request.bearer_auth(token);
    }
    Ok(request.send().await?)
}

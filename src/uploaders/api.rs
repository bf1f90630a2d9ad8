use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::config::ApiConfig;
use crate::core::{Result, TransferError};

/// 后端 API 客户端，负责拼接地址、附加请求头和检查状态码
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client,
    base_url: Url,
}

impl BackendClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(user_id) = &config.user_id {
            headers.insert("X-User-Id", HeaderValue::from_str(user_id)?);
        }
        if let Some(token) = &config.token {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token))?);
        }

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;

        Self::with_client(client, &config.base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self> {
        // join 需要末尾的斜杠，否则会丢掉最后一段路径
        let mut base = base_url.trim_end_matches('/').to_string();
        base.push('/');
        Ok(Self {
            client,
            base_url: Url::parse(&base)?,
        })
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// POST JSON，非 2xx 转为 ServerError
    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response> {
        let url = self.endpoint(path)?;
        let response = self.client.post(url).json(body).send().await?;
        check_status(response).await
    }

    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.post(path, body).await?;
        response
            .json::<R>()
            .await
            .map_err(|e| TransferError::InvalidResponse(e.to_string()))
    }
}

pub async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(TransferError::server_error(status.as_u16(), message))
}

//! Object storage collaborator boundary.
//!
//! The core only ever sees opaque string keys; the bytes live with the
//! storage service. `HttpStorage` talks to the real blob store, while
//! `InMemoryStorage` backs local development and tests when no store is
//! configured.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Storage: Send + Sync {
    async fn store(&self, bytes: Vec<u8>, content_type: &str) -> Result<String>;
    async fn fetch(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// HTTP-backed blob store client.
pub struct HttpStorage {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStorage {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl Storage for HttpStorage {
    async fn store(&self, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let response = self
            .authorized(self.http.post(format!("{}/objects", self.base_url)))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("storage store request failed")?
            .error_for_status()
            .context("storage rejected store request")?;

        let body: serde_json::Value = response.json().await.context("storage returned invalid JSON")?;
        body.pointer("/key")
            .and_then(|value| value.as_str())
            .map(ToString::to_string)
            .context("storage response missing object key")
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .authorized(self.http.get(format!("{}/objects/{}", self.base_url, key)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("storage fetch request failed")?
            .error_for_status()
            .context("storage rejected fetch request")?;

        Ok(response.bytes().await.context("storage fetch body failed")?.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.authorized(self.http.delete(format!("{}/objects/{}", self.base_url, key)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("storage delete request failed")?
            .error_for_status()
            .context("storage rejected delete request")?;

        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let response = self
            .authorized(
                self.http
                    .post(format!("{}/objects/{}/signed-url", self.base_url, key)),
            )
            .json(&serde_json::json!({ "ttl_secs": ttl.as_secs() }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("storage signed-url request failed")?
            .error_for_status()
            .context("storage rejected signed-url request")?;

        let body: serde_json::Value = response.json().await.context("storage returned invalid JSON")?;
        body.pointer("/url")
            .and_then(|value| value.as_str())
            .map(ToString::to_string)
            .context("storage response missing signed url")
    }
}

/// In-memory store used when `STORAGE_BASE_URL` is unset. Data does not
/// survive a restart.
#[derive(Default)]
pub struct InMemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn store(&self, bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        let key = format!("obj_{}", Uuid::new_v4().simple());
        self.objects
            .lock()
            .expect("storage map poisoned")
            .insert(key.clone(), bytes);
        Ok(key)
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .expect("storage map poisoned")
            .get(key)
            .cloned()
            .with_context(|| format!("object {key} not found"))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().expect("storage map poisoned").remove(key);
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!("memory://{key}?ttl={}", ttl.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_round_trip() {
        let storage = InMemoryStorage::new();
        let key = storage.store(b"clip".to_vec(), "video/mp4").await.unwrap();

        assert_eq!(storage.fetch(&key).await.unwrap(), b"clip");

        storage.delete(&key).await.unwrap();
        assert!(storage.fetch(&key).await.is_err());
    }

    #[tokio::test]
    async fn signed_url_embeds_key_and_ttl() {
        let storage = InMemoryStorage::new();
        let key = storage.store(b"clip".to_vec(), "video/mp4").await.unwrap();
        let url = storage.signed_url(&key, Duration::from_secs(600)).await.unwrap();

        assert!(url.contains(&key));
        assert!(url.ends_with("ttl=600"));
    }
}

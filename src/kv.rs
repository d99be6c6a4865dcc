use std::time::Duration;

use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;

use crate::cache::CacheBackend;
use crate::error::KiraError;
use crate::http::{build_client, send_with_retries};

const KV_RETRIES: u32 = 1;

/// Remote key-value cache: `GET/PUT/DELETE {base}/{key}` and
/// `DELETE {base}?prefix=...` for scoped deletes. A 404 is a miss.
#[derive(Debug, Clone)]
pub struct HttpKvBackend {
    client: Client,
    base: Url,
}

#[derive(Debug, Deserialize)]
struct DeleteCount {
    #[serde(default)]
    deleted: usize,
}

impl HttpKvBackend {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, KiraError> {
        let base = Url::parse(base)
            .map_err(|err| KiraError::InvalidConfig(format!("cache url `{base}`: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(KiraError::InvalidConfig(format!(
                "cache url `{base}` cannot be used as a base"
            )));
        }
        Ok(Self {
            client: build_client(timeout)?,
            base,
        })
    }

    pub fn url_for(&self, key: &str) -> Result<Url, KiraError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| KiraError::CacheUnavailable(format!("invalid cache url {}", self.base)))?
            .pop_if_empty()
            .extend(key.split('/'));
        Ok(url)
    }
}

fn unavailable(action: &str, err: impl std::fmt::Display) -> KiraError {
    KiraError::CacheUnavailable(format!("{action}: {err}"))
}

impl CacheBackend for HttpKvBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KiraError> {
        let url = self.url_for(key)?;
        let resp = send_with_retries(|| self.client.get(url.clone()), KV_RETRIES)
            .map_err(|err| unavailable("get", err))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => resp
                .bytes()
                .map(|bytes| Some(bytes.to_vec()))
                .map_err(|err| unavailable("get", err)),
            status => Err(unavailable("get", status)),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), KiraError> {
        let url = self.url_for(key)?;
        let resp = send_with_retries(
            || {
                self.client
                    .put(url.clone())
                    .header(CONTENT_TYPE, "application/json")
                    .body(value.to_vec())
            },
            KV_RETRIES,
        )
        .map_err(|err| unavailable("put", err))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(unavailable("put", resp.status()))
        }
    }

    fn delete(&self, key: &str) -> Result<(), KiraError> {
        let url = self.url_for(key)?;
        let resp = send_with_retries(|| self.client.delete(url.clone()), KV_RETRIES)
            .map_err(|err| unavailable("delete", err))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(unavailable("delete", status)),
        }
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, KiraError> {
        let mut url = self.base.clone();
        url.query_pairs_mut().append_pair("prefix", prefix);
        let resp = send_with_retries(|| self.client.delete(url.clone()), KV_RETRIES)
            .map_err(|err| unavailable("delete", err))?;
        if !resp.status().is_success() {
            return Err(unavailable("delete", resp.status()));
        }
        let body = resp.text().map_err(|err| unavailable("delete", err))?;
        Ok(serde_json::from_str::<DeleteCount>(&body)
            .map(|count| count.deleted)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn keys_become_path_segments() {
        let backend =
            HttpKvBackend::new("http://cache.local/kv/", Duration::from_secs(1)).unwrap();
        let url = backend.url_for("targets/chembl/abc").unwrap();
        assert_eq!(url.as_str(), "http://cache.local/kv/targets/chembl/abc");

        let backend = HttpKvBackend::new("http://cache.local/kv", Duration::from_secs(1)).unwrap();
        let url = backend.url_for("disease/omim/x y").unwrap();
        assert_eq!(url.as_str(), "http://cache.local/kv/disease/omim/x%20y");
    }

    #[test]
    fn rejects_non_base_url() {
        assert_matches!(
            HttpKvBackend::new("mailto:cache@example.org", Duration::from_secs(1)),
            Err(KiraError::InvalidConfig(_))
        );
    }

    #[test]
    fn unreachable_server_is_unavailable() {
        let backend = HttpKvBackend::new("http://127.0.0.1:1/kv", Duration::from_secs(1)).unwrap();
        assert_matches!(backend.get("targets/a/b"), Err(KiraError::CacheUnavailable(_)));
    }
}

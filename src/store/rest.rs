//! PostgREST-style client for the persistence store

use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};

use super::StoreError;

/// Store client authenticated with the service key
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    service_key: String,
}

impl RestClient {
    pub fn new(base_url: &str, service_key: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        }
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", "application/json")
    }

    async fn check(response: Response) -> Result<Response, StoreError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// GET a single row, `None` when nothing matches
    pub async fn get_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> Result<Option<T>, StoreError> {
        let url = format!("{}?{}", self.rest_url(table), query);
        let response = self
            .authorized(self.client.get(&url))
            .header("Accept", "application/vnd.pgrst.object+json")
            .send()
            .await
            .map_err(StoreError::Request)?;

        // PostgREST answers 406 when the object query matched no rows
        if response.status() == reqwest::StatusCode::NOT_ACCEPTABLE {
            return Ok(None);
        }

        Self::check(response)
            .await?
            .json()
            .await
            .map(Some)
            .map_err(StoreError::Parse)
    }

    /// Call a stored procedure, discarding its result
    pub async fn rpc<T: Serialize>(&self, function: &str, args: &T) -> Result<(), StoreError> {
        let url = self.rest_url(&format!("rpc/{}", function));
        let response = self
            .authorized(self.client.post(&url))
            .header("Prefer", "return=minimal")
            .json(args)
            .send()
            .await
            .map_err(StoreError::Request)?;

        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_built_under_rest_root() {
        let client = RestClient::new("http://db.local/", "key");
        assert_eq!(client.rest_url("maps"), "http://db.local/rest/v1/maps");
        assert_eq!(
            client.rest_url("rpc/update_user_stats"),
            "http://db.local/rest/v1/rpc/update_user_stats"
        );
    }
}

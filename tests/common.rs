//! Shared test host: a real server on an ephemeral port plus a
//! reqwest client.

use std::sync::Arc;

use syncstore::config::Settings;
use syncstore::server::{AppState, Authenticator, InsecureAuthenticator, router};
use syncstore::storage::SyncStorage;

/// A running syncstore server for black-box tests.
pub struct TestHost {
    base_url: String,
    client: reqwest::Client,
    server: tokio::task::JoinHandle<()>,
}

/// Builder for [`TestHost`] with test-friendly defaults: one in-memory
/// shard, no quota, no write cap.
pub struct TestHostBuilder {
    settings: Settings,
    authenticator: Arc<dyn Authenticator>,
}

impl TestHost {
    pub fn builder() -> TestHostBuilder {
        let mut settings = Settings::default();
        settings.storage.shards = vec![":memory:".to_string()];
        TestHostBuilder {
            settings,
            authenticator: Arc::new(InsecureAuthenticator),
        }
    }

    /// Starts a host with default settings.
    pub async fn start() -> Self {
        Self::builder().start().await
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.expect("GET failed")
    }

    pub async fn get_with_headers(
        &self,
        path: &str,
        headers: &[(&str, &str)],
    ) -> reqwest::Response {
        let mut request = self.client.get(self.url(path));
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        request.send().await.expect("GET failed")
    }

    pub async fn put(&self, path: &str, body: &str) -> reqwest::Response {
        self.put_with_headers(path, body, &[]).await
    }

    pub async fn put_with_headers(
        &self,
        path: &str,
        body: &str,
        headers: &[(&str, &str)],
    ) -> reqwest::Response {
        let mut request = self
            .client
            .put(self.url(path))
            .header("Content-Type", "application/json")
            .body(body.to_string());
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        request.send().await.expect("PUT failed")
    }

    pub async fn post(&self, path: &str, body: &str) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .expect("POST failed")
    }

    pub async fn delete(&self, path: &str) -> reqwest::Response {
        self.delete_with_headers(path, &[]).await
    }

    pub async fn delete_with_headers(
        &self,
        path: &str,
        headers: &[(&str, &str)],
    ) -> reqwest::Response {
        let mut request = self.client.delete(self.url(path));
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        request.send().await.expect("DELETE failed")
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl TestHostBuilder {
    pub fn with_settings(mut self, configure: impl FnOnce(&mut Settings)) -> Self {
        configure(&mut self.settings);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub async fn start(self) -> TestHost {
        let storage = SyncStorage::open(&self.settings).expect("Failed to open storage");
        let state = AppState::new(storage, self.settings, self.authenticator);
        let app = router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Failed to read local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server failed");
        });

        TestHost {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            server,
        }
    }
}

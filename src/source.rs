// file: source.rs
// desc: fetch serialized model bytes from wherever they are served

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use crate::config::AppConfig;
use crate::error::LoadError;

/// Raw model bytes from some location.
///
/// The returned future is `'static` so it can outlive the borrow of the
/// source and be shared between waiters.
pub trait ModelSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'static, Result<Vec<u8>, LoadError>>;

    /// Shown in logs.
    fn describe(&self) -> String;
}

/// Downloads the model with a plain GET.
#[derive(Debug, Clone)]
pub struct HttpModelSource {
    url: String,
    timeout: Duration,
}

impl HttpModelSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.model_url.clone(), config.fetch_timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ModelSource for HttpModelSource {
    #[cfg(not(target_family = "wasm"))]
    fn fetch(&self) -> BoxFuture<'static, Result<Vec<u8>, LoadError>> {
        download(self.url.clone(), self.timeout).boxed()
    }

    // reqwest futures on wasm are not Send, so the download runs on the
    // local executor and only its result crosses over. The browser fetch
    // has no timeout of its own; a window timer races it instead.
    #[cfg(target_family = "wasm")]
    fn fetch(&self) -> BoxFuture<'static, Result<Vec<u8>, LoadError>> {
        use futures::future::{Either, select};

        let (tx, rx) = futures::channel::oneshot::channel();
        let url = self.url.clone();
        let timeout = self.timeout;

        wasm_bindgen_futures::spawn_local(async move {
            let download = download(url.clone(), timeout).boxed_local();
            let outcome = match select(download, timer::sleep(timeout).boxed_local()).await {
                Either::Left((outcome, _)) => outcome,
                Either::Right(((), _)) => {
                    log::warn!("Model download from {} exceeded {:?}", url, timeout);
                    Err(LoadError::TimedOut { url })
                }
            };
            let _ = tx.send(outcome);
        });

        async move { rx.await.unwrap_or(Err(LoadError::Cancelled)) }.boxed()
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

async fn download(url: String, timeout: Duration) -> Result<Vec<u8>, LoadError> {
    let fetch_error = |err: reqwest::Error| {
        if err.is_timeout() {
            LoadError::TimedOut { url: url.clone() }
        } else {
            LoadError::Fetch {
                url: url.clone(),
                reason: err.to_string(),
            }
        }
    };

    let client = client_builder(timeout).build().map_err(fetch_error)?;

    log::debug!("GET {}", url);
    let response = client.get(&url).send().await.map_err(fetch_error)?;

    let status = response.status();
    if !status.is_success() {
        return Err(LoadError::Status {
            url: url.clone(),
            status: status.as_u16(),
        });
    }

    let bytes = response.bytes().await.map_err(fetch_error)?;
    log::debug!("Fetched {} bytes from {}", bytes.len(), url);

    Ok(bytes.to_vec())
}

#[cfg(not(target_family = "wasm"))]
fn client_builder(timeout: Duration) -> reqwest::ClientBuilder {
    reqwest::Client::builder().timeout(timeout)
}

// enforced by the timer race in `fetch`
#[cfg(target_family = "wasm")]
fn client_builder(_timeout: Duration) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
}

#[cfg(target_family = "wasm")]
mod timer {
    use std::time::Duration;

    use wasm_bindgen::{JsCast, closure::Closure};

    /// Resolves after `duration` using the window timer. Never resolves
    /// outside a window context, leaving the fetch unbounded.
    pub async fn sleep(duration: Duration) {
        let (tx, rx) = futures::channel::oneshot::channel::<()>();

        let Some(window) = web_sys::window() else {
            log::warn!("No window available, model download has no timeout");
            return futures::future::pending().await;
        };

        let callback = Closure::once(move || {
            let _ = tx.send(());
        });
        let millis = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);

        if window
            .set_timeout_with_callback_and_timeout_and_arguments_0(
                callback.as_ref().unchecked_ref(),
                millis,
            )
            .is_err()
        {
            log::warn!("Failed to arm model download timeout");
            return futures::future::pending().await;
        }
        callback.forget();

        let _ = rx.await;
    }
}

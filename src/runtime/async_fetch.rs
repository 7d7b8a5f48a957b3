//! Async fetchers adapted to the synchronous fetch capability.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{Failure, Promise, ResourceFetcher};
use crate::runtime::TokioSpawner;

/// A fetcher written as an async function.
#[async_trait]
pub trait AsyncFetcher<T: Send + 'static>: Send + Sync + 'static {
    /// Fetch the resource named by `key`.
    ///
    /// # Errors
    ///
    /// Any error rejects the fetch promise.
    async fn fetch(&self, key: &str) -> Result<T, Failure>;
}

/// [`ResourceFetcher`] running an [`AsyncFetcher`] on a tokio runtime.
pub struct AsyncFetcherAdapter<A> {
    fetcher: Arc<A>,
    spawner: TokioSpawner,
}

impl<A> AsyncFetcherAdapter<A> {
    /// Run `fetcher` on `spawner`'s runtime.
    pub fn new(fetcher: A, spawner: TokioSpawner) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            spawner,
        }
    }

    /// Wrap the adapter for use as a default or per-group fetcher.
    pub fn into_shared<T>(self) -> Arc<dyn ResourceFetcher<T>>
    where
        T: Clone + Send + 'static,
        A: AsyncFetcher<T>,
    {
        Arc::new(self)
    }
}

impl<T, A> ResourceFetcher<T> for AsyncFetcherAdapter<A>
where
    T: Clone + Send + 'static,
    A: AsyncFetcher<T>,
{
    fn fetch(&self, key: &str) -> Promise<T> {
        let fetcher = Arc::clone(&self.fetcher);
        let key = key.to_owned();
        self.spawner
            .spawn_promise(async move { fetcher.fetch(&key).await })
    }
}

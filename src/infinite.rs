//! Infinite queries: data accumulated page by page.

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use futures::future::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::client::QueryClient;
use crate::data::{QueryData, QueryOutput};
use crate::key::QueryKey;
use crate::observer::{QueryObserver, QueryObserverResult, WeakObserver};
use crate::options::QueryOptions;
use crate::query::{FetchDirection, FetchMeta, FetchOptions, FetchStatus, QueryFn, QueryFnContext};
use crate::subscribable::Subscription;
use crate::QueryError;

/// Pages fetched so far and the parameter each was fetched with.
///
/// `pages[i]` was fetched with `page_params[i]`; the first page uses `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InfiniteData<P, PP> {
    /// Loaded pages, first to last.
    pub pages: Vec<P>,
    /// Parameter each page was fetched with.
    pub page_params: Vec<Option<PP>>,
}

impl<P, PP> Default for InfiniteData<P, PP> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

/// Arguments passed to a page function.
#[derive(Clone, Debug)]
pub struct InfiniteQueryFnContext<PP> {
    /// Key of the infinite query.
    pub query_key: QueryKey,
    /// Parameter of the page to fetch, `None` for the first page.
    pub page_param: Option<PP>,
    /// Which end of the list is being extended.
    pub direction: FetchDirection,
}

/// Computes the parameter of the page after (or before) the loaded ones.
/// Receives the last (or first) page and all pages; `None` means there are
/// no more pages.
pub type PageParamFn<P, PP> = Arc<dyn Fn(&P, &[P]) -> Option<PP> + Send + Sync>;

type PageFn<P, PP> =
    Arc<dyn Fn(InfiniteQueryFnContext<PP>) -> futures::future::BoxFuture<'static, anyhow::Result<P>> + Send + Sync>;

struct PageParams<P, PP> {
    next: Option<PageParamFn<P, PP>>,
    previous: Option<PageParamFn<P, PP>>,
}

impl<P, PP> Clone for PageParams<P, PP> {
    fn clone(&self) -> Self {
        Self {
            next: self.next.clone(),
            previous: self.previous.clone(),
        }
    }
}

impl<P, PP> PageParams<P, PP> {
    fn next_param(&self, pages: &[P]) -> Option<PP> {
        let next = self.next.as_ref()?;
        pages.last().and_then(|last| next(last, pages))
    }

    fn previous_param(&self, pages: &[P]) -> Option<PP> {
        let previous = self.previous.as_ref()?;
        pages.first().and_then(|first| previous(first, pages))
    }
}

/// Options of an infinite query over pages `P` with parameters `PP`.
pub struct InfiniteQueryOptions<P, PP, D = InfiniteData<P, PP>> {
    base: QueryOptions<InfiniteData<P, PP>, D>,
    page_fn: Option<PageFn<P, PP>>,
    params: PageParams<P, PP>,
}

impl<P, PP, D> Clone for InfiniteQueryOptions<P, PP, D> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            page_fn: self.page_fn.clone(),
            params: self.params.clone(),
        }
    }
}

impl<P, PP, D> fmt::Debug for InfiniteQueryOptions<P, PP, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryOptions")
            .field("base", &self.base)
            .field("has_next_fn", &self.params.next.is_some())
            .field("has_previous_fn", &self.params.previous.is_some())
            .finish_non_exhaustive()
    }
}

impl<P, PP> InfiniteQueryOptions<P, PP>
where
    P: QueryOutput + Clone,
    PP: QueryOutput + Clone,
{
    /// Options for the infinite query stored under `key`.
    pub fn new(key: impl Into<QueryKey>) -> Self {
        Self {
            base: QueryOptions::new(key),
            page_fn: None,
            params: PageParams {
                next: None,
                previous: None,
            },
        }
    }
}

impl<P, PP, D> InfiniteQueryOptions<P, PP, D>
where
    P: QueryOutput + Clone,
    PP: QueryOutput + Clone,
    D: Send + Sync + 'static,
{
    /// Fetch one page.
    pub fn query_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(InfiniteQueryFnContext<PP>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<P>> + Send + 'static,
    {
        self.page_fn = Some(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    /// Compute the parameter of the page after `last` from all loaded pages.
    /// `None` means there is no next page.
    pub fn get_next_page_param(
        mut self,
        f: impl Fn(&P, &[P]) -> Option<PP> + Send + Sync + 'static,
    ) -> Self {
        self.params.next = Some(Arc::new(f));
        self
    }

    /// Compute the parameter of the page before `first` from all loaded pages.
    /// `None` means there is no previous page.
    pub fn get_previous_page_param(
        mut self,
        f: impl Fn(&P, &[P]) -> Option<PP> + Send + Sync + 'static,
    ) -> Self {
        self.params.previous = Some(Arc::new(f));
        self
    }

    /// Adjust the underlying query options (stale time, retries, callbacks...).
    pub fn configure(
        mut self,
        f: impl FnOnce(QueryOptions<InfiniteData<P, PP>, D>) -> QueryOptions<InfiniteData<P, PP>, D>,
    ) -> Self {
        self.base = f(self.base);
        self
    }

    /// Transform the whole `InfiniteData` for observers; the cache keeps the
    /// untransformed pages.
    pub fn select<D2: Send + Sync + 'static>(
        self,
        f: impl Fn(&InfiniteData<P, PP>) -> D2 + Send + Sync + 'static,
    ) -> InfiniteQueryOptions<P, PP, D2> {
        InfiniteQueryOptions {
            base: self.base.select(f),
            page_fn: self.page_fn,
            params: self.params,
        }
    }

    /// The query key.
    pub fn key(&self) -> &QueryKey {
        self.base.key()
    }

    /// Plain query options whose query function runs the paging logic.
    fn into_query_options(self) -> QueryOptions<InfiniteData<P, PP>, D> {
        match self.page_fn {
            Some(page_fn) => self.base.raw_query_fn(paging_query_fn(page_fn, self.params)),
            None => self.base,
        }
    }
}

async fn fetch_page<P, PP>(
    page_fn: &PageFn<P, PP>,
    query_key: &QueryKey,
    page_param: Option<PP>,
    direction: FetchDirection,
) -> Result<P, QueryError> {
    let ctx = InfiniteQueryFnContext {
        query_key: query_key.clone(),
        page_param,
        direction,
    };
    Ok(page_fn(ctx).await?)
}

/// Wrap a page function into a query function that decides, from the fetch
/// meta and the cached pages, which page(s) to fetch.
fn paging_query_fn<P, PP>(page_fn: PageFn<P, PP>, params: PageParams<P, PP>) -> QueryFn
where
    P: QueryOutput + Clone,
    PP: QueryOutput + Clone,
{
    QueryFn::erased(move |ctx: QueryFnContext| {
        let page_fn = page_fn.clone();
        let params = params.clone();
        async move {
            let hash = ctx.query_key.hash();
            let cached = match &ctx.data {
                Some(data) => Some(data.downcast::<InfiniteData<P, PP>>(&hash)?),
                None => None,
            };
            let explicit = match ctx.meta.as_ref().and_then(|meta| meta.page_param.as_ref()) {
                Some(param) => Some(param.downcast::<PP>(&hash)?.as_ref().clone()),
                None => None,
            };
            let direction = ctx.meta.as_ref().map(|meta| meta.direction);
            let key = &ctx.query_key;

            let cached = match cached.filter(|data| !data.pages.is_empty()) {
                Some(cached) => cached,
                None => {
                    let page = fetch_page(&page_fn, key, None, FetchDirection::Forward).await?;
                    return Ok(QueryData::new(InfiniteData::<P, PP> {
                        pages: vec![page],
                        page_params: vec![None],
                    }));
                }
            };

            match direction {
                Some(FetchDirection::Forward) => {
                    let Some(param) = explicit.or_else(|| params.next_param(&cached.pages)) else {
                        return Ok(QueryData::from_arc(cached));
                    };
                    let page = fetch_page(&page_fn, key, Some(param.clone()), FetchDirection::Forward).await?;
                    let mut data = cached.as_ref().clone();
                    data.pages.push(page);
                    data.page_params.push(Some(param));
                    Ok(QueryData::new(data))
                }
                Some(FetchDirection::Backward) => {
                    let Some(param) = explicit.or_else(|| params.previous_param(&cached.pages)) else {
                        return Ok(QueryData::from_arc(cached));
                    };
                    let page = fetch_page(&page_fn, key, Some(param.clone()), FetchDirection::Backward).await?;
                    let mut data = cached.as_ref().clone();
                    data.pages.insert(0, page);
                    data.page_params.insert(0, Some(param));
                    Ok(QueryData::new(data))
                }
                None => {
                    // Refetch every loaded page in order, with the parameter it was loaded with.
                    tracing::debug!(query_hash = %hash, pages = cached.pages.len(), "refetching all pages");
                    let mut data = InfiniteData::default();
                    for param in &cached.page_params {
                        let page = fetch_page(&page_fn, key, param.clone(), FetchDirection::Forward).await?;
                        data.pages.push(page);
                        data.page_params.push(param.clone());
                    }
                    Ok(QueryData::new(data))
                }
            }
        }
        .boxed()
    })
}

/// An observer result plus paging state.
pub struct InfiniteQueryObserverResult<D> {
    /// The plain observer result, also reachable through `Deref`.
    pub result: QueryObserverResult<D>,
    /// `get_next_page_param` returned a parameter for the last page.
    pub has_next_page: bool,
    /// `get_previous_page_param` returned a parameter for the first page.
    pub has_previous_page: bool,
    /// A forward page fetch is running.
    pub is_fetching_next_page: bool,
    /// A backward page fetch is running.
    pub is_fetching_previous_page: bool,
}

impl<D> Clone for InfiniteQueryObserverResult<D> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            has_next_page: self.has_next_page,
            has_previous_page: self.has_previous_page,
            is_fetching_next_page: self.is_fetching_next_page,
            is_fetching_previous_page: self.is_fetching_previous_page,
        }
    }
}

impl<D> fmt::Debug for InfiniteQueryObserverResult<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryObserverResult")
            .field("result", &self.result)
            .field("has_next_page", &self.has_next_page)
            .field("has_previous_page", &self.has_previous_page)
            .field("is_fetching_next_page", &self.is_fetching_next_page)
            .field("is_fetching_previous_page", &self.is_fetching_previous_page)
            .finish()
    }
}

impl<D> Deref for InfiniteQueryObserverResult<D> {
    type Target = QueryObserverResult<D>;

    fn deref(&self) -> &Self::Target {
        &self.result
    }
}

fn extend_result<P, PP, D>(
    observer: &QueryObserver<InfiniteData<P, PP>, D>,
    params: &PageParams<P, PP>,
    result: QueryObserverResult<D>,
) -> InfiniteQueryObserverResult<D>
where
    P: QueryOutput + Clone,
    PP: QueryOutput + Clone,
    D: Send + Sync + 'static,
{
    let pages = observer.raw_data();
    let pages = pages.as_ref().map_or(&[][..], |data| &data.pages[..]);
    let direction = observer
        .query_state()
        .filter(|state| state.fetch_status == FetchStatus::Fetching)
        .and_then(|state| state.fetch_meta)
        .map(|meta| meta.direction);
    InfiniteQueryObserverResult {
        has_next_page: params.next_param(pages).is_some(),
        has_previous_page: params.previous_param(pages).is_some(),
        is_fetching_next_page: result.is_fetching && direction == Some(FetchDirection::Forward),
        is_fetching_previous_page: result.is_fetching && direction == Some(FetchDirection::Backward),
        result,
    }
}

/// A [`QueryObserver`] over [`InfiniteData`] with page navigation.
pub struct InfiniteQueryObserver<P, PP, D = InfiniteData<P, PP>> {
    observer: QueryObserver<InfiniteData<P, PP>, D>,
    params: Arc<RwLock<PageParams<P, PP>>>,
}

impl<P, PP, D> Clone for InfiniteQueryObserver<P, PP, D> {
    fn clone(&self) -> Self {
        Self {
            observer: self.observer.clone(),
            params: self.params.clone(),
        }
    }
}

impl<P, PP, D: 'static> fmt::Debug for InfiniteQueryObserver<P, PP, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InfiniteQueryObserver").field(&self.observer).finish()
    }
}

impl<P, PP, D> InfiniteQueryObserver<P, PP, D>
where
    P: QueryOutput + Clone,
    PP: QueryOutput + Clone,
    D: Send + Sync + 'static,
{
    /// Create an observer bound to the infinite query, creating it if needed.
    pub fn new(client: &QueryClient, options: InfiniteQueryOptions<P, PP, D>) -> Result<Self, QueryError> {
        let params = Arc::new(RwLock::new(options.params.clone()));
        let observer = QueryObserver::new(client, options.into_query_options())?;
        Ok(Self { observer, params })
    }

    /// The underlying observer.
    pub fn observer(&self) -> &QueryObserver<InfiniteData<P, PP>, D> {
        &self.observer
    }

    /// Register `listener`. The first subscriber mounts the observer.
    pub fn subscribe(
        &self,
        listener: impl Fn(&InfiniteQueryObserverResult<D>) + Send + Sync + 'static,
    ) -> Subscription {
        let observer: WeakObserver<InfiniteData<P, PP>, D> = self.observer.downgrade();
        let params = self.params.clone();
        self.observer.subscribe(move |result| {
            if let Some(observer) = observer.upgrade() {
                let params = params.read().clone();
                listener(&extend_result(&observer, &params, result.clone()));
            }
        })
    }

    /// The latest result with paging state.
    pub fn get_current_result(&self) -> InfiniteQueryObserverResult<D> {
        let params = self.params.read().clone();
        extend_result(&self.observer, &params, self.observer.get_current_result())
    }

    /// Replace the options.
    pub fn set_options(&self, options: InfiniteQueryOptions<P, PP, D>) -> Result<(), QueryError> {
        let params = options.params.clone();
        self.observer.set_options(options.into_query_options())?;
        *self.params.write() = params;
        Ok(())
    }

    /// Fetch the page after the loaded ones.
    ///
    /// Without an explicit `page_param`, this is a no-op once
    /// `get_next_page_param` reports no further page.
    pub async fn fetch_next_page(
        &self,
        page_param: Option<PP>,
    ) -> Result<InfiniteQueryObserverResult<D>, QueryError> {
        self.fetch_page(FetchDirection::Forward, page_param).await
    }

    /// Fetch the page before the loaded ones.
    pub async fn fetch_previous_page(
        &self,
        page_param: Option<PP>,
    ) -> Result<InfiniteQueryObserverResult<D>, QueryError> {
        self.fetch_page(FetchDirection::Backward, page_param).await
    }

    async fn fetch_page(
        &self,
        direction: FetchDirection,
        page_param: Option<PP>,
    ) -> Result<InfiniteQueryObserverResult<D>, QueryError> {
        if page_param.is_none() {
            let current = self.get_current_result();
            let has_more = match direction {
                FetchDirection::Forward => current.has_next_page,
                FetchDirection::Backward => current.has_previous_page,
            };
            if !has_more {
                tracing::trace!(?direction, "no more pages");
                return Ok(current);
            }
        }
        let meta = FetchMeta {
            direction,
            page_param: page_param.map(QueryData::new),
        };
        let result = self
            .observer
            .fetch(FetchOptions {
                cancel_refetch: true,
                meta: Some(meta),
                ..FetchOptions::default()
            })
            .await?;
        let params = self.params.read().clone();
        Ok(extend_result(&self.observer, &params, result))
    }

    /// Refetch every loaded page.
    pub async fn refetch(&self) -> Result<InfiniteQueryObserverResult<D>, QueryError> {
        let result = self.observer.refetch().await?;
        let params = self.params.read().clone();
        Ok(extend_result(&self.observer, &params, result))
    }

    /// Whether any subscription is alive.
    pub fn has_listeners(&self) -> bool {
        self.observer.has_listeners()
    }

    /// Remove the bound query from the cache.
    pub fn remove(&self) {
        self.observer.remove();
    }
}

impl QueryClient {
    /// [`fetch_query`](Self::fetch_query) for an infinite query. Fetches the
    /// first page, or refetches the loaded ones if stale.
    pub async fn fetch_infinite_query<P, PP>(
        &self,
        options: InfiniteQueryOptions<P, PP>,
    ) -> Result<Arc<InfiniteData<P, PP>>, QueryError>
    where
        P: QueryOutput + Clone,
        PP: QueryOutput + Clone,
    {
        self.fetch_query(options.into_query_options()).await
    }

    /// Like [`fetch_infinite_query`](Self::fetch_infinite_query), but only warms the cache.
    pub async fn prefetch_infinite_query<P, PP>(&self, options: InfiniteQueryOptions<P, PP>)
    where
        P: QueryOutput + Clone,
        PP: QueryOutput + Clone,
    {
        self.prefetch_query(options.into_query_options()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_params_use_edge_pages() {
        let params: PageParams<u32, u32> = PageParams {
            next: Some(Arc::new(|last: &u32, _: &[u32]| (*last < 3).then(|| last + 1))),
            previous: Some(Arc::new(|first: &u32, _: &[u32]| first.checked_sub(1))),
        };
        assert_eq!(params.next_param(&[1, 2]), Some(3));
        assert_eq!(params.next_param(&[3]), None);
        assert_eq!(params.previous_param(&[1, 2]), Some(0));
        assert_eq!(params.next_param(&[]), None);

        let none: PageParams<u32, u32> = PageParams {
            next: None,
            previous: None,
        };
        assert_eq!(none.previous_param(&[5]), None);
    }
}

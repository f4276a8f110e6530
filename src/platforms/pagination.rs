//! Continuation-driven pagination with cycle detection.
//!
//! ```text
//! FETCH_FIRST_PAGE -> PARSE -> [next token? -> FETCH_NEXT -> PARSE -> ...] -> DONE
//! ```
//!
//! A walk stops on the first of:
//! - an empty page
//! - a page whose item keys equal the previous page's (the server replayed it)
//! - a page without a continuation token
//!
//! A page fetched beyond the cap only ends the walk cleanly when it is empty
//! or a repeat; a new page there is an error, so a misbehaving server can
//! never keep the loop alive.

use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

use crate::error::ScrapeError;

/// Default hard cap on pages fetched per listing.
pub const DEFAULT_MAX_PAGES: usize = 50;

/// Opaque server state needed to request the following page.
///
/// For ASP.NET grids this is the form's hidden fields plus the pager
/// button; the walker never looks inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Continuation {
    pub form: Vec<(String, String)>,
}

/// One parsed page: its items, their identity keys and the way forward.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub keys: Vec<String>,
    pub next: Option<Continuation>,
}

impl<T> Page<T> {
    pub fn signature(&self) -> BTreeSet<String> {
        self.keys.iter().cloned().collect()
    }
}

/// A paginated listing.
#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Send;

    async fn first_page(&self) -> Result<Page<Self::Item>, ScrapeError>;

    async fn next_page(&self, token: &Continuation) -> Result<Page<Self::Item>, ScrapeError>;
}

/// Walk every page of `source` and return the items in page order.
///
/// # Errors
///
/// - Any fetch or parse error from the source
/// - [`ScrapeError::PaginationLimit`] when page `max_pages + 1` still has new items
#[instrument(level = "info", skip(source))]
pub async fn paginate<S>(source: &S, url: &str, max_pages: usize) -> Result<Vec<S::Item>, ScrapeError>
where
    S: PageSource + ?Sized,
{
    let mut page = source.first_page().await?;
    let mut fetched = 1usize;
    let mut previous: Option<BTreeSet<String>> = None;
    let mut items = Vec::new();

    loop {
        if page.items.is_empty() {
            debug!(page = fetched, "Empty page; stopping");
            break;
        }
        let signature = page.signature();
        if previous.as_ref() == Some(&signature) {
            info!(page = fetched, "Page repeats the previous one; stopping");
            break;
        }
        if fetched > max_pages {
            return Err(ScrapeError::PaginationLimit {
                url: url.to_string(),
                limit: max_pages,
            });
        }
        debug!(page = fetched, items = page.items.len(), "Accepted page");
        items.extend(page.items);
        previous = Some(signature);

        let Some(token) = page.next else {
            break;
        };
        page = source.next_page(&token).await?;
        fetched += 1;
    }

    info!(pages = fetched, items = items.len(), "Pagination complete");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serves canned pages in order; the last one repeats.
    struct Scripted {
        pages: Vec<Vec<&'static str>>,
        served: Mutex<usize>,
    }

    impl Scripted {
        fn new(pages: Vec<Vec<&'static str>>) -> Self {
            Self {
                pages,
                served: Mutex::new(0),
            }
        }

        fn serve(&self) -> Page<String> {
            let mut served = self.served.lock().unwrap();
            let idx = (*served).min(self.pages.len() - 1);
            *served += 1;
            let items: Vec<String> = self.pages[idx].iter().map(|s| s.to_string()).collect();
            Page {
                keys: items.clone(),
                items,
                next: Some(Continuation {
                    form: vec![("page".into(), (idx + 2).to_string())],
                }),
            }
        }
    }

    #[async_trait]
    impl PageSource for Scripted {
        type Item = String;

        async fn first_page(&self) -> Result<Page<String>, ScrapeError> {
            Ok(self.serve())
        }

        async fn next_page(&self, _token: &Continuation) -> Result<Page<String>, ScrapeError> {
            Ok(self.serve())
        }
    }

    /// Every page is new and always offers another.
    struct Endless {
        served: Mutex<usize>,
    }

    #[async_trait]
    impl PageSource for Endless {
        type Item = usize;

        async fn first_page(&self) -> Result<Page<usize>, ScrapeError> {
            self.next_page(&Continuation::default()).await
        }

        async fn next_page(&self, _token: &Continuation) -> Result<Page<usize>, ScrapeError> {
            let mut served = self.served.lock().unwrap();
            *served += 1;
            Ok(Page {
                items: vec![*served],
                keys: vec![served.to_string()],
                next: Some(Continuation::default()),
            })
        }
    }

    #[tokio::test]
    async fn test_stops_when_page_repeats() {
        let source = Scripted::new(vec![vec!["a", "b"], vec!["c", "d"], vec!["d", "c"]]);
        let items = paginate(&source, "https://x", DEFAULT_MAX_PAGES).await.unwrap();
        assert_eq!(items, vec!["a", "b", "c", "d"]);
        assert_eq!(*source.served.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stops_on_empty_page() {
        let source = Scripted::new(vec![vec!["a"], vec![]]);
        let items = paginate(&source, "https://x", DEFAULT_MAX_PAGES).await.unwrap();
        assert_eq!(items, vec!["a"]);
    }

    #[tokio::test]
    async fn test_stops_without_continuation() {
        struct Single;
        #[async_trait]
        impl PageSource for Single {
            type Item = u8;
            async fn first_page(&self) -> Result<Page<u8>, ScrapeError> {
                Ok(Page {
                    items: vec![1, 2],
                    keys: vec!["1".into(), "2".into()],
                    next: None,
                })
            }
            async fn next_page(&self, _token: &Continuation) -> Result<Page<u8>, ScrapeError> {
                unreachable!("no continuation was offered")
            }
        }
        assert_eq!(paginate(&Single, "https://x", 5).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_page_cap_is_fatal() {
        let source = Endless {
            served: Mutex::new(0),
        };
        let err = paginate(&source, "https://x", 5).await.unwrap_err();
        assert!(matches!(err, ScrapeError::PaginationLimit { limit: 5, .. }));
        assert_eq!(*source.served.lock().unwrap(), 6);
    }

    #[tokio::test]
    async fn test_repeat_right_after_cap_is_clean() {
        let source = Scripted::new(vec![vec!["a"], vec!["b"], vec!["c"]]);
        let items = paginate(&source, "https://x", 3).await.unwrap();
        assert_eq!(items, vec!["a", "b", "c"]);
        assert_eq!(*source.served.lock().unwrap(), 4);
    }
}

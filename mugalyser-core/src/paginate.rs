//! Pagination engine: flattens a chain of upstream pages into one lazy record stream.
//!
//! The upstream API speaks two pagination dialects:
//!
//! - **Legacy**: the body is `{ "results": [...], "meta": { "next": "<url>" | "" } }`.
//! - **Cursor**: the body is a bare array and the response carries a
//!   `Link: <url>; rel="next", <url>; rel="prev"` header. The last page only has `prev`.
//!
//! A response with neither marker is a single, final page. The style is chosen once from
//! the first response ([`PageStyle::detect`]) and consumers only ever see a
//! [`DocumentStream`] of records.
//!
//! The stream is lazy: the next page is fetched only once the records of the current page
//! have been consumed. It is not restartable; replaying requires a fresh call with the
//! original first response. A failed fetch or a malformed `Link` header ends the stream with
//! an error item; records yielded before it remain valid.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use tracing::debug;

use crate::contract::{DocumentStream, Fetcher, QueryParams, Record, Response};
use crate::error::{Error, Result};

/// Per-record reshaping callback applied before records are yielded.
pub type Transform = Arc<dyn Fn(Record) -> Record + Send + Sync>;

pub const LINK_HEADER: &str = "Link";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStyle {
    Legacy,
    Cursor,
    Single,
}

impl PageStyle {
    pub fn detect(response: &Response) -> Self {
        if response.body.get("meta").is_some() {
            PageStyle::Legacy
        } else if response.headers.contains_key(LINK_HEADER) {
            PageStyle::Cursor
        } else {
            PageStyle::Single
        }
    }
}

/// One parsed `Link` header entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub url: String,
    pub rel: String,
}

impl Link {
    pub fn is_prev(&self) -> bool {
        self.rel == "prev"
    }
}

/// Parse a `Link` header holding one or two `<url>; rel="..."` entries.
///
/// Returns the continuation entry: the first one whose `rel` is not `prev`, or the `prev`
/// entry when that is all the header holds (last page).
pub fn parse_link_header(header: &str) -> Result<Link> {
    let links = split_link_entries(header)
        .into_iter()
        .map(parse_link_entry)
        .collect::<Result<Vec<_>>>()?;

    let mut prev = None;
    for link in links {
        if !link.is_prev() {
            return Ok(link);
        }
        prev.get_or_insert(link);
    }
    prev.ok_or_else(|| Error::MalformedLink(header.to_string()))
}

// Commas inside `<...>` belong to the url.
fn split_link_entries(header: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut in_url = false;
    let mut start = 0;
    for (i, c) in header.char_indices() {
        match c {
            '<' => in_url = true,
            '>' => in_url = false,
            ',' if !in_url => {
                entries.push(&header[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    entries.push(&header[start..]);
    entries
        .into_iter()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .collect()
}

fn parse_link_entry(entry: &str) -> Result<Link> {
    let malformed = || Error::MalformedLink(entry.to_string());

    let (url_part, rel_part) = entry.split_once(';').ok_or_else(malformed)?;
    let (_, rel_value) = rel_part.split_once('=').ok_or_else(malformed)?;

    let url = url_part
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string();
    let rel = rel_value.trim().trim_matches('"').to_string();
    if url.is_empty() || rel.is_empty() {
        return Err(malformed());
    }
    Ok(Link { url, rel })
}

/// Builder for a record stream over a chain of pages.
#[derive(Clone)]
pub struct Paginator {
    fetcher: Arc<dyn Fetcher>,
    params: QueryParams,
    transform: Option<Transform>,
}

impl Paginator {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            params: QueryParams::new(),
            transform: None,
        }
    }

    /// Query params re-sent with every cursor-style continuation request. Legacy `next`
    /// urls already embed their query string and are fetched without extra params.
    pub fn with_params(mut self, params: QueryParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Turn the first response into a lazy stream over every record of every page.
    pub fn paginate(self, first: Response) -> DocumentStream {
        let style = PageStyle::detect(&first);
        debug!(?style, "[PAGINATE] Detected pagination style");

        let state = PageState {
            paginator: self,
            style,
            first: Some(first),
            next: None,
        };

        stream::try_unfold(state, |mut state| async move {
            let page = state.next_page().await?;
            Ok::<_, Error>(page.map(|records| (records, state)))
        })
        .map_ok(|records: Vec<Record>| stream::iter(records.into_iter().map(Ok::<Record, Error>)))
        .try_flatten()
        .boxed()
    }
}

struct PageState {
    paginator: Paginator,
    style: PageStyle,
    first: Option<Response>,
    next: Option<String>,
}

impl PageState {
    async fn next_page(&mut self) -> Result<Option<Vec<Record>>> {
        let response = if let Some(first) = self.first.take() {
            first
        } else if let Some(url) = self.next.take() {
            let params = match self.style {
                PageStyle::Cursor => self.paginator.params.clone(),
                PageStyle::Legacy | PageStyle::Single => QueryParams::new(),
            };
            debug!(url = %url, style = ?self.style, "[PAGINATE] Fetching next page");
            self.paginator.fetcher.fetch(&url, &params).await?
        } else {
            return Ok(None);
        };

        let (records, next) = decode_page(self.style, response)?;
        debug!(
            records = records.len(),
            has_next = next.is_some(),
            "[PAGINATE] Decoded page"
        );
        self.next = next;

        let records = match &self.paginator.transform {
            Some(f) => records.into_iter().map(|r| f(r)).collect(),
            None => records,
        };
        Ok(Some(records))
    }
}

/// Split one response into its records and the url of the following page, if any.
fn decode_page(style: PageStyle, response: Response) -> Result<(Vec<Record>, Option<String>)> {
    let Response { headers, body } = response;
    match style {
        PageStyle::Legacy => {
            let next = body
                .get("meta")
                .and_then(|meta| meta.get("next"))
                .and_then(Value::as_str)
                .filter(|next| !next.is_empty())
                .map(str::to_string);
            let records = match body {
                Value::Object(mut map) => match map.remove("results") {
                    Some(Value::Array(results)) => results,
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            };
            Ok((records, next))
        }
        PageStyle::Cursor => {
            let next = match headers.get(LINK_HEADER) {
                Some(header) => {
                    let link = parse_link_header(header)?;
                    (!link.is_prev()).then_some(link.url)
                }
                None => None,
            };
            Ok((into_records(body), next))
        }
        PageStyle::Single => Ok((into_records(body), None)),
    }
}

fn into_records(body: Value) -> Vec<Record> {
    match body {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockFetcher;
    use futures::TryStreamExt;
    use serde_json::json;

    fn legacy_page(ids: &[i64], next: &str) -> Response {
        let results: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
        Response::body(json!({ "results": results, "meta": { "next": next } }))
    }

    fn cursor_page(ids: &[i64], link: &str) -> Response {
        let body: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
        Response::body(Value::Array(body)).with_header(LINK_HEADER, link)
    }

    async fn collect(stream: DocumentStream) -> Result<Vec<Record>> {
        stream.try_collect().await
    }

    #[test]
    fn parse_single_next_link() {
        let link = parse_link_header(r#"<https://api.example.com/p2>; rel="next""#).unwrap();
        assert_eq!(link.url, "https://api.example.com/p2");
        assert_eq!(link.rel, "next");
    }

    #[test]
    fn parse_prefers_non_prev_entry() {
        let header = r#"<https://x/p1>; rel="prev", <https://x/p3>; rel="next""#;
        let link = parse_link_header(header).unwrap();
        assert_eq!(link.url, "https://x/p3");
        assert_eq!(link.rel, "next");
    }

    #[test]
    fn parse_prev_only_is_last_page() {
        let link = parse_link_header(r#"<https://x/p1>; rel="prev""#).unwrap();
        assert!(link.is_prev());
    }

    #[test]
    fn parse_keeps_commas_inside_url() {
        let header = r#"<https://x/members?fields=a,b&page=2>; rel="next""#;
        let link = parse_link_header(header).unwrap();
        assert_eq!(link.url, "https://x/members?fields=a,b&page=2");
    }

    #[test]
    fn parse_rejects_missing_separators() {
        assert!(matches!(
            parse_link_header("<https://x/p2> rel=\"next\""),
            Err(Error::MalformedLink(_))
        ));
        assert!(matches!(
            parse_link_header("<https://x/p2>; rel\"next\""),
            Err(Error::MalformedLink(_))
        ));
    }

    #[test]
    fn detect_styles() {
        assert_eq!(PageStyle::detect(&legacy_page(&[1], "")), PageStyle::Legacy);
        assert_eq!(
            PageStyle::detect(&cursor_page(&[1], r#"<u>; rel="prev""#)),
            PageStyle::Cursor
        );
        assert_eq!(
            PageStyle::detect(&Response::body(json!([{ "id": 1 }]))),
            PageStyle::Single
        );
    }

    #[tokio::test]
    async fn legacy_two_pages_in_order() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|url, params| url == "P2" && params.is_empty())
            .times(1)
            .returning(|_, _| Ok(legacy_page(&[2], "")));

        let records = collect(Paginator::new(Arc::new(fetcher)).paginate(legacy_page(&[1], "P2")))
            .await
            .unwrap();
        assert_eq!(records, vec![json!({ "id": 1 }), json!({ "id": 2 })]);
    }

    #[tokio::test]
    async fn legacy_count_is_sum_of_results_and_empty_pages_are_skipped() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|url, _| url == "P2")
            .returning(|_, _| Ok(legacy_page(&[], "P3")));
        fetcher
            .expect_fetch()
            .withf(|url, _| url == "P3")
            .returning(|_, _| Ok(legacy_page(&[4, 5, 6], "")));

        let records = collect(
            Paginator::new(Arc::new(fetcher)).paginate(legacy_page(&[1, 2, 3], "P2")),
        )
        .await
        .unwrap();
        assert_eq!(records.len(), 6);
    }

    #[tokio::test]
    async fn cursor_follows_next_until_prev_and_yields_fresh_pages() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|url, params| url == "https://x/p2" && params.len() == 1)
            .times(1)
            .returning(|_, _| {
                Ok(cursor_page(
                    &[2],
                    r#"<https://x/p1>; rel="prev", <https://x/p3>; rel="next""#,
                ))
            });
        fetcher
            .expect_fetch()
            .withf(|url, _| url == "https://x/p3")
            .times(1)
            .returning(|_, _| Ok(cursor_page(&[3], r#"<https://x/p2>; rel="prev""#)));

        let paginator = Paginator::new(Arc::new(fetcher))
            .with_params(vec![("page".to_string(), "1".to_string())]);
        let records = collect(paginator.paginate(cursor_page(&[1], r#"<https://x/p2>; rel="next""#)))
            .await
            .unwrap();
        assert_eq!(
            records,
            vec![json!({ "id": 1 }), json!({ "id": 2 }), json!({ "id": 3 })]
        );
    }

    #[tokio::test]
    async fn cursor_prev_on_first_page_stops_immediately() {
        let fetcher = MockFetcher::new();
        let records = collect(
            Paginator::new(Arc::new(fetcher)).paginate(cursor_page(&[1, 2], r#"<u>; rel="prev""#)),
        )
        .await
        .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn malformed_link_is_fatal() {
        let fetcher = MockFetcher::new();
        let mut stream =
            Paginator::new(Arc::new(fetcher)).paginate(cursor_page(&[1], "<https://x/p2> next"));
        let first = stream.next().await;
        assert!(matches!(first, Some(Err(Error::MalformedLink(_)))));
    }

    #[tokio::test]
    async fn fetch_failure_surfaces_after_earlier_records() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(|url, _| {
            Err(Error::FetchFailed {
                url: url.to_string(),
                status: Some(503),
                message: "unavailable".into(),
            })
        });

        let mut stream = Paginator::new(Arc::new(fetcher)).paginate(legacy_page(&[1], "P2"));
        assert_eq!(stream.next().await.unwrap().unwrap(), json!({ "id": 1 }));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_fetch_failure());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn single_page_applies_transform() {
        let fetcher = MockFetcher::new();
        let transform: Transform = Arc::new(|mut r: Record| {
            r["seen"] = json!(true);
            r
        });
        let records = collect(
            Paginator::new(Arc::new(fetcher))
                .with_transform(transform)
                .paginate(Response::body(json!([{ "id": 1 }, { "id": 2 }]))),
        )
        .await
        .unwrap();
        assert_eq!(records[1], json!({ "id": 2, "seen": true }));
    }
}

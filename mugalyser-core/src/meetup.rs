//! Meetup REST endpoints, each returned as a record stream over every page.
//!
//! Every request carries the API key (`key`) and `sign=true`. Endpoints that page take a
//! `page` size from [`ApiConfig`]; the first page is fetched eagerly and the rest lazily
//! through [`Paginator`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::contract::{DocumentStream, EntitySource, Fetcher, QueryParams, Record};
use crate::error::{Error, Result};
use crate::ingest::Phase;
use crate::paginate::{Paginator, Transform};
use crate::reshape::{event_transform, group_transform, member_transform, reshape_group};

#[derive(Clone)]
pub struct MeetupApi {
    fetcher: Arc<dyn Fetcher>,
    config: ApiConfig,
}

impl MeetupApi {
    pub fn new(fetcher: Arc<dyn Fetcher>, config: ApiConfig) -> Self {
        Self { fetcher, config }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Join path segments onto the configured base url.
    pub fn url(&self, segments: &[&str]) -> String {
        let mut url = self.config.base_url.trim_end_matches('/').to_string();
        for segment in segments {
            url.push('/');
            url.push_str(segment.trim_matches('/'));
        }
        url
    }

    fn base_params(&self) -> QueryParams {
        let mut params = QueryParams::new();
        if let Some(key) = &self.config.api_key {
            params.push(("key".to_string(), key.clone()));
        }
        params.push(("sign".to_string(), "true".to_string()));
        params
    }

    fn with_param(mut params: QueryParams, name: &str, value: impl ToString) -> QueryParams {
        params.push((name.to_string(), value.to_string()));
        params
    }

    async fn paged(
        &self,
        url: String,
        params: QueryParams,
        transform: Option<Transform>,
    ) -> Result<DocumentStream> {
        debug!(url = %url, "[MEETUP] Requesting first page");
        let first = self.fetcher.fetch(&url, &params).await?;
        let mut paginator = Paginator::new(self.fetcher.clone()).with_params(params);
        if let Some(transform) = transform {
            paginator = paginator.with_transform(transform);
        }
        Ok(paginator.paginate(first))
    }

    /// One group document, reshaped.
    pub async fn get_group(&self, urlname: &str) -> Result<Record> {
        let url = self.url(&[urlname]);
        let response = self.fetcher.fetch(&url, &self.base_params()).await?;
        Ok(reshape_group(response.body))
    }

    async fn get_events(&self, urlname: &str, status: &str) -> Result<DocumentStream> {
        let params = self.base_params();
        let params = Self::with_param(params, "status", status);
        let params = Self::with_param(params, "page", self.config.events_page_size);
        let params = Self::with_param(params, "group_urlname", urlname);
        self.paged(self.url(&["2", "events"]), params, Some(event_transform()))
            .await
    }

    pub async fn get_past_events(&self, urlname: &str) -> Result<DocumentStream> {
        self.get_events(urlname, "past").await
    }

    pub async fn get_upcoming_events(&self, urlname: &str) -> Result<DocumentStream> {
        self.get_events(urlname, "upcoming").await
    }

    pub async fn get_members(&self, urlname: &str) -> Result<DocumentStream> {
        let params = Self::with_param(self.base_params(), "group_urlname", urlname);
        let params = Self::with_param(params, "page", self.config.members_page_size);
        self.paged(self.url(&["2", "members"]), params, Some(member_transform()))
            .await
    }

    /// Attendance list for one event of a group.
    pub async fn get_event_attendees(&self, urlname: &str, event_id: &str) -> Result<DocumentStream> {
        let params = Self::with_param(self.base_params(), "page", self.config.attendees_page_size);
        let url = self.url(&[urlname, "events", event_id, "attendance"]);
        self.paged(url, params, None).await
    }

    /// Every attendee of every past event of a group, as `{attendee, event}` pairs.
    pub async fn get_attendees(&self, urlname: &str) -> Result<DocumentStream> {
        let events = self.get_past_events(urlname).await?;
        let api = self.clone();
        let urlname = urlname.to_string();

        let pairs = events
            .and_then(move |event| {
                let api = api.clone();
                let urlname = urlname.clone();
                async move {
                    let Some(event_id) = event_id(&event) else {
                        warn!(group = %urlname, "[MEETUP] Past event without id, skipping attendance");
                        return Ok::<DocumentStream, Error>(stream::empty().boxed());
                    };
                    let attendees = api.get_event_attendees(&urlname, &event_id).await?;
                    let pairs: DocumentStream = attendees
                        .map_ok(move |attendee| json!({ "attendee": attendee, "event": event.clone() }))
                        .boxed();
                    Ok::<DocumentStream, Error>(pairs)
                }
            })
            .try_flatten()
            .boxed();
        Ok(pairs)
    }

    /// Groups the API key's owner belongs to.
    pub async fn get_groups(&self) -> Result<DocumentStream> {
        self.paged(self.url(&["self", "groups"]), self.base_params(), Some(group_transform()))
            .await
    }

    /// Groups of the configured pro account.
    pub async fn get_pro_groups(&self) -> Result<DocumentStream> {
        let url = self.url(&["pro", &self.config.pro_account, "groups"]);
        self.paged(url, self.base_params(), Some(group_transform()))
            .await
    }

    pub async fn get_member_by_id(&self, member_id: i64) -> Result<Record> {
        let url = self.url(&["2", "member", &member_id.to_string()]);
        let response = self.fetcher.fetch(&url, &self.base_params()).await?;
        Ok(response.body)
    }

    /// Url-names of the pro account's groups. Used as the default target list.
    pub async fn get_group_names(&self) -> Result<BoxStream<'static, Result<String>>> {
        let groups = self.get_pro_groups().await?;
        Ok(groups
            .try_filter_map(|group| async move {
                Ok::<_, Error>(group.get("urlname").and_then(Value::as_str).map(str::to_string))
            })
            .boxed())
    }
}

fn event_id(event: &Record) -> Option<String> {
    match event.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[async_trait]
impl EntitySource for MeetupApi {
    async fn records(&self, phase: Phase, target: &str) -> Result<DocumentStream> {
        info!(phase = %phase, group = %target, "[MEETUP] Opening record stream");
        match phase {
            Phase::Groups => {
                let group = self.get_group(target).await?;
                Ok(stream::iter(vec![Ok(group)]).boxed())
            }
            Phase::PastEvents => self.get_past_events(target).await,
            Phase::UpcomingEvents => self.get_upcoming_events(target).await,
            Phase::Members => self.get_members(target).await,
            Phase::Attendees => self.get_attendees(target).await,
        }
    }
}

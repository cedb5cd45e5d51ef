//! Canned analytics over one ingested batch.
//!
//! Every query takes the batch id explicitly; callers resolve it once through
//! [`crate::audit::BatchAudit::current_valid_batch_id`]. An empty `urls` slice means
//! "every group in the batch".

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::agg::{Agg, Direction, GroupSpec, SortSpec};
use crate::contract::{DocumentStore, DocumentStream};
use crate::error::{Error, Result};

pub const EU_COUNTRIES: &[&str] = &[
    "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT",
    "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE", "GB",
];
pub const NORDIC_COUNTRIES: &[&str] = &["DK", "FI", "IS", "NO", "SE"];
pub const US_COUNTRIES: &[&str] = &["US"];

/// Which groups a report covers, by the group's country code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    All,
    Eu,
    Us,
    Nordics,
    Countries(Vec<String>),
}

impl Region {
    /// Upper-case country codes, or `None` for every country.
    pub fn countries(&self) -> Option<Vec<String>> {
        let codes: Vec<String> = match self {
            Region::All => return None,
            Region::Eu => EU_COUNTRIES.iter().map(|c| c.to_string()).collect(),
            Region::Us => US_COUNTRIES.iter().map(|c| c.to_string()).collect(),
            Region::Nordics => NORDIC_COUNTRIES.iter().map(|c| c.to_string()).collect(),
            Region::Countries(codes) => codes.iter().map(|c| c.to_ascii_uppercase()).collect(),
        };
        Some(codes)
    }
}

impl FromStr for Region {
    type Err = Error;

    /// `all`, `EU`, `US`, `NORDICS`, or a comma-separated list of country codes.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "ALL" => Ok(Region::All),
            "EU" => Ok(Region::Eu),
            "US" | "USA" => Ok(Region::Us),
            "NORDICS" => Ok(Region::Nordics),
            list => Ok(Region::Countries(
                list.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
        }
    }
}

/// Narrowing for the past-events listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Only events with at least this many RSVPs; 0 disables the bound.
    pub min_rsvp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    Meetups,
    Groups,
    Members,
    Events,
}

impl Report {
    pub const ALL: [Report; 4] = [Report::Meetups, Report::Groups, Report::Members, Report::Events];

    pub fn name(self) -> &'static str {
        match self {
            Report::Meetups => "meetups",
            Report::Groups => "groups",
            Report::Members => "members",
            Report::Events => "events",
        }
    }

    /// Column order for tabular output.
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            Report::Meetups => &["year", "total_rsvp", "total_events"],
            Report::Groups => &["year", "group", "event_count", "rsvp_count"],
            Report::Members => &["urlname", "country", "member_count"],
            Report::Events => &["group", "name", "rsvp_count", "date"],
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Report {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Report::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::BuilderMisuse(format!("unknown report {s:?}")))
    }
}

fn rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct Reports {
    store: Arc<dyn DocumentStore>,
}

impl Reports {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    // batchID, past status and (optionally) group url-name restriction on past events.
    fn past_events(&self, batch_id: i64, urls: &[String]) -> Result<Agg> {
        let mut predicate = Map::new();
        predicate.insert("batchID".into(), json!(batch_id));
        predicate.insert("event.status".into(), json!("past"));
        if !urls.is_empty() {
            predicate.insert("event.group.urlname".into(), json!({ "$in": urls }));
        }
        let mut agg = Agg::new(self.store.clone(), "past_events");
        agg.add_match(Value::Object(predicate))?;
        Ok(agg)
    }

    /// Events and RSVPs per year.
    pub async fn meetup_totals(&self, batch_id: i64, urls: &[String]) -> Result<DocumentStream> {
        let mut agg = self.past_events(batch_id, urls)?;
        agg.add_project(json!({
            "_id": 0,
            "name": "$event.name",
            "time": "$event.time",
            "rsvp": "$event.yes_rsvp_count"
        }))?
        .add_group(
            GroupSpec::new(json!({ "$year": "$time" }))
                .sum("total_rsvp", json!("$rsvp"))
                .count("total_events"),
        )?
        .add_project(json!({
            "_id": 0,
            "year": "$_id",
            "total_rsvp": 1,
            "total_events": 1
        }))?
        .add_sort(SortSpec::new("year"));
        info!(batch_id, pipeline = %agg, "[REPORT] meetup totals");
        agg.execute().await
    }

    /// Events and RSVPs per group per year.
    pub async fn group_totals(&self, batch_id: i64, urls: &[String]) -> Result<DocumentStream> {
        let mut agg = self.past_events(batch_id, urls)?;
        agg.add_group(
            GroupSpec::new(json!({
                "urlname": "$event.group.urlname",
                "year": { "$year": "$event.time" }
            }))
            .count("event_count")
            .sum("rsvp_count", json!("$event.yes_rsvp_count")),
        )?
        .add_project(json!({
            "_id": 0,
            "group": "$_id.urlname",
            "year": "$_id.year",
            "event_count": 1,
            "rsvp_count": 1
        }))?
        .add_sort(
            SortSpec::new("year")
                .add("group")?
                .add("event_count")?
                .add("rsvp_count")?,
        );
        info!(batch_id, pipeline = %agg, "[REPORT] group totals");
        agg.execute().await
    }

    /// Member count and country per group, largest first.
    pub async fn member_counts(&self, batch_id: i64, urls: &[String]) -> Result<DocumentStream> {
        let mut predicate = Map::new();
        predicate.insert("batchID".into(), json!(batch_id));
        if !urls.is_empty() {
            predicate.insert("group.urlname".into(), json!({ "$in": urls }));
        }
        let mut agg = Agg::new(self.store.clone(), "groups");
        agg.add_match(Value::Object(predicate))?
            .add_project(json!({
                "_id": 0,
                "urlname": "$group.urlname",
                "country": "$group.country",
                "member_count": "$group.member_count"
            }))?
            .add_sort(SortSpec::with_direction("member_count", Direction::Descending));
        info!(batch_id, pipeline = %agg, "[REPORT] member counts");
        agg.execute().await
    }

    /// Past events listing with optional date window and RSVP floor.
    pub async fn events(
        &self,
        batch_id: i64,
        urls: &[String],
        filter: &EventFilter,
    ) -> Result<DocumentStream> {
        let mut agg = self.past_events(batch_id, urls)?;
        if let Some(start) = &filter.start {
            agg.add_match(json!({ "event.time": { "$gte": rfc3339(start) } }))?;
        }
        if let Some(end) = &filter.end {
            agg.add_match(json!({ "event.time": { "$lte": rfc3339(end) } }))?;
        }
        if filter.min_rsvp > 0 {
            agg.add_match(json!({ "event.yes_rsvp_count": { "$gte": filter.min_rsvp } }))?;
        }
        agg.add_project(json!({
            "_id": 0,
            "group": "$event.group.urlname",
            "name": "$event.name",
            "rsvp_count": "$event.yes_rsvp_count",
            "date": { "$dateToString": { "format": "%Y-%m-%d", "date": "$event.time" } }
        }))?
        .add_sort(SortSpec::new("group").add("rsvp_count")?.add("date")?);
        info!(batch_id, pipeline = %agg, "[REPORT] events");
        agg.execute().await
    }

    pub async fn run(
        &self,
        report: Report,
        batch_id: i64,
        urls: &[String],
        filter: &EventFilter,
    ) -> Result<DocumentStream> {
        match report {
            Report::Meetups => self.meetup_totals(batch_id, urls).await,
            Report::Groups => self.group_totals(batch_id, urls).await,
            Report::Members => self.member_counts(batch_id, urls).await,
            Report::Events => self.events(batch_id, urls, filter).await,
        }
    }

    /// Url-names of the batch's groups located in a region.
    pub async fn group_urlnames(&self, batch_id: i64, region: &Region) -> Result<Vec<String>> {
        let mut predicate = Map::new();
        predicate.insert("batchID".into(), json!(batch_id));
        if let Some(codes) = region.countries() {
            // Upstream has used both cases for country codes.
            let either_case: Vec<String> = codes
                .iter()
                .flat_map(|c| [c.to_ascii_uppercase(), c.to_ascii_lowercase()])
                .collect();
            predicate.insert("group.country".into(), json!({ "$in": either_case }));
        }
        let mut agg = Agg::new(self.store.clone(), "groups");
        agg.add_match(Value::Object(predicate))?
            .add_project(json!({ "_id": 0, "urlname": "$group.urlname" }))?
            .add_sort(SortSpec::new("urlname"));
        let docs: Vec<Value> = agg.execute().await?.try_collect().await?;
        let mut names: Vec<String> = docs
            .iter()
            .filter_map(|d| d.get("urlname").and_then(Value::as_str).map(str::to_string))
            .collect();
        names.dedup();
        Ok(names)
    }
}

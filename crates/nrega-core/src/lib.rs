//! Core domain model, defensive record parsing and page grouping for the NREGA sync.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nrega-core";

/// One numeric observation column: the upstream JSON key and the store column it lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricField {
    pub source_key: &'static str,
    pub column: &'static str,
}

const fn field(source_key: &'static str, column: &'static str) -> MetricField {
    MetricField { source_key, column }
}

pub const METRIC_FIELD_COUNT: usize = 34;

pub static METRIC_FIELDS: [MetricField; METRIC_FIELD_COUNT] = [
    field("Approved_Labour_Budget", "approved_labour_budget"),
    field("Average_Wage_rate_per_day_per_person", "average_wage_rate_per_day"),
    field(
        "Average_days_of_employment_provided_per_Household",
        "average_days_of_employment_per_household",
    ),
    field("Differently_abled_persons_worked", "differently_abled_persons_worked"),
    field("Material_and_skilled_Wages", "material_and_skilled_wages"),
    field("Number_of_Completed_Works", "completed_works"),
    field("Number_of_GPs_with_NIL_exp", "gps_with_nil_expenditure"),
    field("Number_of_Ongoing_Works", "ongoing_works"),
    field(
        "Persondays_of_Central_Liability_so_far",
        "persondays_central_liability",
    ),
    field("SC_persondays", "sc_persondays"),
    field("SC_workers_against_active_workers", "sc_workers_against_active"),
    field("ST_persondays", "st_persondays"),
    field("ST_workers_against_active_workers", "st_workers_against_active"),
    field("Total_Adm_Expenditure", "total_admin_expenditure"),
    field("Total_Exp", "total_expenditure"),
    field("Total_Households_Worked", "total_households_worked"),
    field("Total_Individuals_Worked", "total_individuals_worked"),
    field("Total_No_of_Active_Job_Cards", "active_job_cards"),
    field("Total_No_of_Active_Workers", "active_workers"),
    field(
        "Total_No_of_HHs_completed_100_Days_of_Wage_Employment",
        "households_completed_100_days",
    ),
    field("Total_No_of_JobCards_issued", "job_cards_issued"),
    field("Total_No_of_Workers", "total_workers"),
    field("Total_No_of_Works_Takenup", "works_taken_up"),
    field("Wages", "wages"),
    field("Women_Persondays", "women_persondays"),
    field("percent_of_Category_B_Works", "percent_category_b_works"),
    field(
        "percent_of_Expenditure_on_Agriculture_Allied_Works",
        "percent_agriculture_allied_expenditure",
    ),
    field("percent_of_NRM_Expenditure", "percent_nrm_expenditure"),
    field(
        "percentage_payments_gererated_within_15_days",
        "percent_payments_within_15_days",
    ),
    field("Persondays_generated_so_far", "persondays_generated"),
    field("Total_persondays_generated", "total_persondays_generated"),
    field("Households_provided_employment", "households_provided_employment"),
    field("Total_Works_Expenditure", "total_works_expenditure"),
    field("Average_Days_Of_Employment", "average_days_of_employment"),
];

/// Parse an upstream numeric cell. Blank, `NA` and unparseable input is "no data", never zero.
pub fn parse_numeric(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        JsonValue::String(s) => parse_numeric_str(s),
        _ => None,
    }
}

pub fn parse_numeric_str(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() || is_missing_sentinel(trimmed) {
        return None;
    }
    let cleaned: String = trimmed.chars().filter(|c| *c != ',').collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn is_missing_sentinel(value: &str) -> bool {
    value.eq_ignore_ascii_case("na") || value.eq_ignore_ascii_case("n/a")
}

/// Loosely-typed upstream record. Only the page groupers look inside it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(JsonMap<String, JsonValue>);

impl RawRecord {
    pub fn new(fields: JsonMap<String, JsonValue>) -> Self {
        Self(fields)
    }

    /// Build from any JSON value; non-objects become an empty record.
    pub fn from_value(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Text cell, trimmed. Numeric cells are rendered as text (codes often arrive as numbers).
    pub fn text(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            JsonValue::String(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn numeric(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(parse_numeric)
    }
}

/// Fixed-width set of nullable observations, ordered like [`METRIC_FIELDS`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValues {
    values: Vec<Option<f64>>,
}

impl Default for MetricValues {
    fn default() -> Self {
        Self {
            values: vec![None; METRIC_FIELD_COUNT],
        }
    }
}

impl MetricValues {
    pub fn from_record(record: &RawRecord) -> Self {
        Self {
            values: METRIC_FIELDS
                .iter()
                .map(|f| record.numeric(f.source_key))
                .collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<f64> {
        METRIC_FIELDS
            .iter()
            .position(|f| f.column == column)
            .and_then(|idx| self.values[idx])
    }

    pub fn set(&mut self, column: &str, value: Option<f64>) -> bool {
        match METRIC_FIELDS.iter().position(|f| f.column == column) {
            Some(idx) => {
                self.values[idx] = value;
                true
            }
            None => false,
        }
    }

    pub fn as_slice(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static MetricField, Option<f64>)> + '_ {
        METRIC_FIELDS.iter().zip(self.values.iter().copied())
    }

    pub fn populated(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}

impl Serialize for MetricValues {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(METRIC_FIELD_COUNT))?;
        for (field, value) in self.iter() {
            map.serialize_entry(field.column, &value)?;
        }
        map.end()
    }
}

/// Natural key of a district: immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionKey {
    pub state_code: String,
    pub district_code: String,
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.state_code, self.district_code)
    }
}

/// A district within its parent state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub state_code: String,
    pub state_name: String,
    pub district_code: String,
    pub district_name: String,
}

impl Region {
    pub fn key(&self) -> RegionKey {
        RegionKey {
            state_code: self.state_code.clone(),
            district_code: self.district_code.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    pub region: RegionKey,
    pub fin_year: String,
    pub month: String,
}

/// One reporting period's observations for a district. State fields are denormalized copies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodMetric {
    pub state_code: String,
    pub state_name: String,
    pub district_code: String,
    pub fin_year: String,
    /// Month name, or empty for whole-year rows.
    pub month: String,
    pub values: MetricValues,
}

impl PeriodMetric {
    pub fn natural_key(&self) -> MetricKey {
        MetricKey {
            region: RegionKey {
                state_code: self.state_code.clone(),
                district_code: self.district_code.clone(),
            },
            fin_year: self.fin_year.clone(),
            month: self.month.clone(),
        }
    }
}

/// Strongly-typed view of one upstream record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub region: Region,
    pub metric: PeriodMetric,
}

impl MetricRecord {
    /// Returns `None` when the record has no usable region or period identity.
    pub fn from_raw(raw: &RawRecord) -> Option<Self> {
        let state_name = raw.text("state_name").unwrap_or_default();
        let state_code = raw.text("state_code").or_else(|| {
            (!state_name.is_empty()).then(|| state_name.clone())
        })?;
        let district_name = raw.text("district_name").unwrap_or_default();
        let district_code = raw.text("district_code").or_else(|| {
            (!district_name.is_empty()).then(|| district_name.clone())
        })?;
        let fin_year = raw.text("fin_year")?;
        let month = raw.text("month").unwrap_or_default();

        let region = Region {
            state_code: state_code.clone(),
            state_name: state_name.clone(),
            district_code: district_code.clone(),
            district_name,
        };
        let metric = PeriodMetric {
            state_code,
            state_name,
            district_code,
            fin_year,
            month,
            values: MetricValues::from_record(raw),
        };
        Some(Self { region, metric })
    }

    /// Re-parent onto the state a page was requested for. Blank names keep the record's own.
    pub fn in_state(mut self, state_code: &str, state_name: &str) -> Self {
        self.region.state_code = state_code.to_string();
        self.metric.state_code = state_code.to_string();
        if !state_name.is_empty() {
            self.region.state_name = state_name.to_string();
            self.metric.state_name = state_name.to_string();
        }
        self
    }
}

/// All metric rows of one page that belong to a single district.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionBatch {
    pub region: Region,
    pub metrics: Vec<PeriodMetric>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedPage {
    pub groups: BTreeMap<RegionKey, Vec<MetricRecord>>,
    pub skipped: usize,
}

impl GroupedPage {
    pub fn record_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// One batch per district; the last-seen names win for the region row.
    pub fn into_batches(self) -> Vec<RegionBatch> {
        self.groups
            .into_values()
            .filter_map(|records| {
                let region = records.last()?.region.clone();
                let metrics = records.into_iter().map(|r| r.metric).collect();
                Some(RegionBatch { region, metrics })
            })
            .collect()
    }
}

/// Partition a page by region key (state and district, each falling back to its name when the
/// code is absent), keeping arrival order. Unidentifiable records are counted as skipped.
pub fn group_page(records: Vec<RawRecord>) -> GroupedPage {
    group_records(records, |record| record)
}

/// Like [`group_page`] for a page fetched with a state filter: every record is re-parented onto
/// that state, so rows missing `state_code` land with their siblings.
pub fn group_state_page(records: Vec<RawRecord>, state_code: &str, state_name: &str) -> GroupedPage {
    group_records(records, |record| record.in_state(state_code, state_name))
}

fn group_records(records: Vec<RawRecord>, adopt: impl Fn(MetricRecord) -> MetricRecord) -> GroupedPage {
    let mut grouped = GroupedPage::default();
    for raw in &records {
        match MetricRecord::from_raw(raw).map(&adopt) {
            Some(record) => grouped
                .groups
                .entry(record.region.key())
                .or_default()
                .push(record),
            None => grouped.skipped += 1,
        }
    }
    grouped
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("fiscal year `{0}` is not in YYYY-YYYY form")]
    Malformed(String),
    #[error("fiscal year `{0}` must span consecutive years")]
    NotConsecutive(String),
}

pub fn validate_fin_year(code: &str) -> Result<(), PeriodError> {
    let (start, end) = code
        .split_once('-')
        .ok_or_else(|| PeriodError::Malformed(code.to_string()))?;
    let parse = |s: &str| {
        (s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()))
            .then(|| s.parse::<u32>().ok())
            .flatten()
            .ok_or_else(|| PeriodError::Malformed(code.to_string()))
    };
    let (start, end) = (parse(start)?, parse(end)?);
    if end != start + 1 {
        return Err(PeriodError::NotConsecutive(code.to_string()));
    }
    Ok(())
}

/// Indian fiscal year (April to March) containing `date`.
pub fn fin_year_for(date: NaiveDate) -> String {
    let start = if date.month() >= 4 {
        date.year()
    } else {
        date.year() - 1
    };
    format!("{}-{}", start, start + 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Partial,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Partial => "partial",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SyncStatus::Success),
            "partial" => Ok(SyncStatus::Partial),
            "error" => Ok(SyncStatus::Error),
            other => Err(format!("unknown sync status `{other}`")),
        }
    }
}

/// Append-only ledger row, one per pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub source: String,
    pub operation: String,
    pub status: SyncStatus,
    pub records_count: i64,
    pub error_message: Option<String>,
    pub request_params: JsonValue,
    pub response_time_ms: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

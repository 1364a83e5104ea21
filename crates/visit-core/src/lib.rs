//! Visit record model and tracking-parameter extraction.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use url::form_urlencoded;

/// Destination table for extracted visits.
pub const VISITS_TABLE: &str = "customer_visits";

/// Longest text value, in characters, the `VARCHAR(255)` columns accept.
pub const MAX_TEXT_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("query parameter `{key}` is not an integer: {value:?}")]
    InvalidInteger { key: &'static str, value: String },
    #[error("query parameter `{key}` is {len} characters long, limit is 255")]
    TooLong { key: &'static str, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
}

/// The eight persisted columns, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisitColumn {
    AdBucket,
    AdType,
    AdSource,
    SchemaVersion,
    AdCampaignId,
    AdKeyword,
    AdGroupId,
    AdCreative,
}

impl VisitColumn {
    pub const ALL: [VisitColumn; 8] = [
        VisitColumn::AdBucket,
        VisitColumn::AdType,
        VisitColumn::AdSource,
        VisitColumn::SchemaVersion,
        VisitColumn::AdCampaignId,
        VisitColumn::AdKeyword,
        VisitColumn::AdGroupId,
        VisitColumn::AdCreative,
    ];

    pub fn name(self) -> &'static str {
        match self {
            VisitColumn::AdBucket => "ad_bucket",
            VisitColumn::AdType => "ad_type",
            VisitColumn::AdSource => "ad_source",
            VisitColumn::SchemaVersion => "schema_version",
            VisitColumn::AdCampaignId => "ad_campaign_id",
            VisitColumn::AdKeyword => "ad_keyword",
            VisitColumn::AdGroupId => "ad_group_id",
            VisitColumn::AdCreative => "ad_creative",
        }
    }

    /// Query-string key the column is read from.
    pub fn query_key(self) -> &'static str {
        match self {
            VisitColumn::AdBucket => "a_bucket",
            VisitColumn::AdType => "a_type",
            VisitColumn::AdSource => "a_source",
            VisitColumn::SchemaVersion => "a_v",
            VisitColumn::AdCampaignId => "a_g_campaignid",
            VisitColumn::AdKeyword => "a_g_keyword",
            VisitColumn::AdGroupId => "a_g_adgroupid",
            VisitColumn::AdCreative => "a_g_creative",
        }
    }

    pub fn kind(self) -> ColumnKind {
        match self {
            VisitColumn::SchemaVersion
            | VisitColumn::AdCampaignId
            | VisitColumn::AdGroupId
            | VisitColumn::AdCreative => ColumnKind::Integer,
            _ => ColumnKind::Text,
        }
    }

    pub fn sql_type(self) -> &'static str {
        match self.kind() {
            ColumnKind::Text => "VARCHAR(255)",
            ColumnKind::Integer => "BIGINT",
        }
    }
}

/// Borrowed view of one column of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnValue<'a> {
    Text(Option<&'a str>),
    Integer(Option<i64>),
}

impl ColumnValue<'_> {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Text(None) | ColumnValue::Integer(None))
    }
}

/// One visit extracted from a tracking URL. Every field is nullable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct VisitRecord {
    pub ad_bucket: Option<String>,
    pub ad_type: Option<String>,
    pub ad_source: Option<String>,
    pub schema_version: Option<i64>,
    pub ad_campaign_id: Option<i64>,
    pub ad_keyword: Option<String>,
    pub ad_group_id: Option<i64>,
    pub ad_creative: Option<i64>,
}

impl VisitRecord {
    /// Extract the tracking parameters from `url`.
    ///
    /// Missing or blank parameters become `None`. An integer parameter that is present but
    /// not numeric is an error; it is never coerced to a default. Text longer than
    /// [`MAX_TEXT_LEN`] characters is an error too, never truncated.
    pub fn parse(url: &str) -> Result<Self, ParseError> {
        let params = query_params(url);
        let text = |column: VisitColumn| -> Result<Option<String>, ParseError> {
            let Some(value) = params.get(column.query_key()) else {
                return Ok(None);
            };
            let len = value.chars().count();
            if len > MAX_TEXT_LEN {
                return Err(ParseError::TooLong {
                    key: column.query_key(),
                    len,
                });
            }
            Ok(Some(value.clone()))
        };
        let integer = |column: VisitColumn| -> Result<Option<i64>, ParseError> {
            params
                .get(column.query_key())
                .map(|value| {
                    value
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| ParseError::InvalidInteger {
                            key: column.query_key(),
                            value: value.clone(),
                        })
                })
                .transpose()
        };

        Ok(Self {
            ad_bucket: text(VisitColumn::AdBucket)?,
            ad_type: text(VisitColumn::AdType)?,
            ad_source: text(VisitColumn::AdSource)?,
            schema_version: integer(VisitColumn::SchemaVersion)?,
            ad_campaign_id: integer(VisitColumn::AdCampaignId)?,
            ad_keyword: text(VisitColumn::AdKeyword)?,
            ad_group_id: integer(VisitColumn::AdGroupId)?,
            ad_creative: integer(VisitColumn::AdCreative)?,
        })
    }

    pub fn value(&self, column: VisitColumn) -> ColumnValue<'_> {
        match column {
            VisitColumn::AdBucket => ColumnValue::Text(self.ad_bucket.as_deref()),
            VisitColumn::AdType => ColumnValue::Text(self.ad_type.as_deref()),
            VisitColumn::AdSource => ColumnValue::Text(self.ad_source.as_deref()),
            VisitColumn::SchemaVersion => ColumnValue::Integer(self.schema_version),
            VisitColumn::AdCampaignId => ColumnValue::Integer(self.ad_campaign_id),
            VisitColumn::AdKeyword => ColumnValue::Text(self.ad_keyword.as_deref()),
            VisitColumn::AdGroupId => ColumnValue::Integer(self.ad_group_id),
            VisitColumn::AdCreative => ColumnValue::Integer(self.ad_creative),
        }
    }

    pub fn is_blank(&self) -> bool {
        VisitColumn::ALL.iter().all(|c| self.value(*c).is_null())
    }

    /// Whether `self`, taken as a stored row, counts as a duplicate of `candidate`.
    ///
    /// A stored null matches any candidate value in that column. A candidate null only
    /// matches a stored null, the same way `col = NULL OR col IS NULL` evaluates in SQL.
    pub fn wildcard_matches(&self, candidate: &VisitRecord) -> bool {
        VisitColumn::ALL.iter().all(|column| {
            let stored = self.value(*column);
            let wanted = candidate.value(*column);
            stored.is_null() || (!wanted.is_null() && stored == wanted)
        })
    }
}

/// Shorthand for [`VisitRecord::parse`].
pub fn parse_visit_url(url: &str) -> Result<VisitRecord, ParseError> {
    VisitRecord::parse(url)
}

fn query_params(url: &str) -> HashMap<String, String> {
    let without_fragment = url.split_once('#').map_or(url, |(head, _)| head);
    let query = without_fragment.split_once('?').map_or("", |(_, query)| query);

    let mut params = HashMap::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

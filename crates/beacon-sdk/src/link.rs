//! Link parameters and long-link fallback construction.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{json, Map, Value};
use url::Url;

use beacon_core::prelude::*;

/// Characters left verbatim when embedding the data blob in a long link.
const DATA_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Parameters describing a link to create.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkData {
    pub channel: Option<String>,
    pub feature: Option<String>,
    pub campaign: Option<String>,
    pub stage: Option<String>,
    pub tags: Vec<String>,
    /// Arbitrary deep-link payload carried by the link.
    pub data: Value,
}

impl LinkData {
    pub fn new() -> Self {
        Self {
            data: Value::Object(Map::new()),
            ..Self::default()
        }
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    pub fn campaign(mut self, campaign: impl Into<String>) -> Self {
        self.campaign = Some(campaign.into());
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Request body for the link-creation operation.
    pub fn to_payload(&self) -> Value {
        let mut payload = Map::new();
        if let Some(ref channel) = self.channel {
            payload.insert("channel".to_string(), json!(channel));
        }
        if let Some(ref feature) = self.feature {
            payload.insert("feature".to_string(), json!(feature));
        }
        if let Some(ref campaign) = self.campaign {
            payload.insert("campaign".to_string(), json!(campaign));
        }
        if let Some(ref stage) = self.stage {
            payload.insert("stage".to_string(), json!(stage));
        }
        if !self.tags.is_empty() {
            payload.insert("tags".to_string(), json!(self.tags));
        }
        if !self.data.is_null() {
            payload.insert("data".to_string(), self.data.clone());
        }
        Value::Object(payload)
    }

    /// Build the long-link fallback used when short-link creation fails or
    /// reports a duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `base_url` is not a valid URL.
    pub fn long_url(&self, base_url: &str, app_key: &str) -> Result<String> {
        let mut url = Url::parse(base_url)
            .map_err(|e| Error::config(format!("invalid base url {base_url}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| Error::config(format!("base url cannot carry a path: {base_url}")))?
            .push("a")
            .push(app_key);

        let mut fields: Vec<(&str, &str)> = Vec::new();
        if let Some(ref channel) = self.channel {
            fields.push(("channel", channel));
        }
        if let Some(ref feature) = self.feature {
            fields.push(("feature", feature));
        }
        if let Some(ref campaign) = self.campaign {
            fields.push(("campaign", campaign));
        }
        if let Some(ref stage) = self.stage {
            fields.push(("stage", stage));
        }
        for tag in &self.tags {
            fields.push(("tags", tag));
        }
        if !fields.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in fields {
                pairs.append_pair(key, value);
            }
        }

        // The deep-link payload travels as one percent-encoded JSON blob.
        if self.data.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            let encoded = utf8_percent_encode(&self.data.to_string(), DATA_ENCODE_SET).to_string();
            let query = match url.query() {
                Some(q) if !q.is_empty() => format!("{q}&data={encoded}"),
                _ => format!("data={encoded}"),
            };
            url.set_query(Some(&query));
        }

        Ok(url.to_string())
    }
}

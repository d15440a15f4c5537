//! Datafile schema and the CDN fetcher behind the polling loop.

use serde::Deserialize;

use crate::error::CoreError;

/// Parsed datafile.  The evaluator consumes this shape directly; unknown
/// fields in the raw JSON are ignored.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Datafile {
    pub revision: String,
    pub flags: Vec<FlagDefinition>,
    pub events: Vec<EventDefinition>,
    pub experiments: Vec<ExperimentDefinition>,
    /// Audience segments every user of this project qualifies for.
    pub segments: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FlagDefinition {
    pub key: String,
    pub enabled: bool,
    pub rule_key: String,
    pub variation_key: String,
}

impl Default for FlagDefinition {
    fn default() -> Self {
        Self {
            key: String::new(),
            enabled: false,
            rule_key: String::new(),
            variation_key: "off".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventDefinition {
    pub key: String,
    pub id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExperimentDefinition {
    pub key: String,
    pub variations: Vec<String>,
}

impl Datafile {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw)
            .map_err(|e| CoreError::Transient(format!("datafile parse failed: {e}")))
    }
}

/// Fetches one SDK key's datafile from the CDN.  An SDK key of the form
/// `key:token` carries a bearer token for authenticated datafiles.
#[derive(Clone, Debug)]
pub struct DatafileFetcher {
    http: reqwest::Client,
    url: String,
    access_token: Option<String>,
}

impl DatafileFetcher {
    pub fn new(url_template: &str, sdk_key: &str) -> Self {
        let (key, token) = split_sdk_key(sdk_key);
        Self {
            http: reqwest::Client::new(),
            url: url_template.replacen("{}", key, 1),
            access_token: token.map(str::to_string),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the raw body plus the parsed form.
    pub async fn fetch(&self) -> Result<(String, Datafile), CoreError> {
        let mut req = self.http.get(&self.url);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("datafile fetch failed: {e}")))?;
        match resp.status() {
            s if s.is_success() => {}
            reqwest::StatusCode::FORBIDDEN => {
                return Err(CoreError::Forbidden(
                    "upstream refused the datafile request".to_string(),
                ))
            }
            s => {
                return Err(CoreError::Transient(format!(
                    "datafile fetch returned {s}"
                )))
            }
        }
        let raw = resp
            .text()
            .await
            .map_err(|e| CoreError::Transient(format!("datafile read failed: {e}")))?;
        let parsed = Datafile::parse(&raw)?;
        Ok((raw, parsed))
    }
}

/// `key:token` splits into the CDN key and a datafile access token.
pub fn split_sdk_key(sdk_key: &str) -> (&str, Option<&str>) {
    match sdk_key.split_once(':') {
        Some((key, token)) if !token.is_empty() => (key, Some(token)),
        Some((key, _)) => (key, None),
        None => (sdk_key, None),
    }
}

use std::time::Duration;

use consumption_client::domain::DateRange;
use reqwest::{header, Client, Response, StatusCode};
use scraper::{Html, Selector};
use serde::Deserialize;
use time::{macros::format_description, Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use super::{Contract, Credentials, ProviderClient, ProviderError, RawSample, Tariff};

pub const DEFAULT_BASE_URL: &str = "https://my.ekz.ch";
pub const DEFAULT_DATA_TYPE: &str = "PK_VERB_15MIN";

/// Intervals per hour for a consumption data type, `None` for daily types
/// such as `PK_VERB_TAG_METER` which cannot fill hourly statistics.
pub fn samples_per_hour(data_type: &str) -> Option<usize> {
    match data_type {
        "PK_VERB_15MIN" => Some(4),
        _ => None,
    }
}

const USER_AGENT: &str = "consumption-sync";
const LOGIN_FORM: &str = "form#kc-form-login";
const TWO_FACTOR_FORM: &str = "form#kc-sms-code-login-form";
const MAINTENANCE_MARKER: &str = "Es tut uns leid";
const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml";
const JSON_ACCEPT: &str = "application/json, text/plain, */*";
const CONSUMPTION_PATH: &str = "/api/portal-services/consumption-view/v1/consumption-data";
const INSTALLATIONS_PATH: &str =
    "/api/portal-services/consumption-view/v1/installation-selection-data";

/// Client for the myEKZ consumption portal.
#[derive(Debug, Clone)]
pub struct EkzClient {
    base_url: String,
    data_type: String,
    timeout: Duration,
}

/// Cookie-backed portal session obtained from a successful login.
pub struct EkzSession {
    http: Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumptionData {
    series: Option<Series>,
    series_ht: Option<Series>,
    series_nt: Option<Series>,
}

#[derive(Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<ApiValue>,
}

#[derive(Deserialize)]
struct ApiValue {
    value: Option<f64>,
    /// `YYYYMMDDHHMMSS` in UTC.
    timestamp: i64,
    status: String,
}

#[derive(Deserialize)]
struct InstallationSelection {
    #[serde(default)]
    contracts: Vec<ApiContract>,
}

#[derive(Deserialize)]
struct ApiContract {
    anlage: String,
    einzdat: Option<String>,
    auszdat: Option<String>,
}

impl EkzClient {
    pub fn new(base_url: impl Into<String>, data_type: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            data_type: data_type.into(),
            timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transient(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::TransientFetch(format!("request timed out: {e}"))
    } else {
        ProviderError::TransientFetch(format!("request failed: {e}"))
    }
}

fn select_first(html: &str, selector: &str) -> Option<Option<String>> {
    let selector = Selector::parse(selector).ok()?;
    let doc = Html::parse_document(html);
    let el = doc.select(&selector).next()?;
    Some(el.value().attr("action").map(str::to_string))
}

fn has_element(html: &str, selector: &str) -> bool {
    select_first(html, selector).is_some()
}

fn form_action(html: &str, selector: &str) -> Option<String> {
    select_first(html, selector).flatten()
}

/// Map API status codes onto the error taxonomy. Session expiry shows up
/// either as 401/403 or as a redirect to the HTML login page.
fn check_api_response(resp: &Response) -> Result<(), ProviderError> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ProviderError::Authentication(format!(
            "portal rejected session with HTTP {status}"
        )));
    }
    if !status.is_success() {
        return Err(ProviderError::TransientFetch(format!("portal returned HTTP {status}")));
    }
    let is_json = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));
    if !is_json {
        return Err(ProviderError::Authentication(
            "session expired, portal answered with the login page".to_string(),
        ));
    }
    Ok(())
}

fn parse_api_timestamp(ts: i64) -> Option<OffsetDateTime> {
    if ts <= 0 {
        return None;
    }
    let second = u8::try_from(ts % 100).ok()?;
    let minute = u8::try_from(ts / 100 % 100).ok()?;
    let hour = u8::try_from(ts / 10_000 % 100).ok()?;
    let day = u8::try_from(ts / 1_000_000 % 100).ok()?;
    let month = u8::try_from(ts / 100_000_000 % 100).ok()?;
    let year = i32::try_from(ts / 10_000_000_000).ok()?;

    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;
    let time = Time::from_hms(hour, minute, second).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

fn parse_api_date(s: &str) -> Option<Date> {
    Date::parse(s.trim(), format_description!("[year]-[month]-[day]")).ok()
}

impl ConsumptionData {
    fn into_samples(self) -> Vec<RawSample> {
        let series = [
            (self.series_nt, Tariff::Low),
            (self.series_ht, Tariff::High),
            (self.series, Tariff::Single),
        ];

        let mut out = Vec::new();
        for (series, tariff) in series {
            let Some(series) = series else { continue };
            for v in series.values {
                let Some(ts) = parse_api_timestamp(v.timestamp) else {
                    tracing::warn!(timestamp = v.timestamp, "skipping sample with invalid timestamp");
                    continue;
                };
                // A null value is a hole whatever its status says.
                let Some(kwh) = v.value else {
                    tracing::debug!(%ts, status = %v.status, "skipping sample without value");
                    continue;
                };
                out.push(RawSample {
                    ts,
                    kwh,
                    tariff,
                    status: v.status,
                });
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl ProviderClient for EkzClient {
    type Session = EkzSession;

    fn name(&self) -> &str {
        "ekz"
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<EkzSession, ProviderError> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::TransientFetch(format!("failed to build HTTP client: {e}")))?;

        let landing = http
            .get(self.url("/verbrauch/"))
            .header(header::ACCEPT, HTML_ACCEPT)
            .send()
            .await
            .map_err(transient)?;
        if !landing.status().is_success() {
            return Err(ProviderError::TransientFetch(format!(
                "portal unreachable: HTTP {}",
                landing.status()
            )));
        }
        let landing_url = landing.url().clone();
        let html = landing.text().await.map_err(transient)?;

        let action = match form_action(&html, LOGIN_FORM) {
            Some(action) => action,
            None if html.contains(MAINTENANCE_MARKER) => {
                return Err(ProviderError::TransientFetch(
                    "portal is offline for maintenance".to_string(),
                ))
            }
            None => {
                return Err(ProviderError::TransientFetch(
                    "login form not found on portal page".to_string(),
                ))
            }
        };
        let auth_url = landing_url.join(&action).map_err(|e| {
            ProviderError::TransientFetch(format!("invalid login form action '{action}': {e}"))
        })?;

        let resp = http
            .post(auth_url)
            .header(header::ACCEPT, HTML_ACCEPT)
            .form(&[
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await
            .map_err(transient)?;
        let status = resp.status();
        let html = resp.text().await.map_err(transient)?;

        if status.is_server_error() {
            return Err(ProviderError::TransientFetch(format!("login returned HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ProviderError::Authentication(format!(
                "login rejected with HTTP {status}"
            )));
        }
        if has_element(&html, TWO_FACTOR_FORM) {
            return Err(ProviderError::Authentication(
                "two-factor authentication is enabled for this account; disable it to allow automated imports"
                    .to_string(),
            ));
        }
        if html.contains(MAINTENANCE_MARKER) {
            return Err(ProviderError::TransientFetch(
                "portal is offline for maintenance".to_string(),
            ));
        }
        // Keycloak answers a bad password with the login form again.
        if has_element(&html, LOGIN_FORM) {
            return Err(ProviderError::Authentication(
                "invalid username or password".to_string(),
            ));
        }

        Ok(EkzSession { http })
    }

    async fn fetch(
        &self,
        session: &EkzSession,
        installation_id: &str,
        range: DateRange,
    ) -> Result<Vec<RawSample>, ProviderError> {
        // The portal's `to` is inclusive.
        let from = range.start.to_string();
        let to = range.last_day().to_string();

        tracing::debug!(installation_id, %from, %to, data_type = %self.data_type, "fetching consumption data");
        let resp = session
            .http
            .get(self.url(CONSUMPTION_PATH))
            .query(&[
                ("installationId", installation_id),
                ("from", from.as_str()),
                ("to", to.as_str()),
                ("type", self.data_type.as_str()),
            ])
            .header(header::ACCEPT, JSON_ACCEPT)
            .send()
            .await
            .map_err(transient)?;
        check_api_response(&resp)?;

        let data: ConsumptionData = resp
            .json()
            .await
            .map_err(|e| ProviderError::TransientFetch(format!("invalid consumption payload: {e}")))?;
        let samples = data.into_samples();

        if !samples.iter().any(RawSample::is_available) {
            return Err(ProviderError::NoData {
                installation_id: installation_id.to_string(),
                range,
            });
        }
        Ok(samples)
    }

    async fn installations(&self, session: &EkzSession) -> Result<Vec<Contract>, ProviderError> {
        let resp = session
            .http
            .get(self.url(INSTALLATIONS_PATH))
            .query(&[("installationVariant", "CONSUMPTION")])
            .header(header::ACCEPT, JSON_ACCEPT)
            .send()
            .await
            .map_err(transient)?;
        check_api_response(&resp)?;

        let data: InstallationSelection = resp.json().await.map_err(|e| {
            ProviderError::TransientFetch(format!("invalid installation payload: {e}"))
        })?;

        let mut contracts = Vec::with_capacity(data.contracts.len());
        for c in data.contracts {
            let Some(move_in) = c.einzdat.as_deref().and_then(parse_api_date) else {
                tracing::warn!(installation_id = %c.anlage, "contract without usable move-in date, skipping");
                continue;
            };
            contracts.push(Contract {
                installation_id: c.anlage,
                move_in,
                move_out: c.auszdat.as_deref().and_then(parse_api_date),
            });
        }
        Ok(contracts)
    }
}

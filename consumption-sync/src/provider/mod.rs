pub mod ekz;
pub mod session;

pub use ekz::{EkzClient, EkzSession};
pub use session::SessionManager;

use consumption_client::domain::DateRange;
use time::{Date, OffsetDateTime};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Login or session rejected. Needs new credentials before it can succeed.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Network failure, 5xx, timeout or maintenance page.
    #[error("transient fetch error: {0}")]
    TransientFetch(String),
    #[error("no data for installation {installation_id} in {range}")]
    NoData {
        installation_id: String,
        range: DateRange,
    },
}

impl ProviderError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::TransientFetch(_) => "transient",
            Self::NoData { .. } => "no_data",
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tariff {
    High,
    Low,
    Single,
}

/// One consumption value as delivered by the portal.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    /// UTC start of the metering interval.
    pub ts: OffsetDateTime,
    pub kwh: f64,
    pub tariff: Tariff,
    pub status: String,
}

impl RawSample {
    /// Placeholders the portal emits for intervals it has not received yet.
    pub fn is_available(&self) -> bool {
        !matches!(self.status.as_str(), "NOT_AVAILABLE" | "MISSING")
    }
}

/// Supply contract of one installation as listed by the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub installation_id: String,
    pub move_in: Date,
    pub move_out: Option<Date>,
}

#[async_trait::async_trait]
pub trait ProviderClient: Send + Sync {
    type Session: Send + Sync;

    /// Short provider tag used in statistic ids, e.g. `ekz`.
    fn name(&self) -> &str;

    async fn authenticate(&self, credentials: &Credentials) -> Result<Self::Session, ProviderError>;

    /// Raw samples for `[range.start, range.end)`.
    async fn fetch(
        &self,
        session: &Self::Session,
        installation_id: &str,
        range: DateRange,
    ) -> Result<Vec<RawSample>, ProviderError>;

    async fn installations(&self, session: &Self::Session) -> Result<Vec<Contract>, ProviderError>;
}

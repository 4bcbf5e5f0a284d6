//! DNS API: single-record changes under a hosted zone.

use async_trait::async_trait;

use super::BackendResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Cname,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cname => "CNAME",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSet {
    /// Fully qualified record name.
    pub name: String,
    pub record_type: RecordType,
    pub ttl: u32,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub action: ChangeAction,
    pub record: RecordSet,
}

/// DNS API interface.
#[async_trait]
pub trait DnsApi: Send + Sync {
    /// Apply one change. Deleting a missing record fails with
    /// [`super::BackendError::RecordNotFound`].
    async fn change_record(&self, zone_id: &str, change: Change) -> BackendResult<()>;
}

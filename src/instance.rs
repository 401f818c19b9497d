use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// One target VM. Immutable after ingestion; workers only ever read it.
///
/// Identity is the full `(cloud, account, region, id)` tuple: the same
/// instance id can legitimately recur across accounts or regions.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: String,
    pub cloud: String,
    pub account: String,
    pub region: String,
    /// Auxiliary inventory columns (environment, team, OS hint, credential
    /// profile, ...), keyed by inventory header name.
    pub metadata: HashMap<String, String>,
}

impl Instance {
    pub fn new(
        cloud: impl Into<String>,
        account: impl Into<String>,
        region: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            cloud: cloud.into(),
            account: account.into(),
            region: region.into(),
            metadata: HashMap::new(),
        }
    }

    /// Full identity, unique within a run.
    pub fn identity(&self) -> String {
        format!("{}/{}/{}/{}", self.cloud, self.account, self.region, self.id)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.cloud, self.account, self.region, self.id
        )
    }
}

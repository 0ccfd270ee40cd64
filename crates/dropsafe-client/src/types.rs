//! Wire records exchanged with the journalist API.

use serde::Deserialize;

/// Login material for `authenticate`. The one-time code is the current TOTP
/// value, entered by the operator alongside the passphrase.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub passphrase: String,
    pub one_time_code: String,
}

/// Session material returned by a successful token request.
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub token: String,
    pub expiration: String,
    pub journalist_uuid: String,

    #[serde(default)]
    pub journalist_first_name: Option<String>,

    #[serde(default)]
    pub journalist_last_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Source {
    pub uuid: String,
    pub journalist_designation: String,

    #[serde(default)]
    pub is_starred: bool,

    #[serde(default)]
    pub last_updated: Option<String>,

    #[serde(default)]
    pub interaction_count: u64,

    #[serde(default)]
    pub number_of_documents: u64,

    #[serde(default)]
    pub number_of_messages: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Submission {
    pub uuid: String,
    pub filename: String,

    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub is_read: bool,

    #[serde(default)]
    pub source_url: Option<String>,
}

impl Submission {
    /// The owning source's UUID, recovered from the `source_url` reference.
    pub fn source_uuid(&self) -> Option<&str> {
        uuid_from_url(self.source_url.as_deref()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reply {
    pub uuid: String,
    pub filename: String,

    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub journalist_username: Option<String>,

    #[serde(default)]
    pub is_deleted_by_source: bool,

    #[serde(default)]
    pub source_url: Option<String>,
}

impl Reply {
    pub fn source_uuid(&self) -> Option<&str> {
        uuid_from_url(self.source_url.as_deref()?)
    }
}

fn uuid_from_url(url: &str) -> Option<&str> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
}

// Collection endpoints wrap their lists in a single-key envelope.

#[derive(Debug, Deserialize)]
pub(crate) struct SourcesEnvelope {
    pub sources: Vec<Source>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubmissionsEnvelope {
    pub submissions: Vec<Submission>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RepliesEnvelope {
    pub replies: Vec<Reply>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct MessageEnvelope {
    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub error: Option<String>,
}

//! Blocking journalist-API client.
//!
//! All connection settings arrive through [`ClientCfg`]; nothing is read from
//! ambient files. Authentication stores a `Token` header used by every later
//! request, and downloads stream straight to disk.

use crate::error::{classify_status, transport_error, ClientError, ClientResult};
use crate::types::{
    Credentials, MessageEnvelope, RepliesEnvelope, Reply, Session, Source, SourcesEnvelope,
    Submission, SubmissionsEnvelope,
};
use dropsafe_core::ClientCfg;
use log::{debug, info};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, ETAG};
use reqwest::Url;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct ApiClient {
    http: Client,
    base: Url,
    request_timeout: Duration,
    download_timeout: Duration,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ClientCfg) -> ClientResult<Self> {
        let base = Url::parse(&config.server)
            .map_err(|err| ClientError::Api(format!("invalid server URL {}: {err}", config.server)))?;

        // Timeouts are applied per request; downloads get a longer budget.
        let http = Client::builder()
            .timeout(None)
            .build()
            .map_err(|err| ClientError::Api(format!("could not build HTTP client: {err}")))?;

        Ok(Self {
            http,
            base,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            download_timeout: Duration::from_secs(config.download_timeout_secs),
            token: None,
        })
    }

    /// Exchange credentials (and the current one-time code) for a session
    /// token used by all subsequent requests.
    pub fn authenticate(&mut self, credentials: &Credentials) -> ClientResult<Session> {
        let body = serde_json::json!({
            "username": credentials.username,
            "passphrase": credentials.passphrase,
            "one_time_code": credentials.one_time_code,
        });

        let response = self
            .http
            .post(self.endpoint("api/v1/token")?)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .map_err(transport_error)?;
        let response = checked(response, "token endpoint not found")?;

        let session: Session = response
            .json()
            .map_err(|err| ClientError::Auth(format!("unexpected token response: {err}")))?;

        info!("authenticated as journalist {}", session.journalist_uuid);
        self.token = Some(session.token.clone());
        Ok(session)
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    pub fn sources(&self) -> ClientResult<Vec<Source>> {
        let response = self.get("api/v1/sources", "no sources collection")?;
        let envelope: SourcesEnvelope = parse_json(response)?;
        Ok(envelope.sources)
    }

    pub fn submissions(&self, source_uuid: &str) -> ClientResult<Vec<Submission>> {
        let response = self.get(
            &format!("api/v1/sources/{source_uuid}/submissions"),
            &format!("missing source {source_uuid}"),
        )?;
        let envelope: SubmissionsEnvelope = parse_json(response)?;
        Ok(envelope.submissions)
    }

    pub fn replies(&self, source_uuid: &str) -> ClientResult<Vec<Reply>> {
        let response = self.get(
            &format!("api/v1/sources/{source_uuid}/replies"),
            &format!("missing source {source_uuid}"),
        )?;
        let envelope: RepliesEnvelope = parse_json(response)?;
        Ok(envelope.replies)
    }

    pub fn delete_submission(&self, submission: &Submission) -> ClientResult<()> {
        let source_uuid = source_uuid_of(submission.source_uuid(), &submission.uuid)?;
        self.delete(
            &format!(
                "api/v1/sources/{source_uuid}/submissions/{}",
                submission.uuid
            ),
            &format!("missing submission {}", submission.uuid),
        )
    }

    pub fn delete_reply(&self, reply: &Reply) -> ClientResult<()> {
        let source_uuid = source_uuid_of(reply.source_uuid(), &reply.uuid)?;
        self.delete(
            &format!("api/v1/sources/{source_uuid}/replies/{}", reply.uuid),
            &format!("missing reply {}", reply.uuid),
        )
    }

    /// Fetch one submission into `target_dir`, streaming to disk.
    ///
    /// Returns the server's etag (`algorithm:checksum`) and the saved path;
    /// verify with [`crate::verify_etag`] before trusting the content.
    pub fn download_submission(
        &self,
        submission: &Submission,
        target_dir: &Path,
    ) -> ClientResult<(String, PathBuf)> {
        let source_uuid = source_uuid_of(submission.source_uuid(), &submission.uuid)?;
        let filename = plain_filename(&submission.filename)?;

        debug!("downloading submission {}", submission.uuid);
        let response = self
            .request(self.http.get(self.endpoint(&format!(
                "api/v1/sources/{source_uuid}/submissions/{}/download",
                submission.uuid
            ))?))
            .timeout(self.download_timeout)
            .send()
            .map_err(transport_error)?;
        let mut response = checked(
            response,
            &format!("missing submission {}", submission.uuid),
        )?;

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_matches('"').to_string())
            .ok_or_else(|| ClientError::Api("download response carries no Etag".to_string()))?;

        let filepath = target_dir.join(filename);
        let mut file = File::create(&filepath)
            .map_err(|err| ClientError::Api(format!("create {}: {err}", filepath.display())))?;
        let written = response.copy_to(&mut file).map_err(transport_error)?;

        debug!("saved {written} bytes to {}", filepath.display());
        Ok((etag, filepath))
    }

    /// Revoke the session token. The local token is dropped even when the
    /// server-side revocation cannot be confirmed.
    pub fn logout(&mut self) -> ClientResult<()> {
        let result = self
            .request(self.http.post(self.endpoint("api/v1/logout")?))
            .timeout(self.request_timeout)
            .send()
            .map_err(transport_error)
            .and_then(|response| checked(response, "logout endpoint not found"))
            .map(|_| ());

        self.token = None;
        result
    }

    fn get(&self, path: &str, missing: &str) -> ClientResult<Response> {
        let response = self
            .request(self.http.get(self.endpoint(path)?))
            .timeout(self.request_timeout)
            .send()
            .map_err(transport_error)?;
        checked(response, missing)
    }

    fn delete(&self, path: &str, missing: &str) -> ClientResult<()> {
        let response = self
            .request(self.http.delete(self.endpoint(path)?))
            .timeout(self.request_timeout)
            .send()
            .map_err(transport_error)?;
        checked(response, missing).map(|_| ())
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Token {token}")),
            None => builder,
        }
    }

    fn endpoint(&self, path: &str) -> ClientResult<Url> {
        self.base
            .join(path)
            .map_err(|err| ClientError::Api(format!("invalid endpoint {path}: {err}")))
    }
}

/// Raise non-success statuses as taxonomy errors, pulling the server's
/// `error` field into the message when one is present.
fn checked(response: Response, missing: &str) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let detail = response
        .json::<MessageEnvelope>()
        .ok()
        .and_then(|envelope| envelope.error.or(envelope.message))
        .unwrap_or_default();
    Err(classify_status(status, missing, &detail)
        .unwrap_or_else(|| ClientError::Api(format!("unexpected status {status}"))))
}

fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> ClientResult<T> {
    response
        .json()
        .map_err(|err| ClientError::Api(format!("could not parse server response: {err}")))
}

fn source_uuid_of<'a>(source_uuid: Option<&'a str>, record_uuid: &str) -> ClientResult<&'a str> {
    source_uuid.ok_or_else(|| {
        ClientError::Api(format!("record {record_uuid} carries no source reference"))
    })
}

/// Server-supplied filenames must be plain names; anything with a path
/// component would escape the target directory.
fn plain_filename(filename: &str) -> ClientResult<&str> {
    let candidate = Path::new(filename);
    let is_plain = candidate.components().count() == 1
        && candidate.file_name().is_some_and(|name| name == filename);
    if is_plain {
        Ok(filename)
    } else {
        Err(ClientError::Api(format!(
            "refusing server-supplied filename {filename}"
        )))
    }
}

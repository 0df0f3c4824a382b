use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("settings file {path} is malformed: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid settings: {0}")]
    Invalid(String),
    #[error("unknown course `{0}`")]
    UnknownCourse(String),
    #[error("course `{course}` has no assessment `{assessment}`")]
    UnknownAssessment { course: String, assessment: String },
    #[error("course `{0}` requires an assessment selection")]
    MissingAssessment(String),
    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("process `{0}` is not available for this selection")]
    ProcessUnavailable(String),
}

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("error loading client secret file {path}: {source}")]
    ReadCredentials {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("client secret file {path} is malformed: {source}")]
    ParseCredentials {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("client secret file has neither an `installed` nor a `web` section")]
    MissingClient,
    #[error("invalid auth_uri: {0}")]
    InvalidAuthUri(String),
    #[error("failed to read stored token {path}: {source}")]
    ReadToken {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("stored token {path} is corrupt: {source}")]
    CorruptToken {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize token for {path}: {source}")]
    SerializeToken {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to store token to {path}: {source}")]
    WriteToken {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read authorization code: {0}")]
    Prompt(#[source] std::io::Error),
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token exchange failed ({status}): {message}")]
    TokenExchange { status: u16, message: String },
    #[error("access token expired and no refresh token is stored")]
    NoRefreshToken,
}

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("the API returned an error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("the API returned an error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("failed to read rows from {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error(transparent)]
    Auth(#[from] AuthorizationError),
}

/// A record whose identity fields cannot name an artifact or a recipient.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("record is missing a {0}")]
    Missing(&'static str),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to read template {path}: {source}")]
    Template {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no template configured for this selection")]
    NoTemplate,
    #[error("template archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("template part {part} is not valid UTF-8")]
    Encoding { part: String },
    #[error("unclosed tag in template part {part}")]
    UnclosedTag { part: String },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("missing merge input {0}")]
    MissingInput(PathBuf),
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("`{program}` exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to read attachment {path}: {source}")]
    Attachment {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("send request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("mail provider rejected the message ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error(transparent)]
    Auth(#[from] AuthorizationError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use reqwest::Client;
use serde_json::json;
use uuid::Uuid;

use crate::auth::OAuthClient;
use crate::config::ResolvedConfig;
use crate::error::DeliveryError;
use crate::models::StudentRecord;

const GMAIL_SEND_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages/send";

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(filename: String, bytes: Vec<u8>) -> Self {
        let content_type = content_type_for(&filename).to_string();
        Self {
            filename,
            content_type,
            bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), DeliveryError>;
}

pub fn content_type_for(filename: &str) -> &'static str {
    let extension = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match extension.as_str() {
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

pub fn subject_for(config: &ResolvedConfig) -> String {
    match &config.assessment_name {
        Some(assessment) => format!("{} - {} Results", config.course_name, assessment),
        None => format!("{} Results", config.course_name),
    }
}

pub fn compose_result_email(
    record: &StudentRecord,
    config: &ResolvedConfig,
    attachment: Attachment,
) -> Result<OutgoingEmail, DeliveryError> {
    let assessment = config
        .assessment_name
        .as_deref()
        .unwrap_or(config.course_name.as_str());

    let mut body = String::new();
    let _ = writeln!(body, "Kia ora {}, <br /> <br />", record.first_name.trim());
    let _ = writeln!(
        body,
        "I have attached your {} assessment result. If there are any issues, please do not hesitate to ask.<br /> <br />",
        assessment
    );
    let _ = writeln!(body, "Ngā mihi nui, <br /> <br />");
    let _ = write!(body, "{}", config.sender.signature);

    Ok(OutgoingEmail {
        from: config.sender.address.clone(),
        to: record.recipient()?,
        subject: subject_for(config),
        html_body: body,
        attachments: vec![attachment],
    })
}

fn wrap_base64(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len() + encoded.len() / 76 * 2);
    let bytes = encoded.as_bytes();
    for chunk in bytes.chunks(76) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
    out
}

/// RFC 2047 encoded-word so non-ASCII subjects survive transport.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value))
    }
}

/// Renders a multipart/mixed MIME message with an HTML body and attachments.
pub fn to_mime(email: &OutgoingEmail, boundary: &str) -> String {
    let mut out = String::new();
    let _ = write!(out, "From: {}\r\n", email.from);
    let _ = write!(out, "To: {}\r\n", email.to);
    let _ = write!(out, "Subject: {}\r\n", encode_header(&email.subject));
    let _ = write!(out, "MIME-Version: 1.0\r\n");
    let _ = write!(
        out,
        "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
        boundary
    );

    let _ = write!(out, "--{}\r\n", boundary);
    let _ = write!(out, "Content-Type: text/html; charset=UTF-8\r\n");
    let _ = write!(out, "Content-Transfer-Encoding: base64\r\n\r\n");
    out.push_str(&wrap_base64(&STANDARD.encode(email.html_body.as_bytes())));

    for attachment in &email.attachments {
        let _ = write!(out, "--{}\r\n", boundary);
        let _ = write!(
            out,
            "Content-Type: {}; name=\"{}\"\r\n",
            attachment.content_type, attachment.filename
        );
        let _ = write!(
            out,
            "Content-Disposition: attachment; filename=\"{}\"\r\n",
            attachment.filename
        );
        let _ = write!(out, "Content-Transfer-Encoding: base64\r\n\r\n");
        out.push_str(&wrap_base64(&STANDARD.encode(&attachment.bytes)));
    }

    let _ = write!(out, "--{}--\r\n", boundary);
    out
}

/// Sends through the Gmail REST API as the authorized account.
pub struct GmailMailer {
    client: Client,
    auth: Arc<OAuthClient>,
}

impl GmailMailer {
    pub fn new(auth: Arc<OAuthClient>) -> Self {
        Self {
            client: Client::new(),
            auth,
        }
    }
}

#[async_trait]
impl Mailer for GmailMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), DeliveryError> {
        let boundary = format!("part-{}", Uuid::new_v4().simple());
        let raw = URL_SAFE.encode(to_mime(email, &boundary));
        let token = self.auth.access_token().await?;

        let response = self
            .client
            .post(GMAIL_SEND_URL)
            .bearer_auth(token)
            .json(&json!({ "raw": raw }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await?;
            return Err(DeliveryError::Rejected { status, message });
        }
        Ok(())
    }
}

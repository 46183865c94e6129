//! Email notification action, sent over SMTP via lettre.

use serde_json::Value;

use rulevm_core::config::SmtpConfig;

use crate::error::{Result, RuleError};
use crate::instructions::require_str;

/// `SEND_EMAIL {subject, body(html), to}`.
#[derive(Debug, Clone, PartialEq)]
pub struct SendEmailAction {
    pub subject: String,
    pub body: String,
    pub to: Vec<String>,
}

impl SendEmailAction {
    pub fn parse(entry: &Value) -> Result<Self> {
        const TAG: &str = "send_email";
        let to = entry
            .get("to")
            .and_then(|v| v.as_array())
            .ok_or_else(|| RuleError::validation(TAG, "missing or non-array `to`"))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| RuleError::validation(TAG, "`to` entries must be strings"))
            })
            .collect::<Result<Vec<_>>>()?;
        if to.is_empty() {
            return Err(RuleError::validation(TAG, "`to` must name at least one recipient"));
        }
        Ok(Self {
            subject: require_str(entry, TAG, "subject")?,
            body: require_str(entry, TAG, "body")?,
            to,
        })
    }

    pub async fn perform(&self) -> Result<()> {
        let config = SmtpConfig::from_env()
            .ok_or_else(|| RuleError::Action("SMTP transport is not configured".to_string()))?;

        let from_mailbox: lettre::message::Mailbox = config
            .from_address
            .parse()
            .map_err(|e| RuleError::Action(format!("Invalid from address: {}", e)))?;

        let mut builder = lettre::Message::builder()
            .from(from_mailbox)
            .subject(self.subject.clone());
        for to_addr in &self.to {
            let mailbox: lettre::message::Mailbox = to_addr
                .parse()
                .map_err(|e| RuleError::Action(format!("Invalid to address: {}", e)))?;
            builder = builder.to(mailbox);
        }

        let email = builder
            .multipart(
                lettre::message::MultiPart::alternative()
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(lettre::message::header::ContentType::TEXT_PLAIN)
                            .body(self.subject.clone()),
                    )
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(lettre::message::header::ContentType::TEXT_HTML)
                            .body(self.body.clone()),
                    ),
            )
            .map_err(|e| RuleError::Action(format!("Failed to build email: {}", e)))?;

        let recipients = self.to.len();
        tokio::task::spawn_blocking(move || {
            let creds = lettre::transport::smtp::authentication::Credentials::new(
                config.username,
                config.password,
            );
            let mailer = lettre::SmtpTransport::relay(&config.server)
                .map_err(|e| RuleError::Action(format!("Invalid SMTP server: {}", e)))?
                .port(config.port)
                .credentials(creds)
                .build();

            lettre::Transport::send(&mailer, &email)
                .map_err(|e| RuleError::Action(format!("Unable to send the email: {}", e)))?;

            tracing::info!(recipients, "Email sent");
            Ok::<(), RuleError>(())
        })
        .await
        .map_err(|e| RuleError::Action(format!("Email task join error: {}", e)))?
    }
}

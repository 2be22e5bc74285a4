use crate::Config;
use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};
use log::{debug, info, warn};

/// Best-effort delivery of failure reports to the operator. Delivery problems are logged and
/// never surface to the caller.
#[allow(async_fn_in_trait)]
pub trait Notifier {
    async fn notify(&self, subject: &str, body: &str);
}

pub enum Mailer {
    Ses {
        ses_client: aws_sdk_sesv2::Client,
        from: String,
        to: String,
    },
    LogOnly,
}

impl Mailer {
    pub async fn new(config: &Config) -> Self {
        match (&config.sender_email, &config.operator_email) {
            (Some(from), Some(to)) => {
                let aws_config = aws_config::load_from_env().await;
                Self::Ses {
                    ses_client: aws_sdk_sesv2::Client::new(&aws_config),
                    from: from.clone(),
                    to: to.clone(),
                }
            }
            _ => {
                info!("No operator email configured, failures will only be logged");
                Self::LogOnly
            }
        }
    }

    async fn send(
        ses_client: &aws_sdk_sesv2::Client,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> anyhow::Result<()> {
        let subject = Content::builder().data(subject).charset("UTF-8").build()?;
        let body = Content::builder().data(body).charset("UTF-8").build()?;
        let message = Message::builder()
            .subject(subject)
            .body(Body::builder().text(body).build())
            .build();

        ses_client
            .send_email()
            .from_email_address(from)
            .destination(Destination::builder().to_addresses(to).build())
            .content(EmailContent::builder().simple(message).build())
            .send()
            .await?;

        Ok(())
    }
}

impl Notifier for Mailer {
    async fn notify(&self, subject: &str, body: &str) {
        match self {
            Mailer::Ses {
                ses_client,
                from,
                to,
            } => {
                debug!("Emailing {}: {}", to, subject);
                match Self::send(ses_client, from, to, subject, body).await {
                    Ok(()) => info!("Email sent to {}", to),
                    Err(e) => warn!("Failed to email {}: {:#}", to, e),
                }
            }
            Mailer::LogOnly => warn!("{}: {}", subject, body),
        }
    }
}

pub fn subject(pipeline: &str) -> String {
    format!("FPL {} Pipeline: Failed", pipeline)
}

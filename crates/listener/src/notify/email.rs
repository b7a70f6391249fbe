use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::{AsyncTransport, Message};
use std::path::Path;

use super::Notifier;
use crate::error::DeliveryError;

const SUBJECT_MAX_CHARS: usize = 78;

/// Delivers notifications as email. Recipients are mailbox addresses.
///
/// Generic over the transport so the SMTP pool can be swapped for lettre's
/// stub transport.
pub struct EmailNotifier<T> {
    transport: T,
    from: Mailbox,
}

impl<T> EmailNotifier<T> {
    pub fn new(transport: T, from: &str) -> Result<Self, DeliveryError> {
        let from = from
            .parse::<Mailbox>()
            .map_err(|_| DeliveryError::InvalidRecipient(from.to_string()))?;
        Ok(Self { transport, from })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

fn mailbox(recipient: &str) -> Result<Mailbox, DeliveryError> {
    recipient
        .parse()
        .map_err(|_| DeliveryError::InvalidRecipient(recipient.to_string()))
}

/// First non-empty line of the text, shortened to fit a subject header.
fn subject_for(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("notification");
    line.chars().take(SUBJECT_MAX_CHARS).collect()
}

impl<T> EmailNotifier<T>
where
    T: AsyncTransport + Send + Sync,
    T::Error: std::fmt::Display,
{
    async fn dispatch(&self, message: Message) -> Result<(), DeliveryError> {
        self.transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| DeliveryError::Transport(e.to_string()))
    }
}

#[async_trait]
impl<T> Notifier for EmailNotifier<T>
where
    T: AsyncTransport + Send + Sync,
    T::Ok: Send,
    T::Error: std::fmt::Display + Send,
{
    async fn send_text(&self, recipient: &str, text: &str) -> Result<(), DeliveryError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(mailbox(recipient)?)
            .subject(subject_for(text))
            .header(ContentType::TEXT_PLAIN)
            .body(text.to_string())
            .map_err(|e| DeliveryError::Message(e.to_string()))?;
        self.dispatch(message).await
    }

    async fn send_image(&self, recipient: &str, path: &Path) -> Result<(), DeliveryError> {
        let to = mailbox(recipient)?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| DeliveryError::Artifact {
                path: path.to_path_buf(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact.png".to_string());
        let content_type =
            ContentType::parse("image/png").map_err(|e| DeliveryError::Message(e.to_string()))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(file_name.clone())
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(String::new()))
                    .singlepart(Attachment::new(file_name).body(bytes, content_type)),
            )
            .map_err(|e| DeliveryError::Message(e.to_string()))?;
        self.dispatch(message).await
    }
}

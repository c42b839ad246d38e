//! Outbound email contract.
//!
//! Delivery itself is an external collaborator; this service only needs a
//! seam to hand verification and reset tokens to. The default implementation
//! records the dispatch in the log with masked recipients, which is also the
//! behavior used in tests. Send failures never fail the calling request;
//! the user can ask for a resend.

use async_trait::async_trait;
use tracing::info;

use crate::utils::mask_email;

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_verification_email(
        &self,
        email: &str,
        name: &str,
        token: &str,
    ) -> anyhow::Result<()>;

    async fn send_password_reset_email(
        &self,
        email: &str,
        name: &str,
        token: &str,
    ) -> anyhow::Result<()>;
}

/// Log-only mailer. Stands in wherever a real delivery backend is wired up
/// by the surrounding application.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_verification_email(
        &self,
        email: &str,
        _name: &str,
        _token: &str,
    ) -> anyhow::Result<()> {
        info!(recipient = %mask_email(email), "Verification email dispatched");
        Ok(())
    }

    async fn send_password_reset_email(
        &self,
        email: &str,
        _name: &str,
        _token: &str,
    ) -> anyhow::Result<()> {
        info!(recipient = %mask_email(email), "Password reset email dispatched");
        Ok(())
    }
}

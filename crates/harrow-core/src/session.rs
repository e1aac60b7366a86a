//! Scoped ownership of a worker's external session.

use crate::error::AppError;
use crate::traits::SessionProvider;

/// Holds one session and hands it back to its provider when dropped, so the
/// release happens on every exit path: normal return, `?`, task
/// cancellation and unwinding.
pub struct SessionGuard<P: SessionProvider> {
    provider: P,
    session: Option<P::Session>,
    owner: String,
}

impl<P: SessionProvider> SessionGuard<P> {
    pub async fn acquire(provider: &P, owner: &str) -> Result<Self, AppError> {
        let session = provider.open(owner).await?;
        tracing::debug!(%owner, "Session acquired");
        Ok(Self {
            provider: provider.clone(),
            session: Some(session),
            owner: owner.to_string(),
        })
    }

    pub fn session(&self) -> Option<&P::Session> {
        self.session.as_ref()
    }
}

impl<P: SessionProvider> Drop for SessionGuard<P> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.provider.release(session);
            tracing::debug!(owner = %self.owner, "Session released");
        }
    }
}

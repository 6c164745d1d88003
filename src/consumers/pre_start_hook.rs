use crate::broker::Session;
use crate::message::Destination;

#[async_trait::async_trait]
/// A hook to execute logic before a destination starts being consumed.
///
/// # Use case
///
/// Who is in charge of creating the queue a consumer reads from?
/// Depending on your setup, this might be done via Terraform or manually.
/// Often, though, it is preferable to have consumers in charge of creating the objects they
/// rely on.
///
/// A pre-start hook gets access to a session, so it can act against the broker before the
/// first worker of a destination starts receiving. Check out [`hooks`](super::hooks) for
/// ready-made ones.
pub trait ConsumerPreStartHook: Send + Sync + 'static {
    async fn run(&self, session: &dyn Session, destination: &Destination)
        -> Result<(), anyhow::Error>;
}

/// assert it's object safe
type _CHECK = Box<dyn ConsumerPreStartHook>;

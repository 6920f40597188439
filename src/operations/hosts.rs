//! Host fail-over for commands any cluster member can run

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use tracing::warn;

/// Run `f` against each host in turn until one answers.
///
/// Only [`Error::Unreachable`] moves on to the next host; any other error
/// came from a host that ran the command and is returned as is.
pub(crate) async fn first_reachable<'a, T, F>(hosts: &[String], f: F) -> Result<T>
where
    F: Fn(String) -> BoxFuture<'a, Result<T>>,
{
    let mut last = None;
    for host in hosts {
        match f(host.clone()).await {
            Err(e @ Error::Unreachable { .. }) => {
                warn!(host = %host, error = %e, "host unreachable, trying next");
                last = Some(e);
            }
            other => return other,
        }
    }
    Err(last.unwrap_or_else(|| Error::Internal("no hosts to run the command on".into())))
}

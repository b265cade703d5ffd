//! Host key trust bootstrap
//!
//! A host whose key is already known is trusted as is. Otherwise its key is
//! fetched out of band, the fingerprints are shown, and the key is recorded
//! only after a [`Confirmer`] explicitly accepts it. There is no silent
//! trust-on-first-use path.
//!
//! The same confirmer is what a sequential run waits on while the operator
//! installs a key on a host that refused authentication.

use crate::error::TrustError;
use crate::state::{HostTarget, TrustState};
use crate::transport::RemoteTransport;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::{BufRead, Write};
use tracing::{info, warn};

/// Operator decisions a fleet run waits on
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Whether the key with `fingerprints` for `host` is accepted
    async fn confirm(&self, host: &HostTarget, fingerprints: &[String]) -> bool;

    /// Whether the operator has set up key authentication for `host`
    ///
    /// Asked after `host` refused our credentials; `setup` is the command
    /// that installs our key there. Returning `true` retries the connection
    /// once.
    async fn confirm_auth_setup(&self, host: &HostTarget, setup: &str) -> bool;

    /// Whether confirming may block on a human
    fn is_interactive(&self) -> bool;
}

#[async_trait]
impl<C: Confirmer + ?Sized> Confirmer for &C {
    async fn confirm(&self, host: &HostTarget, fingerprints: &[String]) -> bool {
        (**self).confirm(host, fingerprints).await
    }

    async fn confirm_auth_setup(&self, host: &HostTarget, setup: &str) -> bool {
        (**self).confirm_auth_setup(host, setup).await
    }

    fn is_interactive(&self) -> bool {
        (**self).is_interactive()
    }
}

/// Asks the operator on the terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirmer;

#[async_trait]
impl Confirmer for TerminalConfirmer {
    async fn confirm(&self, host: &HostTarget, fingerprints: &[String]) -> bool {
        prompt(host, fingerprints)
    }

    async fn confirm_auth_setup(&self, host: &HostTarget, setup: &str) -> bool {
        prompt_auth_setup(host, setup)
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

fn prompt(host: &HostTarget, fingerprints: &[String]) -> bool {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "The authenticity of host '{}' can't be established.", host);
    for fp in fingerprints {
        let _ = writeln!(stderr, "  key fingerprint: {}", fp);
    }
    let _ = write!(stderr, "Verify the fingerprint out of band. Trust this host? [yes/no] ");
    let _ = stderr.flush();
    drop(stderr);
    answered_yes()
}

fn prompt_auth_setup(host: &HostTarget, setup: &str) -> bool {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{} refused our credentials. In another terminal, run:", host);
    let _ = writeln!(stderr, "  {}", setup);
    let _ = write!(stderr, "Retry the connection once that has finished? [yes/no] ");
    let _ = stderr.flush();
    drop(stderr);
    answered_yes()
}

fn answered_yes() -> bool {
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => answer.trim().eq_ignore_ascii_case("yes"),
        Err(_) => false,
    }
}

/// Accepts exactly the fingerprints supplied up front and nothing else
#[derive(Debug, Default, Clone)]
pub struct PresuppliedConfirmer {
    fingerprints: BTreeSet<String>,
}

impl PresuppliedConfirmer {
    /// Accept any key whose fingerprint is in `fingerprints`
    pub fn new<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fingerprints: fingerprints.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Confirmer for PresuppliedConfirmer {
    async fn confirm(&self, host: &HostTarget, fingerprints: &[String]) -> bool {
        let accepted = fingerprints.iter().any(|fp| self.fingerprints.contains(fp));
        if !accepted {
            warn!(host = %host, offered = ?fingerprints, "no pre-supplied fingerprint matches");
        }
        accepted
    }

    async fn confirm_auth_setup(&self, host: &HostTarget, setup: &str) -> bool {
        warn!(host = %host, setup, "authentication refused and nobody to wait for");
        false
    }

    fn is_interactive(&self) -> bool {
        false
    }
}

/// Make sure `host`'s key is trusted, asking `confirmer` if it is not yet known
pub async fn establish_trust<T, C>(
    transport: &T,
    confirmer: &C,
    host: &HostTarget,
) -> Result<TrustState, TrustError>
where
    T: RemoteTransport + ?Sized,
    C: Confirmer + ?Sized,
{
    if host.trust == TrustState::Trusted || transport.is_known(host).await? {
        return Ok(TrustState::Trusted);
    }

    let key = transport.fetch_host_key(host).await?;
    if !confirmer.confirm(host, &key.fingerprints).await {
        return Err(TrustError::Unconfirmed {
            host: host.address.clone(),
            fingerprints: key.fingerprints,
        });
    }
    transport.trust(host, &key).await?;
    info!(host = %host, fingerprints = ?key.fingerprints, "host key trusted");
    Ok(TrustState::Trusted)
}

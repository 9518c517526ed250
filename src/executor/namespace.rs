//! Temporary namespace overrides.
//!
//! Every overridden key is snapshotted before injection and put back
//! afterwards: the prior binding is restored, or the key is deleted when it
//! did not exist. Globals first bound while the overrides were in place are
//! deleted too. Restoration runs regardless of how the execution ended.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::protocol::Namespace;
use crate::runtime::{Runtime, RuntimeError};

struct Saved<B> {
    key: String,
    prior: Option<B>,
}

/// Bindings displaced by one execution's overrides.
pub struct Snapshot<B> {
    saved: Vec<Saved<B>>,
    baseline: HashSet<String>,
}

impl<B> Snapshot<B> {
    pub fn len(&self) -> usize {
        self.saved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }
}

/// Snapshot and inject `overrides`.
///
/// On failure the keys already injected are restored before the error is
/// returned, so the runtime never keeps a partial override.
pub async fn apply<R: Runtime>(
    runtime: &mut R,
    overrides: &Namespace,
) -> Result<Snapshot<R::Binding>, RuntimeError> {
    let baseline = runtime.global_names().await?.into_iter().collect();
    let mut snapshot = Snapshot { saved: Vec::with_capacity(overrides.len()), baseline };
    for (key, value) in overrides {
        let injected = async {
            let prior = runtime.get_global(key).await?;
            snapshot.saved.push(Saved { key: key.clone(), prior });
            runtime.set_global(key, value).await
        }
        .await;
        if let Err(err) = injected {
            restore(runtime, snapshot).await;
            return Err(err);
        }
    }
    debug!(keys = snapshot.len(), "namespace overrides injected");
    Ok(snapshot)
}

/// Drop globals bound during the execution, then put back every displaced
/// binding. Failures are logged per key and do not stop the remaining keys
/// from being restored.
pub async fn restore<R: Runtime>(runtime: &mut R, snapshot: Snapshot<R::Binding>) {
    match runtime.global_names().await {
        Ok(names) => {
            let added: Vec<String> = names
                .into_iter()
                .filter(|name| !snapshot.baseline.contains(name))
                .filter(|name| !snapshot.saved.iter().any(|saved| &saved.key == name))
                .collect();
            if !added.is_empty() {
                debug!(keys = added.len(), "discarding globals bound under overrides");
            }
            for name in added {
                if let Err(err) = runtime.delete_global(&name).await {
                    warn!(key = %name, error = %err, "failed to discard namespace binding");
                }
            }
        }
        Err(err) => warn!(error = %err, "failed to list globals after override run"),
    }
    for Saved { key, prior } in snapshot.saved.into_iter().rev() {
        let outcome = match prior {
            Some(binding) => runtime.restore_global(&key, binding).await,
            None => runtime.delete_global(&key).await,
        };
        if let Err(err) = outcome {
            warn!(%key, error = %err, "failed to restore namespace binding");
        }
    }
}

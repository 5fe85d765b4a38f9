//! Content-addressed memoization of expensive remote lookups.
//!
//! Results are addressed by a SHA-256 digest of the call: module path,
//! function name, positional arguments (led by the receiver's type name for
//! calls bound to an object) and keyword-argument values in key order. Each
//! part is hashed as its display string with no separator, so a given call
//! always maps to the same key regardless of the order keyword arguments
//! were supplied in. Entries never expire: the inputs are historical facts.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;

use eyre::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::store::KvStore;

/// Canonical description of one call, reduced to a digest.
#[derive(Debug, Clone)]
pub struct CallKey {
    module: String,
    function: String,
    args: Vec<String>,
    kwargs: BTreeMap<String, String>,
}

impl CallKey {
    /// Starts a key for `module::function`.
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Marks the call as bound to an instance of `type_name`.
    ///
    /// The receiver stands in as the first positional argument.
    pub fn receiver(mut self, type_name: &str) -> Self {
        self.args.insert(0, type_name.to_string());
        self
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: impl Display) -> Self {
        self.args.push(value.to_string());
        self
    }

    /// Sets a keyword argument.
    pub fn kwarg(mut self, name: &str, value: impl Display) -> Self {
        self.kwargs.insert(name.to_string(), value.to_string());
        self
    }

    /// Qualified function name, for logging.
    pub fn function(&self) -> String {
        format!("{}::{}", self.module, self.function)
    }

    /// Lowercase hex SHA-256 digest of the call.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.module.as_bytes());
        hasher.update(self.function.as_bytes());
        for arg in &self.args {
            hasher.update(arg.as_bytes());
        }
        for value in self.kwargs.values() {
            hasher.update(value.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Memoizing front for a [`KvStore`].
#[derive(Debug)]
pub struct Memo<S> {
    store: S,
}

impl<S: KvStore> Memo<S> {
    /// Wraps `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the memoized result for `key`, running `compute` on a miss.
    ///
    /// Only successful results are stored. A stored value that does not
    /// decode into `T` is recomputed and overwritten.
    ///
    /// # Errors
    /// Propagates store failures and errors from `compute`.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &CallKey, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let digest = key.digest();
        if let Some(stored) = self.store.get(&digest)? {
            match serde_json::from_str::<T>(&stored) {
                Ok(value) => {
                    debug!(function = %key.function(), key = %digest, "result cached from disk");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        function = %key.function(),
                        key = %digest,
                        error = %e,
                        "stored value no longer decodes, recomputing"
                    );
                }
            }
        }

        let value = compute().await?;
        let encoded = serde_json::to_string(&value)
            .wrap_err_with(|| format!("failed to encode result of {}", key.function()))?;
        self.store.put(&digest, &encoded)?;
        Ok(value)
    }
}

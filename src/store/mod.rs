//! Coordination store boundary.
//!
//! A store executes registered procedures atomically: each invocation runs
//! serialized against every other invocation touching the same keys, and
//! either completes in full or has no effect. Procedures are registered once
//! and then addressed by a content-derived [`ProcedureHandle`].

pub mod keys;
mod memory;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

pub use memory::MemoryStore;

/// Reply produced by a procedure body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Int(i64),
    Text(String),
    List(Vec<Reply>),
}

impl Reply {
    pub fn into_list(self) -> Result<Vec<Reply>, StoreError> {
        match self {
            Reply::List(items) => Ok(items),
            other => Err(StoreError::Protocol(format!("expected list, got {other:?}"))),
        }
    }

    pub fn into_text(self) -> Result<String, StoreError> {
        match self {
            Reply::Text(s) => Ok(s),
            other => Err(StoreError::Protocol(format!("expected text, got {other:?}"))),
        }
    }

    pub fn into_int(self) -> Result<i64, StoreError> {
        match self {
            Reply::Int(n) => Ok(n),
            other => Err(StoreError::Protocol(format!("expected integer, got {other:?}"))),
        }
    }

    /// `Nil` maps to `None`.
    pub fn into_opt_int(self) -> Result<Option<i64>, StoreError> {
        match self {
            Reply::Nil => Ok(None),
            other => other.into_int().map(Some),
        }
    }
}

/// Content hash of a registered procedure's source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcedureHandle(String);

impl ProcedureHandle {
    pub fn of(source_text: &str) -> Self {
        Self(hex::encode(Sha256::digest(source_text.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcedureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form, like abbreviated commit hashes.
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

/// Accepted number of keys or arguments for a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    min: usize,
    max: Option<usize>,
}

impl Arity {
    pub const fn exactly(n: usize) -> Self {
        Self { min: n, max: Some(n) }
    }

    pub const fn between(min: usize, max: usize) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    pub const fn at_least(min: usize) -> Self {
        Self { min, max: None }
    }

    pub fn admits(&self, n: usize) -> bool {
        n >= self.min && self.max.is_none_or(|max| n <= max)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "{max}"),
            Some(max) => write!(f, "{}..={max}", self.min),
            None => write!(f, "{}+", self.min),
        }
    }
}

/// Program run by the store under its atomicity guarantee.
pub type ProcedureFn = fn(&mut dyn Keyspace, &[String], &[String]) -> Result<Reply, StoreError>;

/// Static definition of an atomic procedure.
#[derive(Clone, Copy)]
pub struct ProcedureSource {
    pub name: &'static str,
    /// Bumped whenever `body` changes behavior, so the handle changes too.
    pub version: u32,
    pub keys: Arity,
    pub args: Arity,
    pub body: ProcedureFn,
}

impl fmt::Debug for ProcedureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureSource")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("keys", &self.keys)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl ProcedureSource {
    /// Canonical text the handle is derived from.
    pub fn source_text(&self) -> String {
        format!(
            "{}@v{} keys={} args={}",
            self.name, self.version, self.keys, self.args
        )
    }

    pub fn handle(&self) -> ProcedureHandle {
        ProcedureHandle::of(&self.source_text())
    }
}

/// Data-structure operations available to procedure bodies.
pub trait Keyspace {
    fn hash_exists(&self, key: &str) -> bool;
    fn hash_get(&self, key: &str, field: &str) -> Option<String>;
    fn hash_get_all(&self, key: &str) -> HashMap<String, String>;
    fn hash_set(&mut self, key: &str, field: &str, value: String);

    /// 0-based position of `member` in the list, front first.
    fn list_position(&self, key: &str, member: &str) -> Option<usize>;
    fn list_remove(&mut self, key: &str, member: &str) -> bool;
    fn list_push(&mut self, key: &str, member: String);
    fn list_len(&self, key: &str) -> usize;

    fn put_expiring(&mut self, key: &str, value: String, expires_at: DateTime<Utc>);
    /// Reads a value, reclaiming it if it expired at or before `now`.
    fn get_live(&mut self, key: &str, now: DateTime<Utc>) -> Option<String>;

    fn index_add(&mut self, key: &str, score: i64, member: String);
    /// Members ordered by score, highest first.
    fn index_desc(&self, key: &str) -> Vec<String>;
    fn index_remove(&mut self, key: &str, member: &str);
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Register a procedure and return the handle to invoke it by.
    async fn register(&self, source: &ProcedureSource) -> Result<ProcedureHandle, StoreError>;

    /// Run a registered procedure atomically.
    ///
    /// Fails with [`StoreError::ProcedureMissing`] if the handle is unknown.
    async fn invoke(
        &self,
        handle: &ProcedureHandle,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply, StoreError>;
}

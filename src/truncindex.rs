//! Lookup of full ids by unique prefix.
//!
//! Used to let users type `sha256:3f2a` or a short snapshot id instead of
//! the whole thing. Ids are kept sorted so a prefix lookup is a range scan
//! that stops after the second match.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::RwLock;

/// Thread-safe index of ids searchable by prefix.
#[derive(Debug, Default)]
pub struct TruncIndex {
    ids: RwLock<BTreeSet<String>>,
}

impl TruncIndex {
    /// Builds an index from `ids`, skipping any that are invalid or
    /// duplicated.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let index = Self::default();
        for id in ids {
            // Invalid ids simply never become resolvable.
            let _ = index.add(id.into());
        }
        index
    }

    /// Adds `id`.
    pub fn add(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        validate(&id)?;
        let mut ids = self.ids.write().map_err(poisoned)?;
        if !ids.insert(id.clone()) {
            return Err(Error::IdAlreadyExists(id));
        }
        Ok(())
    }

    /// Removes `id`. The full id is required.
    pub fn delete(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::EmptyPrefix);
        }
        let mut ids = self.ids.write().map_err(poisoned)?;
        if !ids.remove(id) {
            return Err(Error::IdNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Returns the single id starting with `prefix`.
    pub fn get(&self, prefix: &str) -> Result<String> {
        if prefix.is_empty() {
            return Err(Error::EmptyPrefix);
        }
        let ids = self.ids.read().map_err(poisoned)?;
        let mut matches = ids
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|id| id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.clone()),
            (Some(_), Some(_)) => Err(Error::AmbiguousPrefix(prefix.to_string())),
            (None, _) => Err(Error::IdNotFound(prefix.to_string())),
        }
    }

    /// Calls `f` for every id in sorted order.
    pub fn iterate(&self, mut f: impl FnMut(&str)) {
        if let Ok(ids) = self.ids.read() {
            ids.iter().for_each(|id| f(id));
        }
    }

    /// Number of ids.
    pub fn len(&self) -> usize {
        self.ids.read().map(|ids| ids.len()).unwrap_or(0)
    }

    /// True if the index holds no ids.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::EmptyPrefix);
    }
    if id.contains(' ') {
        return Err(Error::IllegalIdChar(' '));
    }
    Ok(())
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Internal("truncindex lock poisoned".to_string())
}

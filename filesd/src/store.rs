use std::{convert::Infallible, fmt, path::PathBuf, str::FromStr};

use crate::{Error, Result};

/// Durable key/value persistence for registry records.
///
/// Only the registry worker talks to the store, so implementations need no
/// internal coordination beyond being movable onto that thread.
pub trait EntryStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Returns every record, ordered by key.
    fn scan_all(&self) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Where the entry store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Nothing survives the process.
    Memory,
    Path(PathBuf),
}

impl StoreLocation {
    pub const MEMORY: &'static str = ":memory:";
}

impl FromStr for StoreLocation {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            Self::MEMORY => Self::Memory,
            path => Self::Path(path.into()),
        })
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str(Self::MEMORY),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// [`EntryStore`] backed by an embedded `sled` database.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(location: &StoreLocation) -> Result<Self> {
        let db = match location {
            StoreLocation::Memory => sled::Config::new().temporary(true).open()?,
            StoreLocation::Path(path) => sled::open(path)?,
        };
        tracing::debug!(%location, recovered = db.was_recovered(), "opened entry store");
        Ok(Self { db })
    }
}

impl EntryStore for SledStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.insert(key, value)?;
        self.db.flush()?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key)?;
        self.db.flush()?;
        Ok(())
    }

    fn scan_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.db
            .iter()
            .map(|item| -> Result<(String, Vec<u8>)> {
                let (key, value) = item?;
                let key = String::from_utf8(key.to_vec()).map_err(|e| Error::CorruptRecord {
                    key: String::from_utf8_lossy(e.as_bytes()).into_owned(),
                    reason: e.to_string(),
                })?;
                Ok((key, value.to_vec()))
            })
            .collect()
    }
}

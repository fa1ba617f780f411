//! Last-disconnect intent per device, kept across restarts.
//!
//! The engine writes the intent of every disconnect and reads it back when a
//! device is registered, so a device that dropped on its own before a restart
//! can be reconnected automatically afterwards.

use std::{
   borrow::Cow,
   collections::HashMap,
   path::{Path, PathBuf},
   sync::Arc,
   time::SystemTime,
};

use heed::{Database, Env, EnvOpenOptions, types::SerdeBincode};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{address::Address, state::Intent};

/// Errors that can occur in persistence operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to create database directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRecord {
   pub intent: Intent,
   /// Unix timestamp.
   pub at: u64,
}

/// Storage for the last disconnect of each device.
pub trait DisconnectStore: Send + Sync {
   fn save(&self, address: Address, intent: Intent) -> Result<()>;
   fn load(&self, address: Address) -> Result<Option<DisconnectRecord>>;
   fn clear(&self, address: Address) -> Result<()>;
}

fn unix_now() -> u64 {
   SystemTime::UNIX_EPOCH
      .elapsed()
      .map_or(0, |d| d.as_secs())
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
   records: Mutex<HashMap<Address, DisconnectRecord>>,
}

impl DisconnectStore for MemoryStore {
   fn save(&self, address: Address, intent: Intent) -> Result<()> {
      self.records.lock().insert(
         address,
         DisconnectRecord {
            intent,
            at: unix_now(),
         },
      );
      Ok(())
   }

   fn load(&self, address: Address) -> Result<Option<DisconnectRecord>> {
      Ok(self.records.lock().get(&address).copied())
   }

   fn clear(&self, address: Address) -> Result<()> {
      self.records.lock().remove(&address);
      Ok(())
   }
}

struct KeyCodec;

impl<'a> heed::BytesEncode<'a> for KeyCodec {
   type EItem = Address;
   fn bytes_encode(item: &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, heed::BoxedError> {
      Ok(Cow::Borrowed(&item.0))
   }
}

impl<'a> heed::BytesDecode<'a> for KeyCodec {
   type DItem = Address;
   fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, heed::BoxedError> {
      let Ok(s) = bytes.try_into() else {
         return Err(heed::BoxedError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Invalid address",
         )));
      };
      Ok(Address(s))
   }
}

#[derive(Debug)]
struct Db {
   env: Env,
   /// MAC address -> last disconnect
   disconnects: Database<KeyCodec, SerdeBincode<DisconnectRecord>>,
}

/// LMDB-backed store.
#[derive(Clone, Debug)]
pub struct HeedStore {
   db: Arc<Db>,
}

impl HeedStore {
   /// Opens the store at `$GATTKEEPER_DB_PATH`, or under the local data directory.
   pub fn open() -> Result<Self> {
      Self::open_at(&Self::db_path()?)
   }

   pub fn open_at(path: &Path) -> Result<Self> {
      std::fs::create_dir_all(path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(1024 * 1024)
            .max_dbs(1)
            .open(path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;
      let disconnects = env
         .create_database(&mut wtxn, Some("disconnects"))
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      debug!("opened disconnect store at {}", path.display());
      Ok(Self {
         db: Arc::new(Db { env, disconnects }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("GATTKEEPER_DB_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/gattkeeper/disconnects.db
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("gattkeeper").join("disconnects.db"))
   }
}

impl DisconnectStore for HeedStore {
   fn save(&self, address: Address, intent: Intent) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      self
         .db
         .disconnects
         .put(
            &mut wtxn,
            &address,
            &DisconnectRecord {
               intent,
               at: unix_now(),
            },
         )
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(())
   }

   fn load(&self, address: Address) -> Result<Option<DisconnectRecord>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      self
         .db
         .disconnects
         .get(&rtxn, &address)
         .map_err(Error::DatabaseOperation)
   }

   fn clear(&self, address: Address) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      self
         .db
         .disconnects
         .delete(&mut wtxn, &address)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;

   const TEST_ADDRESS: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   #[test]
   fn test_heed_store_survives_reopen() -> Result<()> {
      let dir = TempDir::new()?;
      let path = dir.path().join("disconnects.db");
      {
         let store = HeedStore::open_at(&path)?;
         assert_eq!(store.load(TEST_ADDRESS)?, None);
         store.save(TEST_ADDRESS, Intent::Unintentional)?;
      }

      let store = HeedStore::open_at(&path)?;
      let record = store.load(TEST_ADDRESS)?.unwrap();
      assert_eq!(record.intent, Intent::Unintentional);

      store.save(TEST_ADDRESS, Intent::Intentional)?;
      assert_eq!(store.load(TEST_ADDRESS)?.unwrap().intent, Intent::Intentional);
      store.clear(TEST_ADDRESS)?;
      assert_eq!(store.load(TEST_ADDRESS)?, None);
      Ok(())
   }

   #[test]
   fn test_memory_store() -> Result<()> {
      let store = MemoryStore::default();
      store.save(TEST_ADDRESS, Intent::Intentional)?;
      assert_eq!(store.load(TEST_ADDRESS)?.unwrap().intent, Intent::Intentional);
      store.clear(TEST_ADDRESS)?;
      assert!(store.load(TEST_ADDRESS)?.is_none());
      Ok(())
   }
}

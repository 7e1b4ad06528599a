//! Incremental message digests
//!
//! A hash handle accumulates data across calls. `hash_data_async` feeds a
//! large buffer on a worker and marks the hash busy until its completion is
//! decoded; every other operation on a busy hash fails with `EBUSY`.

use crate::error::{ErrorPair, OsResult};
use crate::handle_table::Handle;
use crate::runtime::completion::Delivery;
use crate::runtime::overlapped::{IoCallback, IoResult};
use crate::runtime::work::WorkItem;
use crate::runtime::Runtime;
use parking_lot::Mutex;
use sha2::digest::DynDigest;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes.
    pub fn output_size(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    fn digest(self) -> Box<dyn DynDigest + Send> {
        match self {
            HashAlgorithm::Sha1 => Box::new(sha1::Sha1::default()),
            HashAlgorithm::Sha256 => Box::new(sha2::Sha256::default()),
            HashAlgorithm::Sha384 => Box::new(sha2::Sha384::default()),
            HashAlgorithm::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = ErrorPair;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(ErrorPair::bad_arguments("open_hash")),
        }
    }
}

/// Table record of an open hash.
pub struct HashEntry {
    algorithm: HashAlgorithm,
    busy: AtomicBool,
    digest: Mutex<Box<dyn DynDigest + Send>>,
}

impl HashEntry {
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Exclusive claim on a hash; released on drop.
struct BusyGuard(Arc<HashEntry>);

impl BusyGuard {
    fn claim(entry: Arc<HashEntry>, origin: &'static str) -> OsResult<Self> {
        entry
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ErrorPair::busy(origin))?;
        Ok(Self(entry))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

struct HashWork {
    guard: BusyGuard,
    data: Vec<u8>,
    callback: IoCallback,
}

impl WorkItem for HashWork {
    fn work(&mut self) -> u32 {
        self.guard.0.digest.lock().update(&self.data);
        0
    }

    fn decode(self: Box<Self>, _rt: &Runtime, status: u32) -> Delivery {
        let HashWork {
            guard,
            data,
            callback,
        } = *self;
        drop(guard);
        let count = data.len() as u32;
        Delivery::new(move || callback(IoResult { count, error: status }))
    }
}

impl Runtime {
    fn hash_entry(&self, hash: Handle, origin: &'static str) -> OsResult<Arc<HashEntry>> {
        self.hashes.lookup(hash).ok_or(ErrorPair::invalid_handle(origin))
    }

    pub fn open_hash(&self, algorithm: HashAlgorithm) -> OsResult<Handle> {
        let handle = self.hashes.allocate(Arc::new(HashEntry {
            algorithm,
            busy: AtomicBool::new(false),
            digest: Mutex::new(algorithm.digest()),
        }));
        log::debug!("opened {} hash {}", algorithm.name(), handle);
        Ok(handle)
    }

    /// Feed `data` into the hash on the calling thread.
    pub fn hash_data(&self, hash: Handle, data: &[u8]) -> OsResult<()> {
        let guard = BusyGuard::claim(self.hash_entry(hash, "hash_data")?, "hash_data")?;
        guard.0.digest.lock().update(data);
        Ok(())
    }

    /// Feed `data` into the hash on a worker. The hash stays busy until the
    /// completion is decoded; `callback` receives the byte count.
    pub fn hash_data_async(&self, hash: Handle, data: Vec<u8>, callback: IoCallback) -> OsResult<()> {
        const ORIGIN: &str = "hash_data_async";
        let guard = BusyGuard::claim(self.hash_entry(hash, ORIGIN)?, ORIGIN)?;
        self.schedule_work(Box::new(HashWork {
            guard,
            data,
            callback,
        }))
    }

    /// Digest of everything fed so far. The hash can keep accumulating.
    pub fn hash_value(&self, hash: Handle) -> OsResult<Vec<u8>> {
        let guard = BusyGuard::claim(self.hash_entry(hash, "hash_value")?, "hash_value")?;
        let snapshot = guard.0.digest.lock().box_clone();
        Ok(snapshot.finalize().into_vec())
    }

    pub fn close_hash(&self, hash: Handle) -> OsResult<()> {
        const ORIGIN: &str = "close_hash";
        let removed = self.hashes.remove_if(hash, |entry| !entry.is_busy());
        match removed {
            Some(entry) => {
                log::debug!("closed {} hash {}", entry.algorithm.name(), hash);
                Ok(())
            }
            None if self.hashes.contains(hash) => Err(ErrorPair::busy(ORIGIN)),
            None => Err(ErrorPair::invalid_handle(ORIGIN)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn test_incremental_sha256() {
        let rt = Runtime::new();
        let hash = rt.open_hash(HashAlgorithm::Sha256).unwrap();
        rt.hash_data(hash, b"a").unwrap();
        rt.hash_data(hash, b"bc").unwrap();
        assert_eq!(
            hex(&rt.hash_value(hash).unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        rt.close_hash(hash).unwrap();
        assert_eq!(rt.hash_data(hash, b"x").unwrap_err().code, code::INVALID_HANDLE);
    }

    #[test]
    fn test_sha1_value_is_repeatable() {
        let rt = Runtime::new();
        let hash = rt.open_hash(HashAlgorithm::Sha1).unwrap();
        rt.hash_data(hash, b"abc").unwrap();
        let first = rt.hash_value(hash).unwrap();
        assert_eq!(first, rt.hash_value(hash).unwrap());
        assert_eq!(hex(&first), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_output_sizes() {
        let rt = Runtime::new();
        for algorithm in [
            HashAlgorithm::Sha1,
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha384,
            HashAlgorithm::Sha512,
        ] {
            let hash = rt.open_hash(algorithm).unwrap();
            assert_eq!(rt.hash_value(hash).unwrap().len(), algorithm.output_size());
        }
    }

    #[test]
    fn test_busy_hash_rejects_operations() {
        let rt = Runtime::new();
        let hash = rt.open_hash(HashAlgorithm::Sha512).unwrap();
        let entry = rt.hashes.lookup(hash).unwrap();
        let guard = BusyGuard::claim(entry, "test").unwrap();
        assert_eq!(rt.hash_data(hash, b"x").unwrap_err(), ErrorPair::busy("hash_data"));
        assert_eq!(rt.close_hash(hash).unwrap_err(), ErrorPair::busy("close_hash"));
        drop(guard);
        rt.close_hash(hash).unwrap();
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("SHA384".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha384);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }
}

//! Offload store implementations: a memory-backed store for tests and small
//! deployments, and a file-backed store that spools one encoded bundle per
//! storage id under a directory.

use bp7_core::cache::OffloadStore;
use bp7_core::codec::bundle;
use bp7_core::error::{BpError, BpResult};
use bp7_core::{BlockId, Pool};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Holds encoded bundles in a map. Storage ids start at 1.
#[derive(Debug, Default)]
pub struct MemoryOffload {
    next_sid: u64,
    stored: HashMap<u64, Vec<u8>>,
}

impl MemoryOffload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored_count(&self) -> usize {
        self.stored.len()
    }
}

impl OffloadStore for MemoryOffload {
    fn offload(&mut self, pool: &mut Pool, sid: &mut u64, pri: BlockId) -> BpResult<()> {
        let mut wire = Vec::new();
        bundle::encode_bundle(pool, pri, &mut wire)?;
        self.next_sid += 1;
        self.stored.insert(self.next_sid, wire);
        *sid = self.next_sid;
        debug!(sid = *sid, "bundle offloaded to memory store");
        Ok(())
    }

    fn restore(&mut self, pool: &mut Pool, sid: u64) -> BpResult<BlockId> {
        let wire = self.stored.get(&sid).ok_or(BpError::NullPointer)?.clone();
        bundle::decode_bundle(pool, &wire)
    }

    fn release(&mut self, _pool: &mut Pool, sid: u64) -> BpResult<()> {
        self.stored.remove(&sid);
        Ok(())
    }
}

/// Spools encoded bundles under `dir`, one `<sid>.bundle` file each.
#[derive(Debug)]
pub struct FileOffload {
    dir: PathBuf,
    next_sid: u64,
}

impl FileOffload {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&dir)?;
        // resume past the highest spooled id
        let mut next_sid = 0;
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            if let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".bundle")) {
                if let Ok(sid) = stem.parse::<u64>() {
                    next_sid = next_sid.max(sid);
                }
            }
        }
        Ok(Self { dir, next_sid })
    }

    fn path_for(&self, sid: u64) -> PathBuf {
        self.dir.join(format!("{sid}.bundle"))
    }
}

impl OffloadStore for FileOffload {
    fn offload(&mut self, pool: &mut Pool, sid: &mut u64, pri: BlockId) -> BpResult<()> {
        let mut wire = Vec::new();
        bundle::encode_bundle(pool, pri, &mut wire)?;
        self.next_sid += 1;
        let path = self.path_for(self.next_sid);
        if let Err(err) = fs::write(&path, &wire) {
            warn!(?err, ?path, "bundle spool write failed");
            return Err(BpError::OutOfMemory);
        }
        *sid = self.next_sid;
        debug!(sid = *sid, "bundle spooled to disk");
        Ok(())
    }

    fn restore(&mut self, pool: &mut Pool, sid: u64) -> BpResult<BlockId> {
        let wire = fs::read(self.path_for(sid)).map_err(|_| BpError::NullPointer)?;
        bundle::decode_bundle(pool, &wire)
    }

    fn release(&mut self, _pool: &mut Pool, sid: u64) -> BpResult<()> {
        let _ = fs::remove_file(self.path_for(sid));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bp7_core::codec::canonical;
    use bp7_core::codec::crc::CrcType;
    use bp7_core::codec::types::{
        BlockType, CanonicalBlock, CanonicalPayload, EndpointId, PrimaryBlock,
    };
    use bp7_core::PoolConfig;

    fn make_bundle(pool: &mut Pool) -> BlockId {
        let mut pri = PrimaryBlock::new();
        pri.crc_type = CrcType::Crc16X25;
        pri.destination = EndpointId::ipn(200, 1);
        pri.source = EndpointId::ipn(100, 1);
        pri.report_to = EndpointId::DtnNone;
        pri.lifetime_ms = 60_000;
        let pri_id = pool.alloc_primary(pri).unwrap();
        let mut pay = CanonicalBlock::new(BlockType::Payload, 1, CanonicalPayload::Opaque);
        pay.crc_type = CrcType::Crc16X25;
        canonical::encode_payload(&mut pay, b"spooled payload").unwrap();
        let pay_id = pool.alloc_canonical(pay).unwrap();
        pool.primary_mut(pri_id).unwrap().canonicals.push(pay_id);
        pri_id
    }

    #[test]
    fn memory_offload_round_trip() {
        let mut pool = Pool::with_block_count(64, PoolConfig::default()).unwrap();
        let pri = make_bundle(&mut pool);
        let mut store = MemoryOffload::new();
        let mut sid = 0;
        store.offload(&mut pool, &mut sid, pri).unwrap();
        assert_eq!(sid, 1);

        let restored = store.restore(&mut pool, sid).unwrap();
        let chain = pool.primary(restored).unwrap().canonicals.clone();
        assert_eq!(chain.len(), 1);
        assert_eq!(
            pool.canonical(chain[0]).unwrap().content_bytes(),
            b"spooled payload"
        );

        store.release(&mut pool, sid).unwrap();
        assert!(store.restore(&mut pool, sid).is_err());
    }

    #[test]
    fn file_offload_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = Pool::with_block_count(64, PoolConfig::default()).unwrap();
        let pri = make_bundle(&mut pool);
        let mut sid = 0;
        {
            let mut store = FileOffload::new(dir.path().to_path_buf()).unwrap();
            store.offload(&mut pool, &mut sid, pri).unwrap();
        }
        let mut reopened = FileOffload::new(dir.path().to_path_buf()).unwrap();
        let restored = reopened.restore(&mut pool, sid).unwrap();
        assert!(pool.primary(restored).is_some());
        reopened.release(&mut pool, sid).unwrap();
        assert!(reopened.restore(&mut pool, sid).is_err());
    }
}

//! Mock implementations of external collaborators for use in tests.

use crate::{
    serializer::{BlockId, Serializer, Token},
    Error,
};
use commonware_runtime::Clock;
use parking_lot::Mutex;
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

/// An in-memory [Serializer].
///
/// Every read suspends for a configurable latency (virtual time under the
/// deterministic runtime), so tests can interleave work with loads in flight.
pub struct Memory<E: Clock> {
    context: E,
    block_size: usize,
    latency: Duration,
    state: Arc<Mutex<State>>,
}

struct State {
    blocks: HashMap<BlockId, Vec<u8>>,
    fail_reads: bool,
    reads: u64,
}

impl<E: Clock> Memory<E> {
    pub fn new(context: E, block_size: usize, latency: Duration) -> Self {
        Self {
            context,
            block_size,
            latency,
            state: Arc::new(Mutex::new(State {
                blocks: HashMap::new(),
                fail_reads: false,
                reads: 0,
            })),
        }
    }

    /// Install a durable image for `block_id`, returning its token.
    pub fn put(&self, block_id: BlockId, data: Vec<u8>) -> Token {
        assert!(data.len() <= self.block_size, "image exceeds block size");
        let size = data.len() as u32;
        self.state.lock().blocks.insert(block_id, data);
        Token::new(block_id, size)
    }

    /// Make every subsequent [Serializer::block_read] fail.
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Number of block reads served so far.
    pub fn reads(&self) -> u64 {
        self.state.lock().reads
    }
}

impl<E: Clock> Clone for Memory<E> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            block_size: self.block_size,
            latency: self.latency,
            state: self.state.clone(),
        }
    }
}

impl<E: Clock> Serializer for Memory<E> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn malloc(&self) -> Vec<u8> {
        vec![0; self.block_size]
    }

    fn index_read(&self, block_id: BlockId) -> impl Future<Output = Result<Token, Error>> + Send {
        let this = self.clone();
        async move {
            this.context.sleep(this.latency).await;
            let state = this.state.lock();
            let data = state
                .blocks
                .get(&block_id)
                .ok_or(Error::MissingBlock(block_id))?;
            Ok(Token::new(block_id, data.len() as u32))
        }
    }

    fn block_read(
        &self,
        token: Token,
        mut buf: Vec<u8>,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send {
        let this = self.clone();
        async move {
            this.context.sleep(this.latency).await;
            let mut state = this.state.lock();
            if state.fail_reads {
                return Err(Error::ReadFailed(token.block_id()));
            }
            let data = state
                .blocks
                .get(&token.block_id())
                .ok_or(Error::MissingBlock(token.block_id()))?;
            assert_eq!(data.len(), token.size() as usize, "stale token");
            buf[..data.len()].copy_from_slice(data);
            state.reads += 1;
            Ok(buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};

    const BLOCK_SIZE: usize = 64;

    #[test_traced]
    fn test_memory_round_trip() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let serializer = Memory::new(context, BLOCK_SIZE, Duration::from_millis(1));
            let image = vec![0x5A; BLOCK_SIZE];
            serializer.put(BlockId(3), image.clone());

            let token = serializer.index_read(BlockId(3)).await.unwrap();
            assert_eq!(token.size(), BLOCK_SIZE as u32);

            let buf = serializer
                .block_read(token, serializer.malloc())
                .await
                .unwrap();
            assert_eq!(buf, image);
            assert_eq!(serializer.reads(), 1);
        });
    }

    #[test_traced]
    fn test_memory_missing_block() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let serializer = Memory::new(context, BLOCK_SIZE, Duration::from_millis(1));
            let err = serializer.index_read(BlockId(9)).await.unwrap_err();
            assert!(matches!(err, Error::MissingBlock(BlockId(9))));
        });
    }

    #[test_traced]
    fn test_memory_failed_reads() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let serializer = Memory::new(context, BLOCK_SIZE, Duration::from_millis(1));
            let token = serializer.put(BlockId(1), vec![1; 8]);

            serializer.fail_reads(true);
            let err = serializer
                .block_read(token.clone(), serializer.malloc())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::ReadFailed(BlockId(1))));

            serializer.fail_reads(false);
            let buf = serializer
                .block_read(token, serializer.malloc())
                .await
                .unwrap();
            assert_eq!(&buf[..8], &[1; 8]);
        });
    }
}

//! Interface to the block serializer that owns the durable image of every
//! block.
//!
//! The page layer never touches disk itself: it allocates block-sized buffers
//! from the serializer, resolves block ids to [Token]s through it, and reads
//! block bytes through it. Everything else (write layout, garbage collection,
//! durability) is the serializer's business.

use crate::Error;
use std::{fmt, future::Future, sync::Arc};

/// Identifies a block in the serializer's index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A refcounted handle asserting that a block id currently maps to a
/// particular durable image.
///
/// Holding a clone of a [Token] keeps that assertion alive: a page whose
/// buffer was dropped can always be rehydrated through its token. Tokens are
/// issued by the [Serializer] and are cheap to clone.
#[derive(Clone, Debug)]
pub struct Token {
    state: Arc<TokenState>,
}

#[derive(Debug)]
struct TokenState {
    block_id: BlockId,
    size: u32,
}

impl Token {
    /// Issue a token for `block_id` whose serialized image is `size` bytes.
    pub fn new(block_id: BlockId, size: u32) -> Self {
        Self {
            state: Arc::new(TokenState { block_id, size }),
        }
    }

    /// The block this token describes.
    pub fn block_id(&self) -> BlockId {
        self.state.block_id
    }

    /// The serialized size of the block, in bytes.
    pub fn size(&self) -> u32 {
        self.state.size
    }
}

/// The block serializer consumed by the page layer.
///
/// `index_read` and `block_read` run on the serializer's home context;
/// awaiting them is the migration fence. Buffers handed to
/// [Serializer::block_read] are allocated by the caller via
/// [Serializer::malloc] and freed by the caller once the read returns, so
/// allocation and free stay colocated on the caller's context.
pub trait Serializer: Clone + Send + Sync + 'static {
    /// The serializer's native block size. Every buffer returned by
    /// [Serializer::malloc] has exactly this length.
    fn block_size(&self) -> usize;

    /// Allocate a block-sized buffer.
    fn malloc(&self) -> Vec<u8>;

    /// Resolve `block_id` to the token describing its current durable image.
    fn index_read(&self, block_id: BlockId) -> impl Future<Output = Result<Token, Error>> + Send;

    /// Fill `buf` with the bytes of the block `token` describes, returning
    /// the buffer. May suspend.
    fn block_read(
        &self,
        token: Token,
        buf: Vec<u8>,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;
}

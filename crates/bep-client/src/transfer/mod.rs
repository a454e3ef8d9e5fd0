//! Block transfer.
//!
//! Downloads request blocks by hash and verify every response; uploads
//! announce an index update and serve the blocks the peer asks for.

mod puller;
mod pusher;

pub use puller::{BlockPuller, BlockStream, FileDownloadObserver, MAX_PENDING_REQUESTS};
pub use pusher::{BlockPusher, FileUploadObserver, IndexEditObserver};

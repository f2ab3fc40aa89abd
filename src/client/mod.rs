//! Clients used by UI surfaces.

pub mod stream;
pub mod transport;
pub mod upload;

pub use stream::{ChunkStream, StreamAbortHandle, StreamClient, StreamDescriptor};
pub use transport::{RequestDescriptor, TransportClient};
pub use upload::{UploadClient, UploadDescriptor};

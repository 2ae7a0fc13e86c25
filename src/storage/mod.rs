//! Storage module
//!
//! Piece scheduling, block reassembly and download management.

pub mod download;
pub mod piece;
pub mod queue;

// Re-export piece types
pub use piece::{AssembledOutput, BlockOutcome, IgnoredMessage, PieceBuffer, PieceTask};

// Re-export scheduling types
pub use queue::{PieceStatus, WorkQueue};

// Re-export download types
pub use download::{DownloadManager, DownloadStats};

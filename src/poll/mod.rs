//! Poll set bookkeeping
//!
//! - [`PollTable`]: the dense `pollfd` array scanned on every loop iteration
//! - [`FdRouter`]: which session owns a readable audio descriptor

pub mod router;
pub mod table;

pub use router::FdRouter;
pub use table::{PollEvents, PollTable};

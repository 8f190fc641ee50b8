//! Access layer on top of the buffer pool.
//!
//! - **PageDirectory**: a heap file that tracks free space per data page
//!   through a chain of header pages
//! - **BacktrackingIterator**: iteration with mark/reset, used for re-scans
//!   of a directory's pages

pub mod iterator;
pub mod page_directory;

pub use iterator::{BacktrackingIterator, VecBacktrackingIterator};
pub use page_directory::{DataPageIter, PageDirectory};

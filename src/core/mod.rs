// Core modules implementing allocation, compression, the ring, and error modeling.
pub mod allocate;
pub mod codec;
pub mod error;
pub mod ring;

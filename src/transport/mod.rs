pub mod cipher;
pub mod compact;
pub mod constants;
pub mod frames;
pub mod measurement;
pub mod signal_index_cache;
pub mod subscription;
pub mod tssc;

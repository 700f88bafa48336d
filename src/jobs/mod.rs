pub mod cache_sweep;
pub mod flusher;

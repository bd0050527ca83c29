pub mod atomic_write;
pub mod hash;
pub mod log_file;
pub mod sos;

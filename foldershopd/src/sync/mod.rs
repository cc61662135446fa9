pub mod activity;
pub mod engine;
pub mod lease;
pub mod materializer;
pub mod naming;
pub mod owner;
pub mod postprocess;
pub mod preview;
pub mod reconciler;
pub mod registry;
pub mod source;
mod source_ftp;
mod source_local;
mod source_sftp;
pub mod staging;

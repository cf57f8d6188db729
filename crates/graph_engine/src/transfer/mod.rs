//! Data-transfer engine and staging-area scheduler

mod engine;
mod scheduler;
mod tasks;

pub use engine::TransferEngine;
pub use scheduler::{DataTransferScheduler, DATA_TRANSFER_FINISH_SEMAPHORE};
pub use tasks::{DownloadTask, StartToken, Storage, UploadTask};

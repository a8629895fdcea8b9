//! Object storage: the stage/output store handle and the bounded upload
//! worker pool that drains completed part files.

pub mod device_manager;
pub mod store;

pub use device_manager::{S3DeviceManager, S3UploadTask};
pub use store::{StoreHandle, fetch_object, list_file_keys, put_local_file};

//! Object-store backend adapters and the factory that selects between them.

mod factory;
mod oss;
mod s3;
mod traits;

pub use factory::{ClientFactory, ClientPair};
pub use oss::OssClient;
pub use s3::{content_md5_base64, S3Client};
pub use traits::{
    DownloadCapability, ListingPage, ObjectBody, PartSummary, PartsPage, StorageError,
    UploadCapability, UploadSummary, UploadsPage,
};

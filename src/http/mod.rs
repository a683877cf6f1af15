pub mod downloader;
pub mod request;
pub mod response;

pub use downloader::{Downloader, Exchange, HttpDownloader, HttpOptions, Middleware, Next};
pub use request::{Meta, Request, Target};
pub use response::Response;

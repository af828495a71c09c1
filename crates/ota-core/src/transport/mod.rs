//! Transport layer module.

pub mod file;
pub mod http;
pub mod mock;
pub mod traits;

pub use file::FileTransport;
pub use http::HttpTransport;
pub use mock::{MockRead, MockTransport};
pub use traits::{CompletionPolicy, ImageTransport, StreamStep, TransportError, TransportOptions};

/// Pick a transport for `url` by scheme.
pub fn for_url(url: &str) -> Box<dyn ImageTransport> {
    if url.starts_with("file://") {
        Box::new(FileTransport::new())
    } else {
        Box::new(HttpTransport::new())
    }
}

pub mod error;
pub mod extract;
pub mod journal;
pub mod limits;
pub mod receipts;
pub mod registry;
pub mod request;
pub mod result;
pub mod status;

pub use error::{ClassifiedError, ErrorKind};
pub use request::{Credential, GenerationKind, GenerationRequest, RawGenerationRequest};
pub use status::{AssetLocator, GenerationResult, GenerationStatus, TaskHandle};

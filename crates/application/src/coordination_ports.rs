mod store;
mod transport;

pub use store::CoordinationStore;
pub use transport::{HttpTransport, TransportResponse};

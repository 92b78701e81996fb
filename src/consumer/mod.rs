pub mod session;
pub mod state;
pub mod terminal;
pub mod transport;

pub use session::ChatSession;
pub use state::{ ChatSnapshot, ChatState, ChatStatus };
pub use transport::{ ChatTransport, HttpTransport, TransportError };

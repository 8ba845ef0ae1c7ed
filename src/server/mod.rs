pub mod acceptor;
pub mod listener;
pub mod request;
pub mod response;

pub use acceptor::Acceptor;
pub use listener::bind_tcp;
pub use request::{read_request, ForwardRequest, FramingError};
pub use response::{ChannelState, ClientSink, Completion, ResponseChannel, ResponseError};

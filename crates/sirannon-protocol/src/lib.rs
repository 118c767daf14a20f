pub mod codec;
pub mod error;
pub mod message;

pub use codec::{to_change_event_json, to_execute_response, to_wire_int, MAX_SAFE_INTEGER};
pub use error::ProtocolError;
pub use message::{
    ClientMessage, DatabaseStatus, ErrorBody, ExecuteRequest, HealthResponse, QueryRequest,
    ReadyResponse, RequestId, ServerMessage, StatementRequest, TransactionRequest,
};

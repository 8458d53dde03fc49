pub use crate::{
    abi::{GuestOutput, GuestPayload, pack_ptr_len, unpack_ptr_len},
    event::{Context, Event, parse_query},
    response::{
        CONTENT_TYPE_JSON,
        CONTENT_TYPE_TEXT,
        HttpResponse,
        InvocationResult,
        ResultShapeError,
    },
};

pub mod abi;
pub mod event;
pub mod response;

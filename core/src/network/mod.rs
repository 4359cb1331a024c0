//! Wire protocol framing and the blocking transport

pub mod connection;
pub mod protocol;

pub use connection::{NetworkConnection, Transport};
pub use protocol::{
    HEADER_LEN, MAX_REPLY_SIZE, MsgHeader, OpCode, REPLY_FIELDS_LEN, Reply, ReplyFields, Request,
    delete_flags, insert_flags, query_flags, reply_flags, update_flags,
};

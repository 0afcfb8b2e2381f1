pub mod tcp_listener;
pub mod tcp_stream;

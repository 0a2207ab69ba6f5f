pub mod byte_ring;
pub mod receive_buffer;
pub mod send_buffer;
pub mod seq_window;
pub mod timed_buffer;

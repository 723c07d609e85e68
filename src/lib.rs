pub mod channel;
pub mod codec;
pub mod test_util;
pub mod transport;

pub mod stream;
pub mod transcribe;

pub use stream::stream_negotiate;
pub use transcribe::transcribe;

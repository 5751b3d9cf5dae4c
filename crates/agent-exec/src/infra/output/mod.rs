mod stream;

pub use stream::OutputStream;

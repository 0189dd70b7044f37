pub mod source;

pub use source::RelaySource;

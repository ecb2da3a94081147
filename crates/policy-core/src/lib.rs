pub mod prelude;
pub mod strng;
pub mod version;

pub use strng::Strng;
pub use version::BuildInfo;

pub mod forecast;
pub mod peak;
pub mod scenario;

pub use forecast::*;
pub use peak::*;
pub use scenario::*;

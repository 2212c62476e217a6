pub mod builders;
pub mod mock_executables;
pub mod strategies;

pub use builders::*;
pub use mock_executables::*;
pub use strategies::*;

pub mod instance;
pub mod records;
pub mod state;
pub mod status;

pub use instance::*;
pub use records::*;
pub use state::*;
pub use status::*;

pub mod errors;
pub mod hyperparams;
pub mod layout;
pub mod progress;
pub mod reports;

pub use errors::*;
pub use hyperparams::*;
pub use layout::*;
pub use progress::*;
pub use reports::*;

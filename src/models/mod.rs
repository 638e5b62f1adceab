mod approval;
mod capability;
mod step;

pub use approval::*;
pub use capability::*;
pub use step::*;

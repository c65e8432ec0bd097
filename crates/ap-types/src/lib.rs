pub mod data;
pub mod errors;
pub mod hyperparams;
pub mod metric;
pub mod pipeline;
pub mod table;

pub use data::*;
pub use errors::*;
pub use hyperparams::*;
pub use metric::*;
pub use pipeline::*;
pub use table::*;
